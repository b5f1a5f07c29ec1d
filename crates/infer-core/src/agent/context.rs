//! Per-request state threaded through the handlers

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::approval::ApprovalPolicy;
use crate::ai::types::{AiTool, AiToolCall, ModelMessage, Usage};
use crate::conversation::{ConversationEntry, ConversationSink, ToolCallStatus};
use crate::error::AgentError;

/// Messages submitted while a turn is running.
///
/// Drained as a batch at the start of a turn and after each tool batch,
/// never in the middle of a stream.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<ModelMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ModelMessage) {
        self.inner.lock().push_back(message);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Take everything queued, oldest first.
    pub fn drain_all(&self) -> Vec<ModelMessage> {
        self.inner.lock().drain(..).collect()
    }
}

/// What the machine knows about the request; read by transition guards
pub struct AgentContext {
    pub request_id: String,
    /// Conversation as sent to the model, oldest first
    pub messages: Vec<ConversationEntry>,
    pub conversation: Arc<dyn ConversationSink>,
    pub queue: Arc<MessageQueue>,
    /// Outstanding tool calls from the latest response
    pub tool_calls: Vec<AiToolCall>,
    /// Streaming rounds started so far
    pub turns: usize,
    pub max_turns: usize,
    pub has_pending_tool_results: bool,
    pub policy: Arc<dyn ApprovalPolicy>,
    pub cancel: CancellationToken,
    /// Interactive chat (a user can answer prompts) vs unattended batch
    pub is_chat_mode: bool,
}

impl AgentContext {
    pub fn new(
        request_id: impl Into<String>,
        conversation: Arc<dyn ConversationSink>,
        policy: Arc<dyn ApprovalPolicy>,
        max_turns: usize,
    ) -> Self {
        let messages = conversation.messages();
        Self {
            request_id: request_id.into(),
            messages,
            conversation,
            queue: Arc::new(MessageQueue::new()),
            tool_calls: Vec::new(),
            turns: 0,
            max_turns,
            has_pending_tool_results: false,
            policy,
            cancel: CancellationToken::new(),
            is_chat_mode: true,
        }
    }

    pub fn with_queue(mut self, queue: Arc<MessageQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn batch_mode(mut self) -> Self {
        self.is_chat_mode = false;
        self
    }

    pub fn max_turns_reached(&self) -> bool {
        self.turns >= self.max_turns
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Append to the local history and the sink.
    pub fn record(&mut self, entry: ConversationEntry) -> Result<(), AgentError> {
        self.conversation
            .add_message(entry.clone())
            .map_err(|e| AgentError::Sink(e.to_string()))?;
        self.messages.push(entry);
        Ok(())
    }

    /// Move queued user messages into the conversation. Returns how many.
    pub fn drain_queue(&mut self) -> Result<usize, AgentError> {
        let queued = self.queue.drain_all();
        let count = queued.len();
        for message in queued {
            self.record(ConversationEntry::new(message))?;
        }
        Ok(count)
    }

    /// Messages to send on the next model call.
    pub fn model_messages(&self) -> Vec<ModelMessage> {
        self.messages.iter().map(|e| e.message.clone()).collect()
    }
}

/// Decision for one tool call of the current batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDecision {
    NotRequired,
    Pending,
    Approved,
    Denied { reason: String },
}

impl ToolDecision {
    pub fn may_execute(&self) -> bool {
        matches!(self, ToolDecision::NotRequired | ToolDecision::Approved)
    }
}

/// Scratch space for one in-flight turn; owned by the dispatch loop
#[derive(Debug, Default)]
pub struct TurnState {
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub tool_definitions: Vec<AiTool>,
    /// Assistant text accumulated for the current stream
    pub current_message: Option<ModelMessage>,
    pub reasoning: String,
    pub usage: Option<Usage>,
    /// Indices still waiting on a human, in emission order
    pub approvals_pending: VecDeque<usize>,
    pub decisions: Vec<ToolDecision>,
    /// Lifecycle of each call in the batch, by emission index
    pub statuses: Vec<ToolCallStatus>,
    pub current_tool_index: usize,
    /// Result entries recorded during the current tool batch
    pub results: Vec<ConversationEntry>,
    /// Correlation ids carried across turns
    pub task_id: Option<String>,
    pub context_id: Option<String>,
}

impl TurnState {
    /// Clear per-batch fields before a new set of tool calls.
    pub fn reset_batch(&mut self, tool_count: usize) {
        self.approvals_pending.clear();
        self.decisions = vec![ToolDecision::NotRequired; tool_count];
        self.statuses = vec![ToolCallStatus::Pending; tool_count];
        self.current_tool_index = 0;
        self.results.clear();
    }

    pub fn status(&self, index: usize) -> Option<ToolCallStatus> {
        self.statuses.get(index).copied()
    }

    /// Move call `index` to `status`. A final status never changes.
    pub fn set_status(&mut self, index: usize, status: ToolCallStatus) -> bool {
        match self.statuses.get_mut(index) {
            Some(current) if !current.is_final() => {
                *current = status;
                true
            }
            Some(current) => *current == status,
            None => false,
        }
    }

    /// True once a result entry for `tool_call_id` is in this batch.
    pub fn has_result(&self, tool_call_id: &str) -> bool {
        self.results.iter().any(|entry| {
            entry
                .tool_execution
                .as_ref()
                .is_some_and(|r| r.tool_call_id == tool_call_id)
        })
    }
}
