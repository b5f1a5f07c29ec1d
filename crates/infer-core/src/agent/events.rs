//! Internal events that drive the state machine
//!
//! Handlers and worker tasks communicate with the dispatch loop only through
//! these; nothing else mutates turn state.

use super::loop_events::ApprovalAction;
use crate::ai::types::{AiToolCall, ModelMessage, Usage};
use crate::conversation::ConversationEntry;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A user message arrived (or `None` to resume from the queue alone).
    MessageReceived { message: Option<ModelMessage> },

    StartStreaming,

    /// The model finished a response.
    StreamCompleted {
        message: ModelMessage,
        tool_calls: Vec<AiToolCall>,
        reasoning: String,
        usage: Option<Usage>,
    },

    StreamFailed { error: String },

    /// Process the tool call at `index`.
    ProcessNextTool { index: usize },

    /// The user answered an approval prompt.
    ApprovalResolved { index: usize, action: ApprovalAction },

    ApprovalFailed { index: usize, error: String },

    ToolsCompleted { results: Vec<ConversationEntry> },

    AllToolsProcessed,

    CompletionRequested,
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::MessageReceived { .. } => "message_received",
            AgentEvent::StartStreaming => "start_streaming",
            AgentEvent::StreamCompleted { .. } => "stream_completed",
            AgentEvent::StreamFailed { .. } => "stream_failed",
            AgentEvent::ProcessNextTool { .. } => "process_next_tool",
            AgentEvent::ApprovalResolved { .. } => "approval_resolved",
            AgentEvent::ApprovalFailed { .. } => "approval_failed",
            AgentEvent::ToolsCompleted { .. } => "tools_completed",
            AgentEvent::AllToolsProcessed => "all_tools_processed",
            AgentEvent::CompletionRequested => "completion_requested",
        }
    }
}
