//! Collaborators the agent core depends on
//!
//! Each external concern is a trait injected once through
//! [`AgentServices`]. Tests swap in fakes; the CLI wires real
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::loop_events::{ApprovalAction, ApprovalRequest, ApprovalResponder, ChatEvent};
use crate::ai::streaming::ChatClient;
use crate::ai::types::{AiTool, AiToolCall};
use crate::conversation::{ConversationSink, ToolExecutionResult};
use crate::error::{AgentError, ApprovalError};

/// Receives every event the core publishes. Must not block.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ChatEvent);
}

/// Forwards events into an unbounded channel
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: ChatEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: ChatEvent) {}
}

/// Obtains a human decision for one tool call.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalAction, ApprovalError>;
}

/// Asks through the event stream and waits on the attached responder
pub struct EventApprovalService {
    events: Arc<dyn EventPublisher>,
    timeout: Duration,
}

impl EventApprovalService {
    pub fn new(events: Arc<dyn EventPublisher>, timeout: Duration) -> Self {
        Self { events, timeout }
    }
}

#[async_trait]
impl ApprovalService for EventApprovalService {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalAction, ApprovalError> {
        let (responder, rx) = ApprovalResponder::new();
        let tool = request.tool_call.name.clone();
        self.events
            .publish(ChatEvent::ToolApprovalRequested { request, responder });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(action)) => Ok(action),
            Ok(Err(_)) => Err(ApprovalError::ChannelClosed),
            Err(_) => {
                tracing::warn!(tool = %tool, timeout_secs = self.timeout.as_secs(), "Tool approval timed out");
                Err(ApprovalError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

/// Runs a single tool call to completion.
///
/// Failures are reported inside the result, never as an `Err`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &AiToolCall) -> ToolExecutionResult;

    /// Tool definitions offered to the model.
    async fn definitions(&self) -> Vec<AiTool>;
}

/// Everything a turn needs from the outside world
#[derive(Clone)]
pub struct AgentServices {
    pub chat: Arc<dyn ChatClient>,
    pub tools: Arc<dyn ToolExecutor>,
    pub approvals: Arc<dyn ApprovalService>,
    pub conversation: Arc<dyn ConversationSink>,
    pub events: Arc<dyn EventPublisher>,
}

impl AgentServices {
    pub fn builder() -> AgentServicesBuilder {
        AgentServicesBuilder::default()
    }
}

/// Builder that refuses to produce services with a missing collaborator
#[derive(Default)]
pub struct AgentServicesBuilder {
    chat: Option<Arc<dyn ChatClient>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    approvals: Option<Arc<dyn ApprovalService>>,
    conversation: Option<Arc<dyn ConversationSink>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl AgentServicesBuilder {
    pub fn chat(mut self, chat: Arc<dyn ChatClient>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn approvals(mut self, approvals: Arc<dyn ApprovalService>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn conversation(mut self, conversation: Arc<dyn ConversationSink>) -> Self {
        self.conversation = Some(conversation);
        self
    }

    /// Optional; defaults to [`NoopPublisher`].
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<AgentServices, AgentError> {
        Ok(AgentServices {
            chat: self.chat.ok_or(AgentError::MissingDependency("chat client"))?,
            tools: self.tools.ok_or(AgentError::MissingDependency("tool executor"))?,
            approvals: self
                .approvals
                .ok_or(AgentError::MissingDependency("approval service"))?,
            conversation: self
                .conversation
                .ok_or(AgentError::MissingDependency("conversation sink"))?,
            events: self.events.unwrap_or_else(|| Arc::new(NoopPublisher)),
        })
    }
}
