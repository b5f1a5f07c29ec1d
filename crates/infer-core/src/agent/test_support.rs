//! Fakes for exercising the agent core without a model or real tools

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::approval::StandardPolicy;
use super::context::AgentContext;
use super::loop_events::{ApprovalAction, ApprovalRequest, ChatEvent};
use super::services::{ApprovalService, EventPublisher, ToolExecutor};
use super::state::AgentExecutionState;
use crate::ai::streaming::{ChatClient, ChatRequest, StreamPart};
use crate::ai::types::{AiTool, AiToolCall, FinishReason, Usage};
use crate::conversation::{InMemoryConversation, ToolExecutionResult};
use crate::error::ApprovalError;

pub fn context() -> AgentContext {
    AgentContext::new(
        "req-1",
        Arc::new(InMemoryConversation::new()),
        Arc::new(StandardPolicy::default()),
        10,
    )
}

pub fn tool_call(id: &str, name: &str) -> AiToolCall {
    AiToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: json!({}),
    }
}

/// One scripted model response
#[derive(Debug, Clone, Default)]
pub struct Script {
    text: String,
    reasoning: String,
    tools: Vec<AiToolCall>,
    error: Option<String>,
    hang: bool,
    fail_start: bool,
}

impl Script {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// Tool calls with empty arguments and no text.
    pub fn tools(calls: &[(&str, &str)]) -> Self {
        Self {
            tools: calls.iter().map(|(id, name)| tool_call(id, name)).collect(),
            ..Default::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Open a stream that never produces anything.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    /// Refuse to open the stream at all.
    pub fn fail_start() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = reasoning.to_string();
        self
    }

    pub fn with_tool(mut self, id: &str, name: &str, arguments: Value) -> Self {
        self.tools.push(AiToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        });
        self
    }
}

/// Chat backend replaying scripts in order
pub struct FakeChat {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
    /// Senders of hanging streams, kept so the receivers stay open
    held: Mutex<Vec<mpsc::UnboundedSender<StreamPart>>>,
}

impl FakeChat {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn stream(
        &self,
        request: ChatRequest,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<StreamPart>> {
        self.requests.lock().push(request);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted response left"))?;
        if script.fail_start {
            anyhow::bail!("connection refused");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if script.hang {
            self.held.lock().push(tx);
            return Ok(rx);
        }

        if !script.reasoning.is_empty() {
            let _ = tx.send(StreamPart::ReasoningDelta {
                delta: script.reasoning,
            });
        }
        if !script.text.is_empty() {
            let _ = tx.send(StreamPart::TextDelta { delta: script.text });
        }
        let finish = if script.tools.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        for call in script.tools {
            let _ = tx.send(StreamPart::ToolCallStart {
                id: call.id.clone(),
                name: call.name.clone(),
            });
            let _ = tx.send(StreamPart::ToolCallComplete { tool_call: call });
        }
        match script.error {
            Some(error) => {
                let _ = tx.send(StreamPart::Error { error });
            }
            None => {
                let _ = tx.send(StreamPart::Usage {
                    usage: Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    },
                });
                let _ = tx.send(StreamPart::Finish { reason: finish });
            }
        }
        Ok(rx)
    }
}

/// Tool executor answering `ok: <name>` after an optional per-call delay
#[derive(Default)]
pub struct FakeTools {
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    started: Mutex<Vec<String>>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, call_id: &str, delay: Duration) -> Self {
        self.delays.insert(call_id.to_string(), delay);
        self
    }

    pub fn failing(mut self, call_id: &str) -> Self {
        self.failing.insert(call_id.to_string());
        self
    }

    /// Call ids in the order execution began.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeTools {
    async fn execute(&self, call: &AiToolCall) -> ToolExecutionResult {
        self.started.lock().push(call.id.clone());
        let delay = self.delays.get(&call.id).copied().unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&call.id) {
            return ToolExecutionResult::failed(call, "tool exploded", delay);
        }
        ToolExecutionResult::completed(call, format!("ok: {}", call.name), delay)
    }

    async fn definitions(&self) -> Vec<AiTool> {
        ["read", "write", "bash"]
            .into_iter()
            .map(|name| AiTool {
                name: name.to_string(),
                description: format!("fake {name}"),
                input_schema: json!({"type": "object"}),
            })
            .collect()
    }
}

/// Approval service answering from a script
pub struct ScriptedApprovals {
    answers: Mutex<VecDeque<Result<ApprovalAction, ApprovalError>>>,
    requests: Mutex<Vec<ApprovalRequest>>,
    hang: bool,
}

impl ScriptedApprovals {
    pub fn new(answers: Vec<Result<ApprovalAction, ApprovalError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            requests: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(vec![])
        }
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ApprovalService for ScriptedApprovals {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalAction, ApprovalError> {
        self.requests.lock().push(request);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.answers
            .lock()
            .pop_front()
            .unwrap_or(Err(ApprovalError::ChannelClosed))
    }
}

/// Publisher remembering everything it saw
#[derive(Default)]
pub struct CollectingPublisher {
    events: Mutex<Vec<ChatEvent>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChatEvent> {
        self.events.lock().clone()
    }

    pub fn transitions(&self) -> Vec<(AgentExecutionState, AgentExecutionState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ChatEvent::StateTransition { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }
}

impl EventPublisher for CollectingPublisher {
    fn publish(&self, event: ChatEvent) {
        self.events.lock().push(event);
    }
}
