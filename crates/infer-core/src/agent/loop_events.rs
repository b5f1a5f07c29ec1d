//! Canonical event protocol between the agent core and its front end.
//!
//! `ChatEvent` is everything the core publishes. Front ends (the CLI REPL,
//! a batch runner, tests) consume these and never reach into core state.
//! The only event that expects an answer is `ToolApprovalRequested`, which
//! carries a one-shot responder.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::approval::AgentMode;
use super::state::AgentExecutionState;
use crate::ai::types::{AiToolCall, Usage};
use crate::shells::ShellInfo;

/// User's answer to an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    /// Approve this call and stop asking for the rest of the turn.
    AutoAcceptAll,
}

/// What the user is being asked to approve.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub tool_call: AiToolCall,
    /// Position of the call within the model's response.
    pub index: usize,
    pub total: usize,
}

/// One-shot reply handle attached to an approval event.
///
/// Cloneable so the event stays `Clone`; only the first `respond` wins.
#[derive(Clone, Default)]
pub struct ApprovalResponder {
    tx: Arc<Mutex<Option<oneshot::Sender<ApprovalAction>>>>,
}

impl ApprovalResponder {
    pub fn new() -> (Self, oneshot::Receiver<ApprovalAction>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver the decision. Returns false if already answered or the
    /// requester stopped waiting.
    pub fn respond(&self, action: ApprovalAction) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(action).is_ok(),
            None => false,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl std::fmt::Debug for ApprovalResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalResponder")
            .field("answered", &self.is_answered())
            .finish()
    }
}

/// Events published by the agent core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    // ── Streaming ──────────────────────────────────────────────────────
    StreamStarted {
        request_id: String,
        turn: usize,
    },

    TextDelta {
        delta: String,
    },

    ReasoningDelta {
        delta: String,
    },

    /// Model started emitting a tool call; arguments still streaming.
    ToolCallPreview {
        id: String,
        name: String,
    },

    /// Tool call arguments fully received.
    ToolCallReady {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    StreamCompleted {
        request_id: String,
        tool_calls: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    StreamError {
        request_id: String,
        error: String,
    },

    // ── Tool lifecycle ─────────────────────────────────────────────────
    ToolApprovalRequested {
        request: ApprovalRequest,
        #[serde(skip)]
        responder: ApprovalResponder,
    },

    ToolApproved {
        id: String,
    },

    ToolDenied {
        id: String,
        reason: String,
    },

    ToolExecuting {
        id: String,
        name: String,
    },

    ToolCompleted {
        id: String,
        name: String,
        output: String,
        duration_ms: u64,
    },

    ToolFailed {
        id: String,
        name: String,
        error: String,
        duration_ms: u64,
    },

    // ── Turn lifecycle ─────────────────────────────────────────────────
    StateTransition {
        from: AgentExecutionState,
        to: AgentExecutionState,
    },

    ModeChanged {
        mode: AgentMode,
    },

    /// Messages typed during the turn were folded into the conversation.
    QueueDrained {
        count: usize,
    },

    TurnLimitReached {
        max_turns: usize,
    },

    Completed {
        request_id: String,
        turns: usize,
    },

    Cancelled {
        request_id: String,
    },

    Error {
        request_id: String,
        error: String,
    },

    // ── Background shells ──────────────────────────────────────────────
    ShellDetached {
        shell: ShellInfo,
    },

    ShellCompleted {
        id: String,
        exit_code: Option<i32>,
    },

    ShellFailed {
        id: String,
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    ShellCancelled {
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_first_answer_wins() {
        let (responder, mut rx) = ApprovalResponder::new();
        let clone = responder.clone();
        assert!(responder.respond(ApprovalAction::Reject));
        assert!(!clone.respond(ApprovalAction::Approve));
        assert!(clone.is_answered());
        assert_eq!(rx.try_recv().unwrap(), ApprovalAction::Reject);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = ChatEvent::StateTransition {
            from: AgentExecutionState::Idle,
            to: AgentExecutionState::Streaming,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_transition");
        assert_eq!(json["to"], "streaming");

        let (responder, _rx) = ApprovalResponder::new();
        let event = ChatEvent::ToolApprovalRequested {
            request: ApprovalRequest {
                request_id: "r1".into(),
                tool_call: AiToolCall {
                    id: "c1".into(),
                    name: "write".into(),
                    arguments: serde_json::json!({}),
                },
                index: 0,
                total: 1,
            },
            responder,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_approval_requested");
        assert_eq!(json["request"]["tool_call"]["name"], "write");
        assert!(json.get("responder").is_none());
    }
}
