use std::sync::Arc;

use super::{unexpected, StateHandler, TurnContext};
use crate::agent::approval::{AgentMode, AutoAcceptPolicy};
use crate::agent::context::ToolDecision;
use crate::agent::events::AgentEvent;
use crate::agent::loop_events::{ApprovalAction, ApprovalRequest, ChatEvent};
use crate::agent::state::AgentExecutionState;
use crate::conversation::ToolCallStatus;
use crate::error::AgentError;

const REJECTED_BY_USER: &str = "rejected by user";

/// Resolves approvals one call at a time, in emission order
pub struct WaitingApprovalHandler;

/// Ask about the first call still waiting on a decision.
pub(super) fn request_next_approval(turn: &TurnContext) {
    let Some(&index) = turn.state.approvals_pending.front() else {
        return;
    };
    let Some(call) = turn.agent.tool_calls.get(index) else {
        return;
    };

    let request = ApprovalRequest {
        request_id: turn.agent.request_id.clone(),
        tool_call: call.clone(),
        index,
        total: turn.agent.tool_calls.len(),
    };
    tracing::debug!(request_id = %request.request_id, tool = %call.name, index, "Requesting approval");

    let approvals = turn.services.approvals.clone();
    let cancel = turn.worker_cancel();
    turn.spawn_worker(async move {
        tokio::select! {
            result = approvals.request_approval(request) => Some(match result {
                Ok(action) => AgentEvent::ApprovalResolved { index, action },
                Err(e) => AgentEvent::ApprovalFailed { index, error: e.to_string() },
            }),
            _ = cancel.cancelled() => None,
        }
    });
}

impl WaitingApprovalHandler {
    /// True if `index` is the call we are waiting on; consumes it.
    fn take_pending(&self, turn: &mut TurnContext, index: usize) -> bool {
        if turn.state.approvals_pending.front() != Some(&index) {
            tracing::warn!(index, "Approval result for a call that is not pending");
            return false;
        }
        turn.state.approvals_pending.pop_front();
        true
    }

    fn approve(&self, turn: &mut TurnContext, index: usize) {
        turn.state.decisions[index] = ToolDecision::Approved;
        let id = turn.agent.tool_calls[index].id.clone();
        turn.publish(ChatEvent::ToolApproved { id });
    }

    fn deny(&self, turn: &mut TurnContext, index: usize, reason: String) {
        turn.state.decisions[index] = ToolDecision::Denied {
            reason: reason.clone(),
        };
        turn.state.set_status(index, ToolCallStatus::Denied);
        let id = turn.agent.tool_calls[index].id.clone();
        turn.publish(ChatEvent::ToolDenied { id, reason });
    }

    fn advance(&self, turn: &mut TurnContext) -> Result<(), AgentError> {
        if turn.state.approvals_pending.is_empty() {
            turn.transition(AgentExecutionState::ExecutingTools)?;
            turn.enqueue(AgentEvent::ProcessNextTool { index: 0 });
        } else {
            request_next_approval(turn);
        }
        Ok(())
    }
}

impl StateHandler for WaitingApprovalHandler {
    fn name(&self) -> AgentExecutionState {
        AgentExecutionState::WaitingApproval
    }

    fn handle(&self, event: AgentEvent, turn: &mut TurnContext) -> Result<(), AgentError> {
        match event {
            AgentEvent::ApprovalResolved { index, action } => {
                if !self.take_pending(turn, index) {
                    return Ok(());
                }
                tracing::info!(request_id = %turn.agent.request_id, index, action = ?action, "Approval resolved");

                match action {
                    ApprovalAction::Approve => self.approve(turn, index),
                    ApprovalAction::Reject => self.deny(turn, index, REJECTED_BY_USER.to_string()),
                    ApprovalAction::AutoAcceptAll => {
                        self.approve(turn, index);
                        let remaining: Vec<usize> = turn.state.approvals_pending.drain(..).collect();
                        for index in remaining {
                            self.approve(turn, index);
                        }
                        turn.agent.policy = Arc::new(AutoAcceptPolicy);
                        turn.publish(ChatEvent::ModeChanged {
                            mode: AgentMode::AutoAccept,
                        });
                    }
                }
                self.advance(turn)
            }
            AgentEvent::ApprovalFailed { index, error } => {
                if !self.take_pending(turn, index) {
                    return Ok(());
                }
                tracing::warn!(request_id = %turn.agent.request_id, index, error = %error, "Approval failed, treating as denied");
                self.deny(turn, index, error);
                self.advance(turn)
            }
            other => {
                unexpected(self.name(), &other);
                Ok(())
            }
        }
    }
}
