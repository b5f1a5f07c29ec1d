use super::waiting_approval::request_next_approval;
use super::{unexpected, StateHandler, TurnContext};
use crate::agent::context::ToolDecision;
use crate::agent::events::AgentEvent;
use crate::agent::state::AgentExecutionState;
use crate::conversation::ToolCallStatus;
use crate::error::AgentError;

/// Sorts a fresh batch of tool calls into "ask first" and "just run"
pub struct ToolsPendingHandler;

impl StateHandler for ToolsPendingHandler {
    fn name(&self) -> AgentExecutionState {
        AgentExecutionState::ToolsPending
    }

    fn handle(&self, event: AgentEvent, turn: &mut TurnContext) -> Result<(), AgentError> {
        if !matches!(event, AgentEvent::ProcessNextTool { .. }) {
            unexpected(self.name(), &event);
            return Ok(());
        }

        // Batch fields were reset when the calls arrived
        for (index, call) in turn.agent.tool_calls.iter().enumerate() {
            if turn
                .agent
                .policy
                .should_require_approval(call, turn.agent.is_chat_mode)
            {
                turn.state.decisions[index] = ToolDecision::Pending;
                turn.state.set_status(index, ToolCallStatus::WaitingApproval);
                turn.state.approvals_pending.push_back(index);
            }
        }

        tracing::debug!(
            request_id = %turn.agent.request_id,
            tools = turn.agent.tool_calls.len(),
            needs_approval = turn.state.approvals_pending.len(),
            policy = turn.agent.policy.name(),
            "Tool batch evaluated"
        );

        if turn.state.approvals_pending.is_empty() {
            turn.transition(AgentExecutionState::ExecutingTools)?;
            turn.enqueue(AgentEvent::ProcessNextTool { index: 0 });
        } else {
            turn.transition(AgentExecutionState::WaitingApproval)?;
            request_next_approval(turn);
        }
        Ok(())
    }
}
