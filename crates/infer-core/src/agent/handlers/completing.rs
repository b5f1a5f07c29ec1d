use super::{unexpected, StateHandler, TurnContext};
use crate::agent::events::AgentEvent;
use crate::agent::loop_events::ChatEvent;
use crate::agent::state::AgentExecutionState;
use crate::error::AgentError;

pub struct CompletingHandler;

impl StateHandler for CompletingHandler {
    fn name(&self) -> AgentExecutionState {
        AgentExecutionState::Completing
    }

    fn handle(&self, event: AgentEvent, turn: &mut TurnContext) -> Result<(), AgentError> {
        if !matches!(event, AgentEvent::CompletionRequested) {
            unexpected(self.name(), &event);
            return Ok(());
        }

        tracing::info!(
            request_id = %turn.agent.request_id,
            turns = turn.agent.turns,
            "Turn completed"
        );
        turn.publish(ChatEvent::Completed {
            request_id: turn.agent.request_id.clone(),
            turns: turn.agent.turns,
        });
        turn.transition(AgentExecutionState::Completed)
    }
}
