use super::{StateHandler, TurnContext};
use crate::agent::events::AgentEvent;
use crate::agent::state::AgentExecutionState;
use crate::error::AgentError;

/// Shared by `Completed`, `Error` and `Cancelled`: nothing happens any more
pub struct TerminalHandler {
    state: AgentExecutionState,
}

impl TerminalHandler {
    pub fn new(state: AgentExecutionState) -> Self {
        Self { state }
    }
}

impl StateHandler for TerminalHandler {
    fn name(&self) -> AgentExecutionState {
        self.state
    }

    fn handle(&self, event: AgentEvent, _turn: &mut TurnContext) -> Result<(), AgentError> {
        tracing::debug!(state = %self.state, event = event.name(), "Event after turn ended");
        Ok(())
    }
}
