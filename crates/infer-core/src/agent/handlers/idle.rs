use super::{unexpected, StateHandler, TurnContext};
use crate::agent::events::AgentEvent;
use crate::agent::loop_events::ChatEvent;
use crate::agent::state::AgentExecutionState;
use crate::conversation::ConversationEntry;
use crate::error::AgentError;

/// Waiting for input; a message starts the turn
pub struct IdleHandler;

impl StateHandler for IdleHandler {
    fn name(&self) -> AgentExecutionState {
        AgentExecutionState::Idle
    }

    fn handle(&self, event: AgentEvent, turn: &mut TurnContext) -> Result<(), AgentError> {
        let message = match event {
            AgentEvent::MessageReceived { message } => message,
            other => {
                unexpected(self.name(), &other);
                return Ok(());
            }
        };

        if let Some(message) = message {
            turn.agent.record(ConversationEntry::new(message))?;
        }

        let drained = turn.agent.drain_queue()?;
        if drained > 0 {
            tracing::info!(request_id = %turn.agent.request_id, count = drained, "Drained queued messages");
            turn.publish(ChatEvent::QueueDrained { count: drained });
        }

        turn.transition(AgentExecutionState::Streaming)?;
        turn.enqueue(AgentEvent::StartStreaming);
        Ok(())
    }
}
