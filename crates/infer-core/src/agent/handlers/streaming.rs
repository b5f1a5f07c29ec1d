use super::{unexpected, StateHandler, TurnContext};
use crate::agent::events::AgentEvent;
use crate::agent::loop_events::ChatEvent;
use crate::agent::state::AgentExecutionState;
use crate::agent::stream::run_stream;
use crate::ai::streaming::ChatRequest;
use crate::conversation::ConversationEntry;
use crate::error::AgentError;

/// Owns one model call: starts it, then folds in its result
pub struct StreamingHandler;

impl StreamingHandler {
    fn start(&self, turn: &mut TurnContext) {
        turn.agent.turns += 1;
        turn.agent.has_pending_tool_results = false;
        turn.agent.tool_calls.clear();
        turn.state.current_message = None;
        turn.state.reasoning.clear();

        let request_id = turn.agent.request_id.clone();
        tracing::info!(request_id = %request_id, turn = turn.agent.turns, "Starting stream");
        turn.publish(ChatEvent::StreamStarted {
            request_id: request_id.clone(),
            turn: turn.agent.turns,
        });

        let request = ChatRequest {
            request_id,
            provider: turn.state.provider.clone(),
            model: turn.state.model.clone(),
            system_prompt: turn.state.system_prompt.clone(),
            messages: turn.agent.model_messages(),
            tools: turn.state.tool_definitions.clone(),
        };
        turn.spawn_worker(run_stream(
            turn.services.chat.clone(),
            request,
            turn.services.events.clone(),
            turn.stream_timeout,
            turn.worker_cancel(),
        ));
    }
}

impl StateHandler for StreamingHandler {
    fn name(&self) -> AgentExecutionState {
        AgentExecutionState::Streaming
    }

    fn handle(&self, event: AgentEvent, turn: &mut TurnContext) -> Result<(), AgentError> {
        match event {
            AgentEvent::StartStreaming => {
                self.start(turn);
                Ok(())
            }
            AgentEvent::StreamCompleted {
                message,
                tool_calls,
                reasoning,
                usage,
            } => {
                turn.agent.record(ConversationEntry::new(message.clone()))?;
                turn.state.current_message = Some(message);
                turn.state.reasoning = reasoning;
                turn.state.usage = usage.clone();
                turn.agent.tool_calls = tool_calls;
                turn.state.reset_batch(turn.agent.tool_calls.len());

                turn.publish(ChatEvent::StreamCompleted {
                    request_id: turn.agent.request_id.clone(),
                    tool_calls: turn.agent.tool_calls.len(),
                    usage,
                });

                if turn.agent.tool_calls.is_empty() {
                    turn.transition(AgentExecutionState::Completing)?;
                    turn.enqueue(AgentEvent::CompletionRequested);
                } else {
                    turn.transition(AgentExecutionState::ToolsPending)?;
                    turn.enqueue(AgentEvent::ProcessNextTool { index: 0 });
                }
                Ok(())
            }
            AgentEvent::StreamFailed { error } => {
                tracing::warn!(request_id = %turn.agent.request_id, error = %error, "Stream failed");
                turn.publish(ChatEvent::StreamError {
                    request_id: turn.agent.request_id.clone(),
                    error: error.clone(),
                });
                Err(AgentError::Stream(error))
            }
            other => {
                unexpected(self.name(), &other);
                Ok(())
            }
        }
    }
}
