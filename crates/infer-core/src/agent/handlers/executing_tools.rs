use super::{unexpected, StateHandler, TurnContext};
use crate::agent::context::ToolDecision;
use crate::agent::events::AgentEvent;
use crate::agent::loop_events::ChatEvent;
use crate::agent::state::AgentExecutionState;
use crate::ai::types::{ModelMessage, Role};
use crate::conversation::{ConversationEntry, ToolCallStatus, ToolExecutionResult};
use crate::error::AgentError;

/// Runs the batch strictly one call at a time, in emission order
pub struct ExecutingToolsHandler;

impl ExecutingToolsHandler {
    fn process(&self, turn: &mut TurnContext, index: usize) {
        if turn.agent.is_cancelled() {
            tracing::debug!(index, "Cancelled before starting tool");
            return;
        }

        turn.state.current_tool_index = index;
        let Some(call) = turn.agent.tool_calls.get(index).cloned() else {
            turn.enqueue(AgentEvent::AllToolsProcessed);
            return;
        };

        let decision = turn
            .state
            .decisions
            .get(index)
            .cloned()
            .unwrap_or(ToolDecision::NotRequired);
        if !decision.may_execute() {
            let reason = match decision {
                ToolDecision::Denied { reason } => reason,
                _ => "not approved".to_string(),
            };
            let result = ToolExecutionResult::denied(&call, reason);
            turn.enqueue(AgentEvent::ToolsCompleted {
                results: vec![ConversationEntry::tool_result(result)],
            });
            return;
        }

        turn.state.set_status(index, ToolCallStatus::Executing);

        tracing::info!(request_id = %turn.agent.request_id, tool = %call.name, index, "Executing tool");
        turn.publish(ChatEvent::ToolExecuting {
            id: call.id.clone(),
            name: call.name.clone(),
        });

        // Not tied to cancellation: a tool that started is allowed to finish
        let tools = turn.services.tools.clone();
        turn.spawn_worker(async move {
            let result = tools.execute(&call).await;
            Some(AgentEvent::ToolsCompleted {
                results: vec![ConversationEntry::tool_result(result)],
            })
        });
    }

    fn record_results(
        &self,
        turn: &mut TurnContext,
        results: Vec<ConversationEntry>,
    ) -> Result<(), AgentError> {
        for entry in results {
            if let Some(exec) = &entry.tool_execution {
                let duration_ms = exec.duration.as_millis() as u64;
                match exec.status {
                    ToolCallStatus::Completed => turn.publish(ChatEvent::ToolCompleted {
                        id: exec.tool_call_id.clone(),
                        name: exec.tool_name.clone(),
                        output: exec.output.clone(),
                        duration_ms,
                    }),
                    ToolCallStatus::Failed | ToolCallStatus::Cancelled => {
                        turn.publish(ChatEvent::ToolFailed {
                            id: exec.tool_call_id.clone(),
                            name: exec.tool_name.clone(),
                            error: exec.error.clone().unwrap_or_default(),
                            duration_ms,
                        })
                    }
                    // Denials were announced when decided
                    _ => {}
                }
            }
            turn.record_tool_result(entry)?;
        }
        turn.agent.has_pending_tool_results = true;
        Ok(())
    }

    fn finish_batch(&self, turn: &mut TurnContext) -> Result<(), AgentError> {
        let drained = turn.agent.drain_queue()?;
        if drained > 0 {
            turn.publish(ChatEvent::QueueDrained { count: drained });
        }

        if turn.agent.max_turns_reached() {
            let max_turns = turn.agent.max_turns;
            tracing::warn!(request_id = %turn.agent.request_id, max_turns, "Turn limit reached");
            turn.agent.record(ConversationEntry::new(ModelMessage::text(
                Role::Assistant,
                format!(
                    "[Stopped after reaching the maximum of {} turns. The task may be incomplete.]",
                    max_turns
                ),
            )))?;
            turn.publish(ChatEvent::TurnLimitReached { max_turns });
            turn.transition(AgentExecutionState::Completing)?;
            turn.enqueue(AgentEvent::CompletionRequested);
        } else {
            turn.transition(AgentExecutionState::Streaming)?;
            turn.enqueue(AgentEvent::StartStreaming);
        }
        Ok(())
    }
}

impl StateHandler for ExecutingToolsHandler {
    fn name(&self) -> AgentExecutionState {
        AgentExecutionState::ExecutingTools
    }

    fn handle(&self, event: AgentEvent, turn: &mut TurnContext) -> Result<(), AgentError> {
        match event {
            AgentEvent::ProcessNextTool { index } => {
                self.process(turn, index);
                Ok(())
            }
            AgentEvent::ToolsCompleted { results } => {
                self.record_results(turn, results)?;
                let next = turn.state.current_tool_index + 1;
                turn.enqueue(AgentEvent::ProcessNextTool { index: next });
                Ok(())
            }
            AgentEvent::AllToolsProcessed => self.finish_batch(turn),
            other => {
                unexpected(self.name(), &other);
                Ok(())
            }
        }
    }
}
