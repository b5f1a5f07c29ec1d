//! Stream processing for one model call.
//!
//! Consumes `StreamPart`s from the chat client and:
//! - Accumulates text, reasoning, and tool calls
//! - Republishes deltas as `ChatEvent`s
//! - Gives up after a period with no data

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::events::AgentEvent;
use super::loop_events::ChatEvent;
use super::services::EventPublisher;
use crate::ai::streaming::{ChatClient, ChatRequest, StreamPart};
use crate::ai::types::{AiToolCall, ModelMessage, Usage};

/// Run one streaming call and fold it into the event that reports it.
///
/// Returns `None` when cancelled; the dispatch loop is already tearing down.
pub(crate) async fn run_stream(
    chat: Arc<dyn ChatClient>,
    request: ChatRequest,
    events: Arc<dyn EventPublisher>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> Option<AgentEvent> {
    let request_id = request.request_id.clone();
    let mut rx = tokio::select! {
        result = chat.stream(request) => match result {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to start stream");
                return Some(AgentEvent::StreamFailed { error: format!("{e:#}") });
            }
        },
        _ = cancel.cancelled() => return None,
    };

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<AiToolCall> = Vec::new();
    let mut usage: Option<Usage> = None;

    loop {
        let part = tokio::select! {
            part = tokio::time::timeout(idle_timeout, rx.recv()) => part,
            _ = cancel.cancelled() => {
                tracing::debug!(request_id = %request_id, "Stream cancelled");
                return None;
            }
        };

        let part = match part {
            Ok(Some(part)) => part,
            Ok(None) => break,
            Err(_) => {
                return Some(AgentEvent::StreamFailed {
                    error: format!(
                        "stream timeout: no data received for {} seconds",
                        idle_timeout.as_secs()
                    ),
                });
            }
        };

        match part {
            StreamPart::TextDelta { delta } => {
                text.push_str(&delta);
                events.publish(ChatEvent::TextDelta { delta });
            }
            StreamPart::ReasoningDelta { delta } => {
                reasoning.push_str(&delta);
                events.publish(ChatEvent::ReasoningDelta { delta });
            }
            StreamPart::ToolCallStart { id, name } => {
                events.publish(ChatEvent::ToolCallPreview { id, name });
            }
            StreamPart::ToolCallDelta { .. } => {}
            StreamPart::ToolCallComplete { tool_call } => {
                events.publish(ChatEvent::ToolCallReady {
                    id: tool_call.id.clone(),
                    name: tool_call.name.clone(),
                    arguments: tool_call.arguments.clone(),
                });
                tool_calls.push(tool_call);
            }
            StreamPart::Usage { usage: u } => usage = Some(u),
            StreamPart::Finish { reason } => {
                tracing::debug!(request_id = %request_id, reason = ?reason, "Stream finished");
            }
            StreamPart::Error { error } => {
                return Some(AgentEvent::StreamFailed { error });
            }
        }
    }

    tracing::info!(
        request_id = %request_id,
        text_len = text.len(),
        tool_calls = tool_calls.len(),
        "Stream completed"
    );

    Some(AgentEvent::StreamCompleted {
        message: ModelMessage::assistant(&text, &reasoning, &tool_calls),
        tool_calls,
        reasoning,
        usage,
    })
}
