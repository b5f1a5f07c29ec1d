//! Streaming contract between the agent and a chat backend

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{AiTool, AiToolCall, FinishReason, ModelMessage, Usage};

/// One piece of a streamed model response.
#[derive(Debug, Clone)]
pub enum StreamPart {
    TextDelta { delta: String },
    ReasoningDelta { delta: String },
    /// A tool call started; arguments follow as deltas.
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, delta: String },
    /// Arguments fully received and parsed.
    ToolCallComplete { tool_call: AiToolCall },
    Usage { usage: Usage },
    Finish { reason: FinishReason },
    Error { error: String },
}

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<AiTool>,
}

/// Backend that streams model output.
///
/// The receiver closes when the response ends. A failure to start the
/// request is returned as an error; a failure mid-stream arrives as
/// `StreamPart::Error`.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream(&self, request: ChatRequest) -> anyhow::Result<mpsc::UnboundedReceiver<StreamPart>>;
}
