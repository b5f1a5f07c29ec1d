//! Conversation entries and the sink they are written to

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::ai::types::{AiToolCall, Content, ModelMessage, Role};

/// Lifecycle of a single tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    WaitingApproval,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Denied,
}

impl ToolCallStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ToolCallStatus::Completed
                | ToolCallStatus::Failed
                | ToolCallStatus::Cancelled
                | ToolCallStatus::Denied
        )
    }
}

/// Outcome of one tool call
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    pub success: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// What the model sees
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolExecutionResult {
    pub fn completed(call: &AiToolCall, output: String, duration: Duration) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: ToolCallStatus::Completed,
            success: true,
            duration,
            output,
            error: None,
            data: None,
        }
    }

    pub fn failed(call: &AiToolCall, error: impl Into<String>, duration: Duration) -> Self {
        let error = error.into();
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: ToolCallStatus::Failed,
            success: false,
            duration,
            output: format!("Tool execution failed: {} - {}", call.name, error),
            error: Some(error),
            data: None,
        }
    }

    pub fn denied(call: &AiToolCall, reason: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: ToolCallStatus::Denied,
            success: false,
            duration: Duration::ZERO,
            output: format!(
                "Tool call rejected by user: {}\n\nYou can provide alternative instructions or ask me to proceed differently.",
                call.name
            ),
            error: Some(reason.into()),
            data: None,
        }
    }

    pub fn cancelled(call: &AiToolCall) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: ToolCallStatus::Cancelled,
            success: false,
            duration: Duration::ZERO,
            output: format!("Tool execution cancelled: {}", call.name),
            error: Some("cancelled".to_string()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// A message in the conversation with bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    pub message: ModelMessage,
    pub timestamp: DateTime<Utc>,
    /// Shown to the model but not to the user
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_execution: Option<ToolExecutionResult>,
}

impl ConversationEntry {
    pub fn new(message: ModelMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            hidden: false,
            tool_execution: None,
        }
    }

    /// Tool-role entry for a finished call.
    pub fn tool_result(result: ToolExecutionResult) -> Self {
        let message =
            ModelMessage::tool_result(result.tool_call_id.clone(), result.output.clone(), !result.success);
        Self {
            message,
            timestamp: Utc::now(),
            hidden: false,
            tool_execution: Some(result),
        }
    }

    pub fn role(&self) -> Role {
        self.message.role
    }
}

/// Where the conversation is recorded.
///
/// Implementations must be cheap; they are called from the dispatch loop.
pub trait ConversationSink: Send + Sync {
    fn add_message(&self, entry: ConversationEntry) -> anyhow::Result<()>;

    fn messages(&self) -> Vec<ConversationEntry>;

    /// Replace the text of the most recent message.
    fn update_last_message(&self, content: &str) -> anyhow::Result<()>;

    /// Replace the tool calls of the most recent message.
    fn update_last_message_tool_calls(&self, tool_calls: &[AiToolCall]) -> anyhow::Result<()>;
}

/// Sink keeping everything in memory
#[derive(Debug, Default)]
pub struct InMemoryConversation {
    entries: RwLock<Vec<ConversationEntry>>,
}

impl InMemoryConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl ConversationSink for InMemoryConversation {
    fn add_message(&self, entry: ConversationEntry) -> anyhow::Result<()> {
        self.entries.write().push(entry);
        Ok(())
    }

    fn messages(&self) -> Vec<ConversationEntry> {
        self.entries.read().clone()
    }

    fn update_last_message(&self, content: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.write();
        let last = entries
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("conversation is empty"))?;
        last.message.content.retain(|c| !matches!(c, Content::Text { .. }));
        last.message.content.push(Content::Text {
            text: content.to_string(),
        });
        Ok(())
    }

    fn update_last_message_tool_calls(&self, tool_calls: &[AiToolCall]) -> anyhow::Result<()> {
        let mut entries = self.entries.write();
        let last = entries
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("conversation is empty"))?;
        last.message
            .content
            .retain(|c| !matches!(c, Content::ToolUse { .. }));
        last.message
            .content
            .extend(tool_calls.iter().map(|call| Content::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> AiToolCall {
        AiToolCall {
            id: "c1".into(),
            name: "write".into(),
            arguments: json!({"file_path": "x"}),
        }
    }

    #[test]
    fn test_denied_entry_text() {
        let entry = ConversationEntry::tool_result(ToolExecutionResult::denied(&call(), "rejected"));
        assert_eq!(entry.role(), Role::Tool);
        let exec = entry.tool_execution.as_ref().unwrap();
        assert_eq!(exec.status, ToolCallStatus::Denied);
        assert!(exec.output.starts_with("Tool call rejected by user: write"));
        let Content::ToolResult { is_error, .. } = &entry.message.content[0] else {
            panic!("expected tool result content");
        };
        assert_eq!(*is_error, Some(true));
    }

    #[test]
    fn test_failed_entry_text() {
        let result = ToolExecutionResult::failed(&call(), "disk full", Duration::from_millis(12));
        assert_eq!(result.output, "Tool execution failed: write - disk full");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 12);
        assert_eq!(json["status"], "failed");
    }

    #[test]
    fn test_in_memory_updates_last_message() {
        let sink = InMemoryConversation::new();
        assert!(sink.update_last_message("x").is_err());

        sink.add_message(ConversationEntry::new(ModelMessage::assistant("draft", "", &[])))
            .unwrap();
        sink.update_last_message("final").unwrap();
        sink.update_last_message_tool_calls(&[call()]).unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.text_content(), "final");
        assert_eq!(messages[0].message.tool_calls(), vec![call()]);
    }
}
