//! OpenAI chat/completions request formatting

use serde_json::{json, Value};

use super::streaming::ChatRequest;
use super::types::{AiTool, Content, ModelMessage, Role};

/// Convert conversation messages to chat/completions `messages`.
///
/// Tool results become one `tool` message each. Reasoning is not sent back.
pub fn convert_messages(system_prompt: Option<&str>, messages: &[ModelMessage]) -> Vec<Value> {
    let mut result = Vec::with_capacity(messages.len() + 1);

    let mut system = system_prompt.map(str::to_string).unwrap_or_default();
    for msg in messages.iter().filter(|m| m.role == Role::System) {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&msg.text_content());
    }
    if !system.is_empty() {
        result.push(json!({ "role": "system", "content": system }));
    }

    for msg in messages.iter().filter(|m| m.role != Role::System) {
        let has_tool_results = msg
            .content
            .iter()
            .any(|c| matches!(c, Content::ToolResult { .. }));

        if has_tool_results {
            for content in &msg.content {
                if let Content::ToolResult {
                    tool_use_id,
                    output,
                    ..
                } = content
                {
                    let output_str = match output {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    result.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": output_str
                    }));
                }
            }
            continue;
        }

        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => continue,
        };

        let tool_calls: Vec<Value> = msg
            .content
            .iter()
            .filter_map(|c| match c {
                Content::ToolUse { id, name, input } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string()
                    }
                })),
                _ => None,
            })
            .collect();

        let text = msg.text_content();
        if tool_calls.is_empty() {
            result.push(json!({ "role": role, "content": text }));
        } else {
            let content = if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            result.push(json!({
                "role": role,
                "content": content,
                "tool_calls": tool_calls
            }));
        }
    }

    result
}

pub fn convert_tools(tools: &[AiTool]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema
                }
            })
        })
        .collect()
}

/// Full streaming request body.
pub fn build_request_body(request: &ChatRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": convert_messages(request.system_prompt.as_deref(), &request.messages),
        "stream": true,
        "stream_options": { "include_usage": true }
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(convert_tools(&request.tools));
        body["tool_choice"] = json!("auto");
    }
    body
}
