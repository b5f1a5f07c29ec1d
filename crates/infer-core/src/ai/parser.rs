//! OpenAI-compatible SSE parser for chat/completions format

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::Value;

use super::streaming::StreamPart;
use super::types::{AiToolCall, FinishReason, Usage};

struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn force_complete(self) -> AiToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.arguments).unwrap_or_else(|e| {
                tracing::warn!(tool = %self.name, error = %e, "Tool arguments are not valid JSON");
                Value::String(self.arguments.clone())
            })
        };
        AiToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Stateful parser turning `data:` payloads into stream parts
#[derive(Default)]
pub struct OpenAIParser {
    /// In emission order
    tools: Vec<ToolCallAccumulator>,
    /// Provider tool index -> position in `tools`
    index_map: HashMap<u64, usize>,
}

impl OpenAIParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one SSE `data:` payload.
    pub fn parse_data(&mut self, data: &str) -> Result<Vec<StreamPart>> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(self.drain_tool_calls());
        }

        let json: Value = serde_json::from_str(data).context("Invalid SSE JSON payload")?;
        let mut parts = Vec::new();

        if let Some(error) = json.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            parts.push(StreamPart::Error { error: message });
            return Ok(parts);
        }

        if let Some(choice) = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            if let Some(delta) = choice.get("delta") {
                self.parse_delta(delta, &mut parts);
            }

            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                parts.extend(self.drain_tool_calls());
                parts.push(StreamPart::Finish {
                    reason: finish_reason(reason),
                });
            }
        }

        if let Some(usage) = json.get("usage").and_then(parse_usage) {
            parts.push(StreamPart::Usage { usage });
        }

        Ok(parts)
    }

    fn parse_delta(&mut self, delta: &Value, parts: &mut Vec<StreamPart>) {
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                parts.push(StreamPart::TextDelta {
                    delta: text.to_string(),
                });
            }
        }

        if let Some(reasoning) = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(|r| r.as_str())
        {
            if !reasoning.is_empty() {
                parts.push(StreamPart::ReasoningDelta {
                    delta: reasoning.to_string(),
                });
            }
        }

        let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) else {
            return;
        };

        for tc in tool_calls {
            let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let function = tc.get("function");

            let position = match self.index_map.get(&index) {
                Some(&pos) => pos,
                None => {
                    let id = tc
                        .get("id")
                        .and_then(|i| i.as_str())
                        .filter(|i| !i.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{index}"));
                    let name = function
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    parts.push(StreamPart::ToolCallStart {
                        id: id.clone(),
                        name: name.clone(),
                    });
                    self.tools.push(ToolCallAccumulator {
                        id,
                        name,
                        arguments: String::new(),
                    });
                    self.index_map.insert(index, self.tools.len() - 1);
                    self.tools.len() - 1
                }
            };

            if let Some(args) = function
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
            {
                if !args.is_empty() {
                    let acc = &mut self.tools[position];
                    acc.arguments.push_str(args);
                    parts.push(StreamPart::ToolCallDelta {
                        id: acc.id.clone(),
                        delta: args.to_string(),
                    });
                }
            }
        }
    }

    /// Complete every accumulated tool call, in emission order.
    pub fn drain_tool_calls(&mut self) -> Vec<StreamPart> {
        self.index_map.clear();
        std::mem::take(&mut self.tools)
            .into_iter()
            .map(|acc| StreamPart::ToolCallComplete {
                tool_call: acc.force_complete(),
            })
            .collect()
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    if usage.is_null() {
        return None;
    }
    let prompt = usage.get("prompt_tokens").and_then(|t| t.as_u64()).unwrap_or(0) as usize;
    let completion = usage
        .get("completion_tokens")
        .and_then(|t| t.as_u64())
        .unwrap_or(0) as usize;
    let total = usage
        .get("total_tokens")
        .and_then(|t| t.as_u64())
        .map(|t| t as usize)
        .unwrap_or(prompt + completion);
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_reasoning_deltas() {
        let mut parser = OpenAIParser::new();
        let parts = parser
            .parse_data(r#"{"choices":[{"delta":{"content":"Hi","reasoning_content":"hmm"}}]}"#)
            .unwrap();
        assert!(matches!(&parts[0], StreamPart::TextDelta { delta } if delta == "Hi"));
        assert!(matches!(&parts[1], StreamPart::ReasoningDelta { delta } if delta == "hmm"));
    }

    #[test]
    fn test_tool_call_accumulates_across_chunks() {
        let mut parser = OpenAIParser::new();
        parser
            .parse_data(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"bash","arguments":"{\"comm"}}]}}]}"#)
            .unwrap();
        parser
            .parse_data(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"and\":\"ls\"}"}}]}}]}"#)
            .unwrap();
        let parts = parser
            .parse_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#)
            .unwrap();

        let StreamPart::ToolCallComplete { tool_call } = &parts[0] else {
            panic!("expected completed tool call, got {:?}", parts[0]);
        };
        assert_eq!(tool_call.id, "call_a");
        assert_eq!(tool_call.name, "bash");
        assert_eq!(tool_call.arguments["command"], "ls");
        assert!(matches!(
            parts[1],
            StreamPart::Finish {
                reason: FinishReason::ToolCalls
            }
        ));
    }

    #[test]
    fn test_parallel_tool_calls_keep_order() {
        let mut parser = OpenAIParser::new();
        parser
            .parse_data(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"read","arguments":"{}"}},{"index":1,"id":"b","function":{"name":"write","arguments":"{}"}}]}}]}"#)
            .unwrap();
        let parts = parser.parse_data("[DONE]").unwrap();
        let ids: Vec<_> = parts
            .iter()
            .filter_map(|p| match p {
                StreamPart::ToolCallComplete { tool_call } => Some(tool_call.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_usage_and_error() {
        let mut parser = OpenAIParser::new();
        let parts = parser
            .parse_data(r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#)
            .unwrap();
        assert!(matches!(&parts[0], StreamPart::Usage { usage } if usage.total_tokens == 15));

        let parts = parser
            .parse_data(r#"{"error":{"message":"rate limited"}}"#)
            .unwrap();
        assert!(matches!(&parts[0], StreamPart::Error { error } if error == "rate limited"));
    }

    #[test]
    fn test_invalid_json_is_error() {
        let mut parser = OpenAIParser::new();
        assert!(parser.parse_data("{not json").is_err());
    }
}
