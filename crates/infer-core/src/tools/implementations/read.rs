//! Read tool - Read file contents

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResult};

const DEFAULT_LINE_LIMIT: usize = 2000;

pub struct ReadTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read file contents. Supports a 1-indexed line offset and a line limit for large files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the working directory"
                },
                "offset": {
                    "type": "number",
                    "description": "The line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "number",
                    "description": "The number of lines to read"
                }
            },
            "required": ["file_path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let path = ctx.resolve_path(&params.file_path);
        if !path.exists() {
            return ToolResult::error(format!("File not found: {}", params.file_path));
        }
        if !path.is_file() {
            return ToolResult::error(format!("Path is not a file: {}", path.display()));
        }

        let content = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };

        let check_len = content.len().min(8192);
        if content[..check_len].contains(&0) {
            return ToolResult::success_data(json!({
                "content": format!("Binary file: {} ({} bytes)", path.display(), content.len()),
                "total_lines": 0,
                "lines_returned": 0
            }));
        }

        let content = match String::from_utf8(content) {
            Ok(s) => s,
            Err(e) => return ToolResult::error(format!("File is not valid UTF-8: {}", e)),
        };
        if let Some(log) = &ctx.read_log {
            log.record(&path);
        }

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        if total_lines == 0 {
            return ToolResult::success_data(json!({
                "content": "",
                "total_lines": 0,
                "lines_returned": 0
            }));
        }

        let start = params.offset.unwrap_or(1).saturating_sub(1);
        if start >= total_lines {
            return ToolResult::error(format!(
                "Start line {} is beyond file length ({})",
                start + 1,
                total_lines
            ));
        }
        let end = (start + params.limit.unwrap_or(DEFAULT_LINE_LIMIT)).min(total_lines);

        ToolResult::success_data(json!({
            "content": lines[start..end].join("\n"),
            "total_lines": total_lines,
            "lines_returned": end - start,
            "start_line": start + 1
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(result: &ToolResult) -> Value {
        serde_json::from_str(&result.output).unwrap()
    }

    #[tokio::test]
    async fn test_reads_line_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf());

        let result = ReadTool
            .execute(json!({"file_path": "a.txt", "offset": 2, "limit": 1}), &ctx)
            .await;
        assert!(!result.is_error);
        let parsed = output(&result);
        assert_eq!(parsed["data"]["content"], "two");
        assert_eq!(parsed["data"]["total_lines"], 3);
        assert_eq!(parsed["data"]["start_line"], 2);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf());
        let result = ReadTool.execute(json!({"file_path": "nope.txt"}), &ctx).await;
        assert!(result.is_error);
        assert_eq!(output(&result)["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_offset_past_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf());
        let result = ReadTool
            .execute(json!({"file_path": "a.txt", "offset": 5}), &ctx)
            .await;
        assert!(result.is_error);
        assert!(result.error_message().contains("beyond file length"));
    }
}
