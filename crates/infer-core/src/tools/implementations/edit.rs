//! Edit tool - Replace exact text in a file

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResult};

pub struct EditTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Exact string replacement in a file. The file must have been read first. \
         old_string must be unique unless replace_all is true."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the working directory"
                },
                "old_string": {
                    "type": "string",
                    "description": "The text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The text to replace it with"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace all occurrences (default: false)",
                    "default": false
                }
            },
            "required": ["file_path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if params.old_string.is_empty() {
            return ToolResult::invalid_parameters("old_string must not be empty");
        }
        if params.old_string == params.new_string {
            return ToolResult::invalid_parameters("old_string and new_string are identical");
        }

        let path = ctx.resolve_path(&params.file_path);
        if !path.is_file() {
            return ToolResult::error(format!("File not found: {}", params.file_path));
        }
        if let Some(log) = &ctx.read_log {
            if !log.contains(&path) {
                return ToolResult::error_with_code(
                    "read_required",
                    format!("Read {} before editing it", params.file_path),
                );
            }
        }

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };

        let count = content.matches(&params.old_string).count();
        if count == 0 {
            return ToolResult::error_with_code(
                "no_match",
                format!(
                    "String not found in file: {:?}. Read the file again and match its exact whitespace.",
                    params.old_string
                ),
            );
        }
        if count > 1 && !params.replace_all {
            return ToolResult::error_with_code(
                "ambiguous_match",
                format!(
                    "String found {} times. Use replace_all=true or include more context to make it unique.",
                    count
                ),
            );
        }

        let new_content = if params.replace_all {
            content.replace(&params.old_string, &params.new_string)
        } else {
            content.replacen(&params.old_string, &params.new_string, 1)
        };
        tracing::debug!(path = %path.display(), replacements = count, "Editing file");

        match fs::write(&path, &new_content).await {
            Ok(()) => ToolResult::success_data(json!({
                "message": format!("Replaced {} occurrence(s)", count),
                "replacements": count,
                "file_path": path.display().to_string()
            })),
            Err(e) => ToolResult::error(format!("Failed to write file: {}", e)),
        }
    }
}
