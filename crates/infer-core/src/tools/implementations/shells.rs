//! Background shell tools: bash_output, kill_shell, list_shells

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResult};

const SHELLS_UNAVAILABLE: &str = "Background shells are not available";

/// Read new output from a background shell
pub struct BashOutputTool;

#[derive(Deserialize)]
struct OutputParams {
    shell_id: String,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    offset: Option<u64>,
}

#[async_trait]
impl Tool for BashOutputTool {
    fn name(&self) -> &str {
        "bash_output"
    }

    fn description(&self) -> &str {
        "Read output from a background shell. Returns only output produced since the last read \
         unless an offset is given. Optionally keep only lines matching a regex filter."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shell_id": {
                    "type": "string",
                    "description": "The background shell ID"
                },
                "filter": {
                    "type": "string",
                    "description": "Regular expression; only matching lines are returned"
                },
                "offset": {
                    "type": "number",
                    "description": "Byte offset to read from instead of the last read position"
                }
            },
            "required": ["shell_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<OutputParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let Some(shells) = &ctx.shells else {
            return ToolResult::error(SHELLS_UNAVAILABLE);
        };

        let result = match &params.filter {
            Some(pattern) => {
                shells.get_shell_output_filtered(&params.shell_id, params.offset, pattern)
            }
            None => shells.get_shell_output(&params.shell_id, params.offset),
        };

        match result {
            Ok(output) => match serde_json::to_value(&output) {
                Ok(data) => ToolResult::success_data(data),
                Err(e) => ToolResult::error(e),
            },
            Err(e) => ToolResult::error(e),
        }
    }
}

/// Cancel a background shell
pub struct KillShellTool;

#[derive(Deserialize)]
struct KillParams {
    shell_id: String,
}

#[async_trait]
impl Tool for KillShellTool {
    fn name(&self) -> &str {
        "kill_shell"
    }

    fn description(&self) -> &str {
        "Stop a background shell by ID. Stopping a shell that already finished does nothing."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shell_id": {
                    "type": "string",
                    "description": "The background shell ID"
                }
            },
            "required": ["shell_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<KillParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let Some(shells) = &ctx.shells else {
            return ToolResult::error(SHELLS_UNAVAILABLE);
        };

        match shells.cancel_shell(&params.shell_id) {
            Ok(()) => ToolResult::success_data(json!({
                "message": "Cancellation requested",
                "shell_id": params.shell_id
            })),
            Err(e) => ToolResult::error(e),
        }
    }
}

/// List background shells
pub struct ListShellsTool;

#[async_trait]
impl Tool for ListShellsTool {
    fn name(&self) -> &str {
        "list_shells"
    }

    fn description(&self) -> &str {
        "List background shells with their state, exit code, and output size."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> ToolResult {
        let Some(shells) = &ctx.shells else {
            return ToolResult::error(SHELLS_UNAVAILABLE);
        };

        let listed = shells.shells();
        ToolResult::success_data(json!({
            "shells": listed,
            "count": listed.len(),
            "stats": shells.stats()
        }))
    }
}
