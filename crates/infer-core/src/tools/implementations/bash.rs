//! Bash tool - Execute shell commands
//!
//! Foreground commands are waited on up to a timeout. A command that is
//! still running when the timeout hits is detached into a background shell
//! when shells are available, and terminated otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::shells::{
    join_readers, shell_command, spawn_output_readers, terminate, OutputRingBuffer,
};
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResult, DEFAULT_TOOL_TIMEOUT};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_TIMEOUT_MS: u64 = 600_000;
/// Capture size when no shell service supplies a buffer
const RAW_CAPTURE_BYTES: usize = 2 * 1024 * 1024;
const TIMEOUT_KILL_GRACE: Duration = Duration::from_millis(800);

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07").unwrap()
});

pub struct BashTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    run_in_background: Option<bool>,
}

/// Detect a trailing shell background operator (`&`) that is not quoted or
/// escaped, and return the command without it.
fn strip_shell_background_suffix(command: &str) -> Option<String> {
    let trimmed = command.trim_end();
    let (amp_idx, last_char) = trimmed.char_indices().last()?;
    if last_char != '&' {
        return None;
    }

    let prefix = trimmed[..amp_idx].trim_end();
    if prefix.is_empty() {
        return None;
    }

    // `&&` and `|&` endings are not backgrounding
    if matches!(prefix.chars().last(), Some('&' | '|')) {
        return None;
    }

    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for (idx, ch) in trimmed.char_indices() {
        if idx == amp_idx {
            if in_single || in_double || escaped {
                return None;
            }
            break;
        }

        if escaped {
            escaped = false;
            continue;
        }

        match ch {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
    }

    Some(prefix.to_string())
}

fn captured_output(buffer: &OutputRingBuffer) -> String {
    let raw = buffer.contents_lossy();
    ANSI_ESCAPE.replace_all(&raw, "").into_owned()
}

async fn run_in_background(command: &str, ctx: &ToolContext) -> ToolResult {
    let Some(shells) = &ctx.shells else {
        return ToolResult::error("Background shells are not available");
    };

    match shells.spawn_command(command, &ctx.working_dir).await {
        Ok(shell_id) => ToolResult::success_data(json!({
            "message": "Command started in background",
            "shell_id": shell_id,
            "status": "running"
        })),
        Err(e) => ToolResult::error(format!("Failed to start background shell: {}", e)),
    }
}

async fn run_foreground(command: &str, ctx: &ToolContext, wait: Duration) -> ToolResult {
    let mut cmd = shell_command(command, &ctx.working_dir);
    cmd.env("NO_COLOR", "1");

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("Failed to spawn command: {}", e)),
    };

    let buffer = match &ctx.shells {
        Some(shells) => shells.new_buffer(),
        None => Arc::new(OutputRingBuffer::new(RAW_CAPTURE_BYTES)),
    };
    let readers = spawn_output_readers(&mut child, &buffer);

    match timeout(wait, child.wait()).await {
        Ok(Ok(status)) => {
            join_readers(readers).await;
            let output = captured_output(&buffer);
            let exit_code = status.code().unwrap_or(-1);
            if status.success() {
                ToolResult::success_data(json!({
                    "output": output,
                    "exit_code": exit_code
                }))
            } else {
                ToolResult::error_with_code(
                    "command_failed",
                    format!("Command exited with code {}\n{}", exit_code, output),
                )
            }
        }
        Ok(Err(e)) => {
            join_readers(readers).await;
            ToolResult::error(format!("Failed to wait for command: {}", e))
        }
        Err(_) => on_timeout(child, readers, command, buffer, ctx, wait).await,
    }
}

async fn on_timeout(
    child: Child,
    readers: Vec<JoinHandle<()>>,
    command: &str,
    buffer: Arc<OutputRingBuffer>,
    ctx: &ToolContext,
    wait: Duration,
) -> ToolResult {
    let (mut child, readers) = match ctx.shells.as_ref().filter(|s| s.is_enabled()) {
        Some(shells) => {
            match shells.detach_to_background(child, command, buffer.clone(), readers) {
                Ok(shell_id) => {
                    return ToolResult::success_data(json!({
                        "message": format!(
                            "Command still running after {} ms; moved to background shell {}",
                            wait.as_millis(),
                            shell_id
                        ),
                        "shell_id": shell_id,
                        "status": "running",
                        "output": captured_output(&buffer)
                    }));
                }
                Err(rejected) => {
                    tracing::info!(error = %rejected.error, "Could not detach timed out command");
                    (rejected.child, rejected.readers)
                }
            }
        }
        None => (child, readers),
    };

    terminate(&mut child, TIMEOUT_KILL_GRACE).await;
    join_readers(readers).await;
    ToolResult::error_with_code(
        "timeout",
        format!(
            "Command timed out after {} ms\n{}",
            wait.as_millis(),
            captured_output(&buffer)
        ),
    )
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute shell commands for git, build tools, and system utilities. \
         Set run_in_background:true for servers and watchers, then read their output with bash_output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout": {
                    "type": "number",
                    "description": "Optional timeout in milliseconds (max 600000)"
                },
                "description": {
                    "type": "string",
                    "description": "Clear, concise description of what this command does in 5-10 words"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Set to true to run this command in a background shell"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        match &params.description {
            Some(desc) => {
                tracing::info!(command = %params.command, description = %desc, "Executing bash command")
            }
            None => tracing::info!(command = %params.command, "Executing bash command"),
        }

        let inferred_background = strip_shell_background_suffix(&params.command);
        if params.run_in_background.unwrap_or(false) || inferred_background.is_some() {
            let command = inferred_background.unwrap_or_else(|| params.command.clone());
            return run_in_background(&command, ctx).await;
        }

        // Stay inside the registry's own timeout so a timed out command can be detached
        let deadline = ctx.timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT);
        let budget = deadline.saturating_sub((deadline / 10).min(Duration::from_secs(1)));
        let requested = params
            .timeout
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .min(MAX_TIMEOUT_MS);
        let wait = Duration::from_millis(requested).min(budget);

        run_foreground(&params.command, ctx, wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_suffix_simple() {
        let parsed = strip_shell_background_suffix("npm run dev &");
        assert_eq!(parsed.as_deref(), Some("npm run dev"));
    }

    #[test]
    fn test_background_suffix_rejects_quoted_and_escaped() {
        assert!(strip_shell_background_suffix("echo '&'").is_none());
        assert!(strip_shell_background_suffix(r"echo foo \&").is_none());
        assert!(strip_shell_background_suffix("echo hi &&").is_none());
    }

    #[test]
    fn test_strips_ansi() {
        let buffer = OutputRingBuffer::new(64);
        buffer.write(b"\x1b[31mred\x1b[0m text");
        assert_eq!(captured_output(&buffer), "red text");
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::config::ShellsConfig;
        use crate::shells::{BackgroundShellService, ShellState};

        fn ctx(dir: &std::path::Path) -> ToolContext {
            ToolContext::new(dir.to_path_buf())
        }

        fn data(result: &ToolResult) -> Value {
            let parsed: Value = serde_json::from_str(&result.output).unwrap();
            parsed["data"].clone()
        }

        #[tokio::test]
        async fn test_foreground_success() {
            let dir = tempfile::tempdir().unwrap();
            let result = BashTool
                .execute(json!({"command": "echo hello"}), &ctx(dir.path()))
                .await;
            assert!(!result.is_error, "{}", result.output);
            assert_eq!(data(&result)["output"], "hello\n");
            assert_eq!(data(&result)["exit_code"], 0);
        }

        #[tokio::test]
        async fn test_foreground_failure_keeps_output() {
            let dir = tempfile::tempdir().unwrap();
            let result = BashTool
                .execute(json!({"command": "echo broken >&2; exit 2"}), &ctx(dir.path()))
                .await;
            assert!(result.is_error);
            let message = result.error_message();
            assert!(message.starts_with("Command exited with code 2"));
            assert!(message.contains("broken"));
        }

        #[tokio::test]
        async fn test_timeout_without_shells_terminates() {
            let dir = tempfile::tempdir().unwrap();
            let result = BashTool
                .execute(json!({"command": "sleep 5", "timeout": 100}), &ctx(dir.path()))
                .await;
            assert!(result.is_error);
            let parsed: Value = serde_json::from_str(&result.output).unwrap();
            assert_eq!(parsed["error"]["code"], "timeout");
        }

        #[tokio::test]
        async fn test_timeout_detaches_to_background() {
            let dir = tempfile::tempdir().unwrap();
            let shells = Arc::new(BackgroundShellService::new(ShellsConfig::default()));
            let ctx = ctx(dir.path()).with_shells(shells.clone());

            let result = BashTool
                .execute(
                    json!({"command": "echo started; sleep 5", "timeout": 200}),
                    &ctx,
                )
                .await;
            assert!(!result.is_error, "{}", result.output);
            let shell_id = data(&result)["shell_id"].as_str().unwrap().to_string();

            let info = shells.shell(&shell_id).unwrap();
            assert_eq!(info.state, ShellState::Running);
            assert!(shells
                .get_shell_output(&shell_id, Some(0))
                .unwrap()
                .output
                .contains("started"));
            shells.stop().await;
        }

        #[tokio::test]
        async fn test_registry_timeout_bounds_foreground_wait() {
            use crate::tools::registry::ToolRegistry;

            let dir = tempfile::tempdir().unwrap();
            let shells = Arc::new(BackgroundShellService::new(ShellsConfig::default()));
            let registry = ToolRegistry::new().with_timeout(Duration::from_millis(1500));
            registry.register(Arc::new(BashTool)).await;
            let ctx = ctx(dir.path()).with_shells(shells.clone());

            let result = registry
                .execute("bash", json!({"command": "sleep 5"}), &ctx)
                .await
                .unwrap();
            assert!(!result.is_error, "{}", result.output);
            let shell_id = data(&result)["shell_id"].as_str().unwrap().to_string();
            assert_eq!(shells.shell(&shell_id).unwrap().state, ShellState::Running);
            shells.stop().await;
        }

        #[tokio::test]
        async fn test_run_in_background() {
            let dir = tempfile::tempdir().unwrap();
            let shells = Arc::new(BackgroundShellService::new(ShellsConfig::default()));
            let ctx = ctx(dir.path()).with_shells(shells.clone());

            let result = BashTool
                .execute(json!({"command": "sleep 5 &"}), &ctx)
                .await;
            assert!(!result.is_error, "{}", result.output);
            assert_eq!(data(&result)["status"], "running");
            assert_eq!(shells.count_running(), 1);
            assert_eq!(shells.shells()[0].command, "sleep 5");
            shells.stop().await;
        }

        #[tokio::test]
        async fn test_background_requires_shells() {
            let dir = tempfile::tempdir().unwrap();
            let result = BashTool
                .execute(
                    json!({"command": "sleep 1", "run_in_background": true}),
                    &ctx(dir.path()),
                )
                .await;
            assert!(result.is_error);
        }
    }
}
