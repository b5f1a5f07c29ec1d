//! Tool execution backed by the tool registry

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::services::ToolExecutor;
use crate::ai::types::{AiTool, AiToolCall};
use crate::conversation::ToolExecutionResult;
use crate::shells::BackgroundShellService;
use crate::tools::registry::{ReadLog, ToolContext, ToolRegistry};

pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;

/// Dispatches calls to a [`ToolRegistry`]
pub struct RegistryExecutor {
    registry: Arc<ToolRegistry>,
    working_dir: PathBuf,
    shells: Option<Arc<BackgroundShellService>>,
    read_log: Arc<ReadLog>,
    timeout: Option<Duration>,
    max_output_chars: usize,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<ToolRegistry>, working_dir: PathBuf) -> Self {
        Self {
            registry,
            working_dir,
            shells: None,
            read_log: Arc::new(ReadLog::new()),
            timeout: None,
            max_output_chars: MAX_TOOL_OUTPUT_CHARS,
        }
    }

    pub fn with_shells(mut self, shells: Arc<BackgroundShellService>) -> Self {
        self.shells = Some(shells);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }
}

#[async_trait]
impl ToolExecutor for RegistryExecutor {
    async fn execute(&self, call: &AiToolCall) -> ToolExecutionResult {
        let start = Instant::now();
        let ctx = ToolContext {
            working_dir: self.working_dir.clone(),
            shells: self.shells.clone(),
            read_log: Some(self.read_log.clone()),
            timeout: self.timeout,
            tool_use_id: Some(call.id.clone()),
        };

        let Some(result) = self
            .registry
            .execute(&call.name, call.arguments.clone(), &ctx)
            .await
        else {
            tracing::warn!(tool = %call.name, "Unknown tool requested");
            return ToolExecutionResult::failed(
                call,
                format!("Unknown tool: {}", call.name),
                start.elapsed(),
            );
        };

        let duration = start.elapsed();
        if result.is_error {
            let error = truncate_output(&result.error_message(), self.max_output_chars);
            tracing::info!(tool = %call.name, duration_ms = duration.as_millis() as u64, error = %error, "Tool failed");
            ToolExecutionResult::failed(call, error, duration)
        } else {
            tracing::info!(tool = %call.name, duration_ms = duration.as_millis() as u64, "Tool completed");
            let output = truncate_output(&result.output, self.max_output_chars);
            let data = serde_json::from_str::<serde_json::Value>(&output)
                .ok()
                .filter(|v| v.is_object());
            let mut entry = ToolExecutionResult::completed(call, output, duration);
            if let Some(data) = data {
                entry = entry.with_data(data);
            }
            entry
        }
    }

    async fn definitions(&self) -> Vec<AiTool> {
        self.registry.get_ai_tools().await
    }
}

/// Cut `output` to at most `max_chars` characters at a line boundary, with
/// a marker saying how much was dropped.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let Some((cut, _)) = output.char_indices().nth(max_chars) else {
        return output.to_string();
    };

    let truncated = &output[..cut];
    let clean = match truncated.rfind('\n') {
        Some(break_point) => &truncated[..break_point],
        None => truncated,
    };
    format!(
        "{}\n\n[... OUTPUT TRUNCATED: {} chars -> {} chars ...]",
        clean,
        output.chars().count(),
        clean.chars().count()
    )
}
