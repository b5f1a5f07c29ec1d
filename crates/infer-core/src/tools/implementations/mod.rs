//! Tool implementations
//!
//! - read: Read files
//! - write: Create/overwrite files
//! - edit: Exact string replacement in a previously read file
//! - grep: Regex search across files
//! - bash: Execute shell commands, optionally in a background shell
//! - bash_output / kill_shell / list_shells: Manage background shells

pub mod bash;
pub mod edit;
pub mod grep;
pub mod read;
pub mod shells;
pub mod write;

pub use bash::BashTool;
pub use edit::EditTool;
pub use grep::GrepTool;
pub use read::ReadTool;
pub use shells::{BashOutputTool, KillShellTool, ListShellsTool};
pub use write::WriteTool;

use std::sync::Arc;

use crate::tools::registry::ToolRegistry;

/// Register all built-in tools
pub async fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register(Arc::new(ReadTool)).await;
    registry.register(Arc::new(WriteTool)).await;
    registry.register(Arc::new(EditTool)).await;
    registry.register(Arc::new(GrepTool)).await;
    registry.register(Arc::new(BashTool)).await;
    registry.register(Arc::new(BashOutputTool)).await;
    registry.register(Arc::new(KillShellTool)).await;
    registry.register(Arc::new(ListShellsTool)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_definitions() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry).await;
        let names: Vec<String> = registry
            .get_ai_tools()
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            names,
            [
                "bash",
                "bash_output",
                "edit",
                "grep",
                "kill_shell",
                "list_shells",
                "read",
                "write"
            ]
        );
    }
}
