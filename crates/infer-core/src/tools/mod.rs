//! Tool registry and built-in tools

pub mod implementations;
pub mod registry;

pub use implementations::register_builtin_tools;
pub use registry::{
    parse_params, tool_category, ReadLog, Tool, ToolCategory, ToolContext, ToolRegistry, ToolResult,
};
