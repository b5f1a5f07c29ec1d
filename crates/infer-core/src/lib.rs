//! infer-core: execution core for the infer agent CLI
//!
//! - `agent` - state machine, per-state handlers, orchestrator
//! - `tools` - tool registry and built-in tools
//! - `shells` - background shell processes and their output buffers
//! - `ai` - model message types and the streaming chat contract

pub mod agent;
pub mod ai;
pub mod config;
pub mod conversation;
pub mod error;
pub mod paths;
pub mod shells;
pub mod tools;

pub use config::InferConfig;
pub use error::{AgentError, ApprovalError, ShellError, TransitionError};
