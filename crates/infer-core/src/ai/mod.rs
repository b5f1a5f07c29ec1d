//! Model-facing types and the streaming chat contract

pub mod client;
pub mod format;
pub mod parser;
pub mod retry;
pub mod streaming;
pub mod types;

pub use client::GatewayClient;
pub use streaming::{ChatClient, ChatRequest, StreamPart};
