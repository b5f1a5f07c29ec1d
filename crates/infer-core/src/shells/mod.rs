//! Background shells: detached commands with bounded output capture

mod process;
pub mod ring_buffer;
pub mod service;
pub mod tracker;

pub(crate) use process::{join_readers, shell_command, spawn_output_readers, terminate};
pub use ring_buffer::{OutputRingBuffer, ReadChunk};
pub use service::{BackgroundShellService, DetachRejected, ShellOutput, ShellStats};
pub use tracker::{BackgroundShell, ShellInfo, ShellState, ShellTracker};
