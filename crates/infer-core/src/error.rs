//! Typed errors for the agent core
//!
//! Machine-level contract violations surface as `AgentError`; everything a
//! turn can recover from (tool failures, denied approvals) is folded into
//! conversation entries instead of being returned.

use thiserror::Error;

use crate::agent::state::AgentExecutionState;

/// A rejected state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    Invalid {
        from: AgentExecutionState,
        to: AgentExecutionState,
    },

    #[error("guard failed for transition {from} -> {to}")]
    GuardRejected {
        from: AgentExecutionState,
        to: AgentExecutionState,
    },
}

/// Errors that abort a turn.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("missing required collaborator: {0}")]
    MissingDependency(&'static str),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("conversation sink failed: {0}")]
    Sink(String),
}

impl AgentError {
    /// Broken machine contract rather than a failed request. These are
    /// returned from the runtime; everything else ends the turn in `Error`.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            AgentError::Transition(_) | AgentError::MissingDependency(_) | AgentError::ChannelClosed
        )
    }
}

/// Failure to obtain an approval decision from the user.
#[derive(Debug, Clone, Error)]
pub enum ApprovalError {
    #[error("approval timed out after {0} seconds")]
    Timeout(u64),

    #[error("approval channel closed before a decision was made")]
    ChannelClosed,
}

/// Errors from the background shell subsystem.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("background shells are disabled")]
    Disabled,

    #[error("maximum concurrent shells limit reached ({limit})")]
    CapacityReached { limit: usize },

    #[error("shell {0} already exists")]
    Duplicate(String),

    #[error("shell {0} not found")]
    NotFound(String),

    #[error("invalid output filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("failed to spawn shell command: {0}")]
    Spawn(#[from] std::io::Error),
}
