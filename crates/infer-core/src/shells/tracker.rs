//! Bounded registry of background shells

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::ring_buffer::OutputRingBuffer;
use crate::error::ShellError;

/// Lifecycle of a background shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ShellState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ShellState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShellState::Running => "running",
            ShellState::Completed => "completed",
            ShellState::Failed => "failed",
            ShellState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ShellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ShellStatus {
    state: ShellState,
    exit_code: Option<i32>,
    completed_at: Option<DateTime<Utc>>,
    read_offset: u64,
}

/// A detached command whose output keeps flowing into its ring buffer.
///
/// The process handle itself is owned by the monitor task; the shell keeps
/// the cancellation token that task listens on.
#[derive(Debug)]
pub struct BackgroundShell {
    pub id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub output: Arc<OutputRingBuffer>,
    cancel: CancellationToken,
    status: Mutex<ShellStatus>,
}

/// Point-in-time view of a shell for listings and events
#[derive(Debug, Clone, Serialize)]
pub struct ShellInfo {
    pub id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub state: ShellState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output_bytes: u64,
    pub elapsed_ms: u64,
}

impl BackgroundShell {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        pid: Option<u32>,
        output: Arc<OutputRingBuffer>,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            pid,
            started_at: Utc::now(),
            output,
            cancel: CancellationToken::new(),
            status: Mutex::new(ShellStatus {
                state: ShellState::Running,
                exit_code: None,
                completed_at: None,
                read_offset: 0,
            }),
        }
    }

    pub fn state(&self) -> ShellState {
        self.status.lock().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.lock().exit_code
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.status.lock().completed_at
    }

    pub fn read_offset(&self) -> u64 {
        self.status.lock().read_offset
    }

    pub(crate) fn set_read_offset(&self, offset: u64) {
        self.status.lock().read_offset = offset;
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the monitor task. Returns false if already requested or the
    /// shell has already finished.
    pub(crate) fn request_cancel(&self) -> bool {
        if self.state().is_terminal() || self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Record the terminal state. Only the first call takes effect.
    pub(crate) fn finish(&self, state: ShellState, exit_code: Option<i32>) -> bool {
        self.finish_at(state, exit_code, Utc::now())
    }

    pub(crate) fn finish_at(
        &self,
        state: ShellState,
        exit_code: Option<i32>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut status = self.status.lock();
        if status.state.is_terminal() {
            return false;
        }
        status.state = state;
        status.exit_code = exit_code;
        status.completed_at = Some(at);
        true
    }

    pub fn info(&self) -> ShellInfo {
        let status = self.status.lock();
        let end = status.completed_at.unwrap_or_else(Utc::now);
        ShellInfo {
            id: self.id.clone(),
            command: self.command.clone(),
            pid: self.pid,
            state: status.state,
            started_at: self.started_at,
            completed_at: status.completed_at,
            exit_code: status.exit_code,
            output_bytes: self.output.total_written(),
            elapsed_ms: (end - self.started_at).num_milliseconds().max(0) as u64,
        }
    }
}

/// Registry of shells capped by the number running at once
pub struct ShellTracker {
    shells: RwLock<HashMap<String, Arc<BackgroundShell>>>,
    max_concurrent: usize,
}

impl ShellTracker {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            shells: RwLock::new(HashMap::new()),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Track a shell. The capacity check and insert happen under one lock.
    pub fn add(&self, shell: Arc<BackgroundShell>) -> Result<(), ShellError> {
        let mut shells = self.shells.write();
        let running = shells
            .values()
            .filter(|s| s.state() == ShellState::Running)
            .count();
        if running >= self.max_concurrent {
            return Err(ShellError::CapacityReached {
                limit: self.max_concurrent,
            });
        }
        if shells.contains_key(&shell.id) {
            return Err(ShellError::Duplicate(shell.id.clone()));
        }
        shells.insert(shell.id.clone(), shell);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackgroundShell>> {
        self.shells.read().get(id).cloned()
    }

    /// All shells, oldest first.
    pub fn all(&self) -> Vec<Arc<BackgroundShell>> {
        let mut shells: Vec<_> = self.shells.read().values().cloned().collect();
        shells.sort_by_key(|s| s.started_at);
        shells
    }

    pub fn remove(&self, id: &str) -> Result<Arc<BackgroundShell>, ShellError> {
        self.shells
            .write()
            .remove(id)
            .ok_or_else(|| ShellError::NotFound(id.to_string()))
    }

    /// Drop terminal shells that finished more than `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(older_than) {
            Ok(age) => Utc::now() - age,
            Err(_) => return 0,
        };
        let mut shells = self.shells.write();
        let before = shells.len();
        shells.retain(|_, shell| {
            if !shell.state().is_terminal() {
                return true;
            }
            let finished = shell.completed_at().unwrap_or(shell.started_at);
            finished >= cutoff
        });
        before - shells.len()
    }

    pub fn count(&self) -> usize {
        self.shells.read().len()
    }

    pub fn count_running(&self) -> usize {
        self.shells
            .read()
            .values()
            .filter(|s| s.state() == ShellState::Running)
            .count()
    }
}
