//! Background shell lifecycle
//!
//! Owns the tracker and one monitor task per detached shell. The monitor
//! is the only holder of the process handle: it waits for exit or for the
//! shell's cancellation token, records the terminal state, and publishes
//! the matching shell event.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::process::{join_readers, shell_command, spawn_output_readers, terminate};
use super::ring_buffer::OutputRingBuffer;
use super::tracker::{BackgroundShell, ShellInfo, ShellState, ShellTracker};
use crate::agent::loop_events::ChatEvent;
use crate::agent::services::{EventPublisher, NoopPublisher};
use crate::config::ShellsConfig;
use crate::error::ShellError;

/// Time a cancelled shell gets to exit after SIGTERM before SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long `stop` waits for monitor tasks to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A detach that was refused. The process is handed back as it was.
#[derive(Debug)]
pub struct DetachRejected {
    pub error: ShellError,
    pub child: Child,
    pub readers: Vec<JoinHandle<()>>,
}

/// Output read from a shell since some offset
#[derive(Debug, Clone, Serialize)]
pub struct ShellOutput {
    pub shell_id: String,
    pub output: String,
    pub next_offset: u64,
    /// Bytes lost because the buffer wrapped past the requested offset
    pub skipped: u64,
    pub state: ShellState,
    pub exit_code: Option<i32>,
}

/// Shell counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShellStats {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent: usize,
}

pub struct BackgroundShellService {
    tracker: ShellTracker,
    config: ShellsConfig,
    events: Arc<dyn EventPublisher>,
    monitors: TaskTracker,
    shutdown: CancellationToken,
}

impl BackgroundShellService {
    pub fn new(config: ShellsConfig) -> Self {
        Self {
            tracker: ShellTracker::new(config.max_concurrent),
            config,
            events: Arc::new(NoopPublisher),
            monitors: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// A fresh ring buffer sized from config.
    pub fn new_buffer(&self) -> Arc<OutputRingBuffer> {
        Arc::new(OutputRingBuffer::new(self.config.buffer_bytes))
    }

    /// Sweep old terminal shells every `cleanup_interval` until [`stop`].
    ///
    /// [`stop`]: Self::stop
    pub fn start_cleanup_routine(self: &Arc<Self>) {
        let service: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.cleanup_interval();
        let retention = self.config.retention();

        self.monitors.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let Some(service) = service.upgrade() else {
                    break;
                };
                let removed = service.cleanup(retention);
                if removed > 0 {
                    tracing::info!(removed, "Swept finished background shells");
                }
            }
        });
    }

    /// Spawn `command` and detach it immediately.
    pub async fn spawn_command(
        &self,
        command: &str,
        working_dir: &Path,
    ) -> Result<String, ShellError> {
        if !self.config.enabled {
            return Err(ShellError::Disabled);
        }
        // Refuse before spawning; `detach_to_background` re-checks under the lock
        if self.tracker.count_running() >= self.tracker.max_concurrent() {
            return Err(ShellError::CapacityReached {
                limit: self.tracker.max_concurrent(),
            });
        }

        let mut child = shell_command(command, working_dir).spawn()?;
        let buffer = self.new_buffer();
        let readers = spawn_output_readers(&mut child, &buffer);

        match self.detach_to_background(child, command, buffer, readers) {
            Ok(id) => Ok(id),
            Err(rejected) => {
                let DetachRejected {
                    error,
                    mut child,
                    readers,
                } = rejected;
                terminate(&mut child, Duration::from_millis(200)).await;
                for reader in readers {
                    reader.abort();
                }
                Err(error)
            }
        }
    }

    /// Hand a running process over to a tracked background shell.
    ///
    /// `buffer` should already be receiving the process output through
    /// `readers`; any pipe still attached to `child` is hooked up here.
    pub fn detach_to_background(
        &self,
        mut child: Child,
        command: &str,
        buffer: Arc<OutputRingBuffer>,
        mut readers: Vec<JoinHandle<()>>,
    ) -> Result<String, DetachRejected> {
        if !self.config.enabled {
            return Err(DetachRejected {
                error: ShellError::Disabled,
                child,
                readers,
            });
        }

        let id = new_shell_id();
        let shell = Arc::new(BackgroundShell::new(
            id.clone(),
            command,
            child.id(),
            buffer.clone(),
        ));

        if let Err(error) = self.tracker.add(shell.clone()) {
            tracing::warn!(command = %command, error = %error, "Background shell rejected");
            return Err(DetachRejected {
                error,
                child,
                readers,
            });
        }

        readers.extend(spawn_output_readers(&mut child, &buffer));

        tracing::info!(shell_id = %id, pid = ?shell.pid, command = %command, "Shell detached to background");
        self.events.publish(ChatEvent::ShellDetached { shell: shell.info() });

        self.monitors.spawn(monitor(
            shell,
            child,
            readers,
            self.events.clone(),
            self.shutdown.clone(),
        ));

        Ok(id)
    }

    /// Output since `from_offset`, or since the last read when `None`.
    pub fn get_shell_output(
        &self,
        shell_id: &str,
        from_offset: Option<u64>,
    ) -> Result<ShellOutput, ShellError> {
        let shell = self.lookup(shell_id)?;
        let offset = from_offset.unwrap_or_else(|| shell.read_offset());
        let chunk = shell.output.read_from(offset);
        shell.set_read_offset(chunk.next_offset);

        Ok(ShellOutput {
            shell_id: shell.id.clone(),
            output: String::from_utf8_lossy(&chunk.data).into_owned(),
            next_offset: chunk.next_offset,
            skipped: chunk.skipped,
            state: shell.state(),
            exit_code: shell.exit_code(),
        })
    }

    /// Like [`get_shell_output`](Self::get_shell_output) but keeps only
    /// lines matching `pattern`. The read offset still advances past
    /// everything that was read.
    pub fn get_shell_output_filtered(
        &self,
        shell_id: &str,
        from_offset: Option<u64>,
        pattern: &str,
    ) -> Result<ShellOutput, ShellError> {
        let filter = regex::Regex::new(pattern)?;
        let mut output = self.get_shell_output(shell_id, from_offset)?;
        output.output = output
            .output
            .lines()
            .filter(|line| filter.is_match(line))
            .fold(String::new(), |mut acc, line| {
                acc.push_str(line);
                acc.push('\n');
                acc
            });
        Ok(output)
    }

    /// Ask a shell to stop. Cancelling a finished or already-cancelled
    /// shell does nothing.
    pub fn cancel_shell(&self, shell_id: &str) -> Result<(), ShellError> {
        let shell = self.lookup(shell_id)?;
        if shell.request_cancel() {
            tracing::info!(shell_id = %shell_id, "Shell cancellation requested");
        } else {
            tracing::debug!(shell_id = %shell_id, state = %shell.state(), "Shell already stopping or finished");
        }
        Ok(())
    }

    /// Stop tracking a shell, cancelling it first if still running.
    pub fn remove_shell(&self, shell_id: &str) -> Result<ShellInfo, ShellError> {
        let shell = self.tracker.remove(shell_id)?;
        shell.request_cancel();
        Ok(shell.info())
    }

    pub fn shell(&self, shell_id: &str) -> Option<ShellInfo> {
        self.tracker.get(shell_id).map(|s| s.info())
    }

    /// Every tracked shell, oldest first.
    pub fn shells(&self) -> Vec<ShellInfo> {
        self.tracker.all().iter().map(|s| s.info()).collect()
    }

    pub fn stats(&self) -> ShellStats {
        let mut stats = ShellStats {
            max_concurrent: self.tracker.max_concurrent(),
            ..Default::default()
        };
        for shell in self.tracker.all() {
            stats.total += 1;
            match shell.state() {
                ShellState::Running => stats.running += 1,
                ShellState::Completed => stats.completed += 1,
                ShellState::Failed => stats.failed += 1,
                ShellState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn count_running(&self) -> usize {
        self.tracker.count_running()
    }

    /// Remove terminal shells that finished more than `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        self.tracker.cleanup(older_than)
    }

    /// Terminate every running shell and stop the cleanup routine.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.monitors.close();
        if tokio::time::timeout(STOP_TIMEOUT, self.monitors.wait())
            .await
            .is_err()
        {
            tracing::warn!("Background shell monitors did not stop in time");
        }
    }

    fn lookup(&self, shell_id: &str) -> Result<Arc<BackgroundShell>, ShellError> {
        self.tracker
            .get(shell_id)
            .ok_or_else(|| ShellError::NotFound(shell_id.to_string()))
    }
}

fn new_shell_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("shell-{}", &uuid[..8])
}

async fn monitor(
    shell: Arc<BackgroundShell>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    events: Arc<dyn EventPublisher>,
    shutdown: CancellationToken,
) {
    let cancel = shell.cancel_token();
    let exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
        _ = shutdown.cancelled() => None,
    };

    match exit {
        Some(Ok(status)) => {
            // Let the readers flush so the final output is visible once the state is terminal
            join_readers(readers).await;
            let code = status.code();
            if status.success() {
                if shell.finish(ShellState::Completed, code) {
                    tracing::info!(shell_id = %shell.id, "Background shell completed");
                    events.publish(ChatEvent::ShellCompleted {
                        id: shell.id.clone(),
                        exit_code: code,
                    });
                }
            } else if shell.finish(ShellState::Failed, code) {
                tracing::info!(shell_id = %shell.id, exit_code = ?code, "Background shell failed");
                events.publish(ChatEvent::ShellFailed {
                    id: shell.id.clone(),
                    exit_code: code,
                    error: None,
                });
            }
        }
        Some(Err(e)) => {
            join_readers(readers).await;
            tracing::warn!(shell_id = %shell.id, error = %e, "Failed to wait on background shell");
            if shell.finish(ShellState::Failed, None) {
                events.publish(ChatEvent::ShellFailed {
                    id: shell.id.clone(),
                    exit_code: None,
                    error: Some(e.to_string()),
                });
            }
        }
        None => {
            terminate(&mut child, TERMINATE_GRACE).await;
            join_readers(readers).await;
            if shell.finish(ShellState::Cancelled, None) {
                tracing::info!(shell_id = %shell.id, "Background shell cancelled");
                events.publish(ChatEvent::ShellCancelled {
                    id: shell.id.clone(),
                });
            }
        }
    }
}
