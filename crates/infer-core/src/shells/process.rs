//! Process plumbing shared by the bash tool and background shells

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::ring_buffer::OutputRingBuffer;

const READ_CHUNK: usize = 8 * 1024;

/// Build a `sh -c` command in its own process group with piped output.
pub(crate) fn shell_command(command: &str, working_dir: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };
    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // New process group so the whole tree can be signalled at once
    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

/// Pump the child's stdout and stderr into `buffer` until both close.
pub(crate) fn spawn_output_readers(
    child: &mut Child,
    buffer: &Arc<OutputRingBuffer>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        handles.push(tokio::spawn(pump(stdout, buffer.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(tokio::spawn(pump(stderr, buffer.clone())));
    }
    handles
}

async fn pump<R>(mut pipe: R, buffer: Arc<OutputRingBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.write(&chunk[..n]);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// SIGTERM the process group, then SIGKILL if it outlives `grace`.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    #[cfg(unix)]
    signal_term(pid);

    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child.start_kill();
    }

    if timeout(grace, child.wait()).await.is_err() {
        tracing::debug!(pid, "Process ignored SIGTERM, killing");
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
fn signal_term(pid: u32) {
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let group_ok = unsafe { libc::kill(-pid, libc::SIGTERM) } == 0;
    if !group_ok {
        // SAFETY: as above.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

/// Wait for reader tasks, giving up after a short delay so a grandchild
/// holding the pipe open cannot stall the caller.
pub(crate) async fn join_readers(handles: Vec<JoinHandle<()>>) {
    for mut handle in handles {
        if timeout(Duration::from_millis(500), &mut handle).await.is_err() {
            handle.abort();
        }
    }
}
