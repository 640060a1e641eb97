//! Starting external programs and observing their exit without blocking the caller.

use crate::model::ExitOutcome;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("not permitted to execute {}", .0.display())]
    LaunchDenied(PathBuf),

    #[error("failed to start {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One in-flight process. Consumed by [`ProcessLauncher::on_exit`].
#[derive(Debug)]
pub struct LaunchHandle {
    child: Child,
    pid: Option<u32>,
}

impl LaunchHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Spawn `executable` and return a handle for exit tracking.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, executable: &Path) -> Result<LaunchHandle, LaunchError> {
        let mut cmd = Command::new(executable);
        cmd.stdin(Stdio::null()).kill_on_drop(false);

        let child = cmd.spawn().map_err(|e| classify_spawn_error(executable, e))?;
        let pid = child.id();
        tracing::info!(path = %executable.display(), ?pid, "process started");
        Ok(LaunchHandle { child, pid })
    }

    /// Start `executable` without tracking it. Used for trial runs outside a launch cycle.
    pub fn start_detached(&self, executable: &Path) -> Result<Option<u32>, LaunchError> {
        let handle = self.start(executable)?;
        let pid = handle.pid;
        // Reap in the background so no zombie lingers while we keep running.
        tokio::spawn(async move {
            let mut child = handle.child;
            let _ = child.wait().await;
        });
        Ok(pid)
    }

    /// Deliver the process exit to `callback`, exactly once.
    ///
    /// The wait happens on a Tokio task and the callback runs on the blocking
    /// pool, never on the thread that called [`start`](Self::start).
    pub fn on_exit<F>(&self, handle: LaunchHandle, callback: F)
    where
        F: FnOnce(ExitOutcome) + Send + 'static,
    {
        let LaunchHandle { mut child, pid } = handle;
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => exit_outcome(status),
                Err(e) => ExitOutcome::WaitFailed(e.to_string()),
            };
            tracing::info!(?pid, %outcome, "process exited");
            if let Err(e) = tokio::task::spawn_blocking(move || callback(outcome)).await {
                tracing::error!(?pid, error = %e, "exit callback failed");
            }
        });
    }
}

fn classify_spawn_error(path: &Path, e: io::Error) -> LaunchError {
    match e.kind() {
        io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => LaunchError::LaunchDenied(path.to_path_buf()),
        _ => LaunchError::Spawn {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

fn exit_outcome(status: ExitStatus) -> ExitOutcome {
    match status.code() {
        Some(code) => ExitOutcome::Exited(code),
        None => ExitOutcome::Terminated(termination_signal(status)),
    }
}

#[cfg(unix)]
fn termination_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: ExitStatus) -> Option<i32> {
    None
}
