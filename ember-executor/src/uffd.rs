//! Userfaultfd page server supervision.
//!
//! With huge pages enabled, Firecracker attaches guest memory to a Unix
//! socket instead of mapping the memfile, and a companion process serves
//! page faults from the memfile. This module starts that process, waits for
//! its socket, and stops it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::UffdError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A running uffd helper.
///
/// `stop` may be called concurrently from a user stop and from the
/// sandbox's cleanup; the child lives behind a mutex so only one of them
/// signals it.
#[derive(Debug)]
pub struct UffdHelper {
    socket_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl UffdHelper {
    /// Spawn `<binary> <socket_path> <memfile_path>`.
    ///
    /// # Errors
    /// Returns [`UffdError::StartFailed`] if the process cannot be spawned.
    pub fn start(
        binary: &Path,
        socket_path: &Path,
        memfile_path: &Path,
    ) -> Result<Self, UffdError> {
        let child = Command::new(binary)
            .arg(socket_path)
            .arg(memfile_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UffdError::StartFailed(format!("exec {}: {e}", binary.display())))?;

        tracing::info!(socket = %socket_path.display(), pid = ?child.id(), "uffd helper started");
        Ok(Self {
            socket_path: socket_path.to_owned(),
            child: Mutex::new(Some(child)),
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait until the helper has created its socket.
    ///
    /// # Errors
    /// Returns [`UffdError::StartFailed`] if the helper exits first, or
    /// [`UffdError::SocketTimeout`] if `timeout` elapses.
    pub async fn wait_for_socket(&self, timeout: Duration) -> Result<(), UffdError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::fs::try_exists(&self.socket_path).await.unwrap_or(false) {
                return Ok(());
            }
            if let Some(child) = self.child.lock().await.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(UffdError::StartFailed(format!("helper exited with {status}")));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(UffdError::SocketTimeout {
                    socket: self.socket_path.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Terminate the helper: SIGTERM, then SIGKILL if it is still running
    /// after `grace`. Idempotent.
    pub async fn stop(&self, grace: Duration) {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM to uffd helper failed");
            }
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => tracing::debug!(?status, "uffd helper exited"),
            Err(_) => {
                tracing::warn!(
                    socket = %self.socket_path.display(),
                    "uffd helper ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "killing uffd helper failed");
                }
            }
        }
    }
}
