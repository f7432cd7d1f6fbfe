//! Firecracker process supervision.
//!
//! A VMM is launched as
//!
//! ```text
//! unshare -pfm --kill-child -- bash -c \
//!   "mount --bind <template> <build> && mount --bind <kernel> <kernel_mount> \
//!    && ip netns exec <ns> <firecracker> --api-sock <socket>"
//! ```
//!
//! so the bind mounts live in a private mount namespace, the VMM gets its own
//! PID namespace (killing the `unshare` leader takes the whole tree down) and
//! Firecracker itself runs inside the sandbox's network namespace.
//!
//! It is then driven over its API socket: `PUT /snapshot/load` resumes the
//! VM from the template snapshot and `PUT /mmds` installs guest metadata.
//!
//! # API Reference
//! Firecracker API spec: `firecracker/src/api_server/swagger/firecracker.yaml`

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ember_core::MmdsMetadata;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::backend::VmmBackend;
use crate::files::FileLayout;
use crate::telemetry::{LogStream, TelemetrySink};
use crate::unix_client::put_json;
use crate::VmmError;

/// Where Firecracker gets guest memory from on snapshot load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "backend_type")]
pub enum MemoryBackend {
    /// Map the memfile directly.
    File { backend_path: PathBuf },
    /// Attach to a uffd page server listening on this socket.
    Uffd { backend_path: PathBuf },
}

impl MemoryBackend {
    /// The uffd socket if the layout has one, otherwise the memfile.
    #[must_use]
    pub fn for_layout(files: &FileLayout) -> Self {
        match &files.uffd_socket_path {
            Some(socket) => Self::Uffd { backend_path: socket.clone() },
            None => Self::File { backend_path: files.memfile_path.clone() },
        }
    }
}

/// Body of `PUT /snapshot/load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotLoad {
    pub snapshot_path: PathBuf,
    pub mem_backend: MemoryBackend,
    pub enable_diff_snapshots: bool,
    pub resume_vm: bool,
}

impl SnapshotLoad {
    /// Load `snapshot_path` and resume immediately.
    #[must_use]
    pub fn resume(snapshot_path: PathBuf, mem_backend: MemoryBackend) -> Self {
        Self {
            snapshot_path,
            mem_backend,
            enable_diff_snapshots: false,
            resume_vm: true,
        }
    }
}

/// How to launch one VMM: the bind mounts to make, then the Firecracker
/// exec inside the network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    /// `(source, target)` pairs, mounted in order.
    pub mounts: Vec<(PathBuf, PathBuf)>,
    pub namespace: String,
    pub binary: PathBuf,
    pub socket_path: PathBuf,
}

impl SpawnPlan {
    #[must_use]
    pub fn new(files: &FileLayout, namespace: impl Into<String>) -> Self {
        Self {
            mounts: vec![
                (files.template_dir.clone(), files.build_dir.clone()),
                (files.kernel_dir.clone(), files.kernel_mount_dir.clone()),
            ],
            namespace: namespace.into(),
            binary: files.firecracker_binary.clone(),
            socket_path: files.socket_path.clone(),
        }
    }

    /// The `bash -c` script: every mount, then the exec, joined by `&&`.
    #[must_use]
    pub fn script(&self) -> String {
        let mut steps: Vec<String> = self
            .mounts
            .iter()
            .map(|(source, target)| {
                format!("mount --bind {} {}", quote_path(source), quote_path(target))
            })
            .collect();
        steps.push(format!(
            "ip netns exec {} {} --api-sock {}",
            shell_quote(&self.namespace),
            quote_path(&self.binary),
            quote_path(&self.socket_path),
        ));
        steps.join(" && ")
    }

    /// Full argv of the launch command.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        ["unshare", "-pfm", "--kill-child", "--", "bash", "-c"]
            .into_iter()
            .map(str::to_owned)
            .chain(std::iter::once(self.script()))
            .collect()
    }
}

/// Single-quote `s` for POSIX shells.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Where a VMM is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmState {
    /// Process started, API socket not yet present.
    Spawned,
    /// API socket present.
    ApiReady,
    /// Snapshot loaded and MMDS set; the guest is running.
    Loaded,
    /// The process was reaped after a successful start. Terminal.
    Exited,
    /// Startup failed before `Loaded`. Terminal.
    Failed,
}

impl VmmState {
    #[must_use]
    pub fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Spawned, Self::ApiReady | Self::Failed)
                | (Self::ApiReady, Self::Loaded | Self::Failed)
                | (Self::Loaded, Self::Exited)
        )
    }
}

/// A spawned VMM process.
///
/// Not `Clone`; the sandbox owns it (behind an `Arc` so its cleanup step can
/// reach it).
#[derive(Debug)]
pub struct VmmHandle {
    sandbox_id: String,
    socket_path: PathBuf,
    pid: Option<i32>,
    child: tokio::sync::Mutex<Child>,
    state: Mutex<VmmState>,
    exited: AtomicBool,
}

impl VmmHandle {
    /// Wrap a freshly spawned process. Piped stdout/stderr are drained into
    /// `telemetry` by one background task per stream; each ends at EOF.
    #[must_use]
    pub fn from_child(
        sandbox_id: &str,
        socket_path: PathBuf,
        mut child: Child,
        telemetry: &Arc<dyn TelemetrySink>,
    ) -> Self {
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, sandbox_id.to_owned(), LogStream::Stdout, Arc::clone(telemetry));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, sandbox_id.to_owned(), LogStream::Stderr, Arc::clone(telemetry));
        }
        Self {
            sandbox_id: sandbox_id.to_owned(),
            socket_path,
            pid: child.id().and_then(|id| i32::try_from(id).ok()),
            child: tokio::sync::Mutex::new(child),
            state: Mutex::new(VmmState::Spawned),
            exited: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid.and_then(|pid| u32::try_from(pid).ok())
    }

    #[must_use]
    pub fn state(&self) -> VmmState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the state machine allows it. Returns whether it did.
    pub fn advance(&self, next: VmmState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_become(next) {
            tracing::debug!(sandbox_id = %self.sandbox_id, from = ?*state, to = ?next, "vmm state");
            *state = next;
            true
        } else {
            false
        }
    }

    /// Exit status if the process has already exited. Never blocks on a
    /// concurrent [`wait`](Self::wait).
    pub fn try_exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.try_lock().ok()?;
        let status = child.try_wait().ok().flatten()?;
        self.exited.store(true, Ordering::SeqCst);
        Some(status)
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    /// Returns the I/O error from waiting on the child.
    pub async fn wait(&self) -> io::Result<ExitStatus> {
        let status = self.child.lock().await.wait().await?;
        self.exited.store(true, Ordering::SeqCst);
        self.advance(VmmState::Exited);
        Ok(status)
    }

    /// SIGKILL the `unshare` leader, taking its PID namespace with it.
    ///
    /// Idempotent and non-blocking; reaping is left to [`wait`](Self::wait).
    pub fn stop(&self) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => tracing::info!(sandbox_id = %self.sandbox_id, pid, "vmm killed"),
            Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %self.sandbox_id,
                    pid,
                    error = %e,
                    "killing vmm failed"
                );
            }
        }
    }
}

fn forward_lines<R>(
    stream: R,
    sandbox_id: String,
    kind: LogStream,
    telemetry: Arc<dyn TelemetrySink>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => telemetry.vmm_output(&sandbox_id, kind, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(
                        sandbox_id = %sandbox_id,
                        stream = %kind,
                        error = %e,
                        "vmm output reader stopped"
                    );
                    break;
                }
            }
        }
    });
}

const SOCKET_POLL_START: Duration = Duration::from_millis(10);
const SOCKET_POLL_MAX: Duration = Duration::from_millis(250);

/// Poll for the API socket with exponential backoff.
///
/// # Errors
/// Returns [`VmmError::StartupFailed`] if the process exits before the
/// socket appears, or [`VmmError::ApiSocketTimeout`] once `timeout` passes.
pub async fn wait_for_api_socket(handle: &VmmHandle, timeout: Duration) -> Result<(), VmmError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = SOCKET_POLL_START;
    loop {
        if tokio::fs::try_exists(handle.socket_path()).await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(status) = handle.try_exit_status() {
            return Err(VmmError::StartupFailed(format!(
                "process exited with {status} before its API socket appeared"
            )));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(VmmError::ApiSocketTimeout {
                socket: handle.socket_path().to_owned(),
                timeout,
            });
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(SOCKET_POLL_MAX);
    }
}

/// [`VmmBackend`] that launches real Firecracker processes.
#[derive(Clone)]
pub struct FirecrackerBackend {
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for FirecrackerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirecrackerBackend").finish_non_exhaustive()
    }
}

impl FirecrackerBackend {
    #[must_use]
    pub fn new(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { telemetry }
    }
}

#[async_trait]
impl VmmBackend for FirecrackerBackend {
    async fn spawn(&self, sandbox_id: &str, plan: &SpawnPlan) -> Result<VmmHandle, VmmError> {
        let argv = plan.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(VmmError::StartupFailed("empty launch command".to_owned()));
        };

        tracing::info!(
            sandbox_id,
            namespace = %plan.namespace,
            socket = %plan.socket_path.display(),
            "spawning firecracker"
        );
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmmError::StartupFailed(format!("exec {program}: {e}")))?;

        Ok(VmmHandle::from_child(
            sandbox_id,
            plan.socket_path.clone(),
            child,
            &self.telemetry,
        ))
    }

    async fn load_snapshot(
        &self,
        handle: &VmmHandle,
        request: &SnapshotLoad,
    ) -> Result<(), VmmError> {
        put_json(handle.socket_path(), "/snapshot/load", request)
            .await
            .map_err(|e| VmmError::SnapshotLoadFailed(e.to_string()))?;
        tracing::info!(sandbox_id = %handle.sandbox_id(), "snapshot loaded, vm resumed");
        Ok(())
    }

    async fn set_mmds(&self, handle: &VmmHandle, metadata: &MmdsMetadata) -> Result<(), VmmError> {
        put_json(handle.socket_path(), "/mmds", metadata)
            .await
            .map_err(|e| VmmError::MmdsSetFailed(e.to_string()))?;
        Ok(())
    }
}
