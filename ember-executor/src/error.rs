//! Error types for the executor crate.

use std::path::PathBuf;
use std::time::Duration;

use ember_core::CoreError;
use ember_net::{AllocError, KvError, NetworkError};

/// Errors from spawning and driving a Firecracker process.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VmmError {
    /// The process could not be started, or exited before its API socket
    /// appeared.
    #[error("VMM startup failed: {0}")]
    StartupFailed(String),

    /// The API socket did not appear in time.
    #[error("API socket {} did not appear within {timeout:?}", socket.display())]
    ApiSocketTimeout { socket: PathBuf, timeout: Duration },

    /// `PUT /snapshot/load` failed.
    #[error("snapshot load failed: {0}")]
    SnapshotLoadFailed(String),

    /// `PUT /mmds` failed.
    #[error("setting MMDS failed: {0}")]
    MmdsSetFailed(String),

    /// Firecracker API request failed at the transport or HTTP level.
    #[error("API request failed: {0}")]
    Api(String),
}

/// Errors from the userfaultfd page server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UffdError {
    /// The helper could not be spawned or exited early.
    #[error("uffd helper failed to start: {0}")]
    StartFailed(String),

    /// The helper's socket did not appear in time.
    #[error("uffd socket {} did not appear within {timeout:?}", socket.display())]
    SocketTimeout { socket: PathBuf, timeout: Duration },
}

/// How an error is reported to RPC callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Stable label used in sanitized responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

/// Errors from sandbox lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] CoreError),

    /// A sandbox with this id is running or being created.
    #[error("sandbox {sandbox_id} already exists")]
    AlreadyExists { sandbox_id: String },

    /// A template, kernel or firecracker artifact is missing.
    #[error("template artifact missing: {}", path.display())]
    TemplateNotFound { path: PathBuf },

    /// No running sandbox has this id.
    #[error("sandbox {sandbox_id} not found")]
    NotFound { sandbox_id: String },

    /// Slot reservation failed (KV outage or exhaustion).
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    /// A per-sandbox directory or mount target could not be prepared.
    #[error("preparing {}: {source}", path.display())]
    MountFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Uffd(#[from] UffdError),

    #[error(transparent)]
    Vmm(#[from] VmmError),

    /// The create deadline passed before the sandbox was running.
    #[error("create did not finish within {timeout:?}")]
    Timeout { timeout: Duration },

    /// The node is shutting down and accepts no new sandboxes.
    #[error("node is shutting down")]
    ShuttingDown,
}

impl SandboxError {
    /// Classify for RPC status mapping.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_)
            | Self::AlreadyExists { .. }
            | Self::TemplateNotFound { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this is the allocator running out of slots.
    #[must_use]
    pub fn is_slot_exhausted(&self) -> bool {
        matches!(self, Self::Alloc(AllocError::SlotExhausted { .. }))
    }

    /// Whether the KV store was unreachable.
    #[must_use]
    pub fn is_kv_unavailable(&self) -> bool {
        matches!(self, Self::Alloc(AllocError::Kv(KvError::Unavailable(_))))
    }
}
