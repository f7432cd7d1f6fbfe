//! Per-sandbox file layout.
//!
//! Paths only; nothing here holds a file open. The template and kernel
//! directories are read-only inputs. Everything the sandbox writes lives
//! under `<sandbox_root>/<sandbox_id>/`:
//!
//! ```text
//! <sandbox_root>/<sandbox_id>/
//!   build/              bind-mount target for the template dir
//!   kernel/             bind-mount target for the kernel dir
//!   firecracker.sock    API socket
//!   uffd.sock           page-server socket (huge pages only)
//! ```
//!
//! The bind mounts themselves are made by the VMM's launch command inside
//! its private mount namespace, so they vanish with the VMM. Cleanup only
//! has to remove the per-sandbox directory.

use std::io;
use std::path::{Path, PathBuf};

use ember_core::{NodeConfig, SandboxConfig};

use crate::SandboxError;

pub const ROOTFS_FILE: &str = "rootfs.ext4";
pub const SNAPFILE: &str = "snapfile";
pub const MEMFILE: &str = "memfile";
pub const KERNEL_FILE: &str = "vmlinux.bin";

/// Resolved paths for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    pub template_dir: PathBuf,
    pub kernel_dir: PathBuf,
    pub firecracker_binary: PathBuf,
    pub uffd_binary: PathBuf,
    pub sandbox_dir: PathBuf,
    pub build_dir: PathBuf,
    pub kernel_mount_dir: PathBuf,
    pub socket_path: PathBuf,
    pub uffd_socket_path: Option<PathBuf>,
    pub memfile_path: PathBuf,
    pub snapfile_path: PathBuf,
}

impl FileLayout {
    /// Resolve every path for `sandbox` without touching the filesystem.
    ///
    /// `sandbox` must already have passed [`SandboxConfig::validate`], which
    /// keeps its ids from escaping the roots.
    #[must_use]
    pub fn new(node: &NodeConfig, sandbox: &SandboxConfig) -> Self {
        let template_dir = node.template_dir(&sandbox.template_id);
        let sandbox_dir = node.sandbox_root.join(&sandbox.sandbox_id);
        Self {
            memfile_path: template_dir.join(MEMFILE),
            snapfile_path: template_dir.join(SNAPFILE),
            kernel_dir: node.kernel_dir(&sandbox.kernel_version),
            firecracker_binary: node.firecracker_binary(&sandbox.firecracker_version),
            uffd_binary: node.uffd_binary(&sandbox.firecracker_version),
            build_dir: sandbox_dir.join("build"),
            kernel_mount_dir: sandbox_dir.join("kernel"),
            socket_path: sandbox_dir.join("firecracker.sock"),
            uffd_socket_path: sandbox.huge_pages.then(|| sandbox_dir.join("uffd.sock")),
            template_dir,
            sandbox_dir,
        }
    }

    /// Check that every artifact the sandbox needs exists.
    ///
    /// # Errors
    /// Returns [`SandboxError::TemplateNotFound`] naming the first missing
    /// file.
    pub async fn validate_artifacts(&self) -> Result<(), SandboxError> {
        let mut required = vec![
            self.template_dir.join(ROOTFS_FILE),
            self.snapfile_path.clone(),
            self.memfile_path.clone(),
            self.kernel_dir.join(KERNEL_FILE),
            self.firecracker_binary.clone(),
        ];
        if self.uffd_socket_path.is_some() {
            required.push(self.uffd_binary.clone());
        }
        for path in required {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(SandboxError::TemplateNotFound { path });
            }
        }
        Ok(())
    }

    /// Create the per-sandbox directory and both mount targets, and remove
    /// sockets a crashed process left behind.
    ///
    /// A leftover API socket would make the readiness wait return before the
    /// new VMM has bound it.
    ///
    /// # Errors
    /// Returns [`SandboxError::MountFailed`] naming the path that could not
    /// be created or cleared.
    pub async fn prepare(&self) -> Result<(), SandboxError> {
        for dir in [&self.build_dir, &self.kernel_mount_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SandboxError::MountFailed {
                    path: dir.clone(),
                    source,
                })?;
        }
        for socket in std::iter::once(&self.socket_path).chain(&self.uffd_socket_path) {
            match tokio::fs::remove_file(socket).await {
                Ok(()) => tracing::warn!(path = %socket.display(), "removed stale socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(SandboxError::MountFailed {
                        path: socket.clone(),
                        source,
                    });
                }
            }
        }
        tracing::debug!(dir = %self.sandbox_dir.display(), "sandbox directory prepared");
        Ok(())
    }

    /// Remove the per-sandbox directory. Idempotent.
    ///
    /// # Errors
    /// Returns the I/O error if the directory exists but cannot be removed.
    pub async fn cleanup(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.sandbox_dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }
}
