//! A live sandbox and what is reported about it.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ember_core::{addressing, CleanupStack, SandboxConfig, Slot};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::files::FileLayout;
use crate::firecracker::VmmHandle;
use crate::uffd::UffdHelper;

/// What `List` returns per sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub config: SandboxConfig,
    pub client_id: String,
    pub started_at: DateTime<Utc>,
}

/// A running sandbox. Owns its slot, file layout and VMM; all of them are
/// released by unwinding its cleanup stack, in reverse creation order.
#[derive(Debug)]
pub struct Sandbox {
    config: SandboxConfig,
    client_id: String,
    slot: Slot,
    files: FileLayout,
    vmm: Arc<VmmHandle>,
    uffd: Option<Arc<UffdHelper>>,
    started_at: DateTime<Utc>,
    cleanup: Mutex<Option<CleanupStack>>,
    background: CancellationToken,
    cleaned: CancellationToken,
}

impl Sandbox {
    pub(crate) fn new(
        config: SandboxConfig,
        client_id: String,
        slot: Slot,
        files: FileLayout,
        vmm: Arc<VmmHandle>,
        uffd: Option<Arc<UffdHelper>>,
        cleanup: CleanupStack,
    ) -> Self {
        Self {
            config,
            client_id,
            slot,
            files,
            vmm,
            uffd,
            started_at: Utc::now(),
            cleanup: Mutex::new(Some(cleanup)),
            background: CancellationToken::new(),
            cleaned: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.sandbox_id
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    #[must_use]
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    #[must_use]
    pub fn files(&self) -> &FileLayout {
        &self.files
    }

    #[must_use]
    pub fn vmm(&self) -> &VmmHandle {
        &self.vmm
    }

    #[must_use]
    pub fn uses_uffd(&self) -> bool {
        self.uffd.is_some()
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Host-routable address of the guest.
    #[must_use]
    pub fn vm_ip(&self) -> Ipv4Addr {
        addressing::host_vm_ip(self.slot.index())
    }

    #[must_use]
    pub fn info(&self) -> SandboxInfo {
        SandboxInfo {
            config: self.config.clone(),
            client_id: self.client_id.clone(),
            started_at: self.started_at,
        }
    }

    /// Cancelled when the VMM exits; ends per-sandbox background work.
    pub(crate) fn background(&self) -> &CancellationToken {
        &self.background
    }

    /// Unwind the cleanup stack. Only the first call does anything; returns
    /// the number of failed steps.
    pub(crate) async fn run_cleanup(&self) -> usize {
        let Some(stack) = self.cleanup.lock().await.take() else {
            return 0;
        };
        stack.unwind().await.len()
    }

    pub(crate) fn mark_cleaned(&self) {
        self.cleaned.cancel();
    }

    /// Resolves once every resource of this sandbox has been released.
    pub async fn cleaned(&self) {
        self.cleaned.cancelled().await;
    }
}
