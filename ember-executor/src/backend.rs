//! VMM backend abstraction trait.
//!
//! The sandbox lifecycle drives a VMM through these four steps without
//! knowing how the process is launched or how its API is reached, so tests
//! can stand in a fake that needs neither root nor KVM.

use std::time::Duration;

use async_trait::async_trait;
use ember_core::MmdsMetadata;

use crate::firecracker::{wait_for_api_socket, SnapshotLoad, SpawnPlan, VmmHandle};
use crate::VmmError;

/// Virtual Machine Manager abstraction.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
///
/// # Cancel Safety
/// Dropping any of these futures leaves at most a running process behind,
/// which the returned (or already held) [`VmmHandle`] can still stop.
#[async_trait]
pub trait VmmBackend: Send + Sync {
    /// Launch the VMM described by `plan`.
    ///
    /// # Errors
    /// Returns [`VmmError::StartupFailed`] if the process cannot be started.
    async fn spawn(&self, sandbox_id: &str, plan: &SpawnPlan) -> Result<VmmHandle, VmmError>;

    /// Wait until the API socket is accepting requests.
    ///
    /// # Errors
    /// Returns [`VmmError::StartupFailed`] if the process exits first, or
    /// [`VmmError::ApiSocketTimeout`] once `timeout` passes.
    async fn wait_api_ready(&self, handle: &VmmHandle, timeout: Duration) -> Result<(), VmmError> {
        wait_for_api_socket(handle, timeout).await
    }

    /// Load the snapshot and resume the guest.
    ///
    /// # Errors
    /// Returns [`VmmError::SnapshotLoadFailed`] if the API call fails.
    async fn load_snapshot(
        &self,
        handle: &VmmHandle,
        request: &SnapshotLoad,
    ) -> Result<(), VmmError>;

    /// Install the guest metadata.
    ///
    /// # Errors
    /// Returns [`VmmError::MmdsSetFailed`] if the API call fails.
    async fn set_mmds(&self, handle: &VmmHandle, metadata: &MmdsMetadata) -> Result<(), VmmError>;
}
