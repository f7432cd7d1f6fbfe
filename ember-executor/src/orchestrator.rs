//! Sandbox lifecycle: create, stop, list, and the background waiter.
//!
//! Create composes, in order: slot reservation, network build, file layout,
//! optional uffd helper, VMM spawn and snapshot load. Every step pushes its
//! undo onto one [`CleanupStack`]. A failed or timed-out create unwinds it
//! before returning; a successful one hands it to the sandbox, and the
//! waiter unwinds it once the VMM exits.

use std::sync::Arc;
use std::time::Duration;

use ember_core::{
    addressing, CleanupStack, MmdsMetadata, NodeConfig, SandboxConfig, Slot, UndoError,
};
use ember_net::{NetworkBuilder, SlotAllocator};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::VmmBackend;
use crate::clock::{ClockSync, SyncOutcome};
use crate::files::FileLayout;
use crate::firecracker::{MemoryBackend, SnapshotLoad, SpawnPlan, VmmHandle, VmmState};
use crate::registry::Registry;
use crate::sandbox::{Sandbox, SandboxInfo};
use crate::telemetry::{LifecycleEvent, TelemetrySink};
use crate::uffd::UffdHelper;
use crate::{SandboxError, VmmError};

/// Resources held by a create that has finished provisioning.
struct Provisioned {
    slot: Slot,
    vmm: Arc<VmmHandle>,
    uffd: Option<Arc<UffdHelper>>,
}

/// Maximum lifetime for `hours` units of `unit`; `0` means unlimited.
#[must_use]
pub fn instance_deadline(hours: u32, unit: Duration) -> Option<Duration> {
    if hours == 0 {
        return None;
    }
    unit.checked_mul(hours)
}

/// Owns every sandbox on this node.
///
/// All operations are safe to call concurrently.
pub struct SandboxOrchestrator {
    config: Arc<NodeConfig>,
    allocator: SlotAllocator,
    network: NetworkBuilder,
    backend: Arc<dyn VmmBackend>,
    telemetry: Arc<dyn TelemetrySink>,
    http: reqwest::Client,
    registry: Arc<Registry<Sandbox>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("node_id", &self.config.node_id)
            .field("sandboxes", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl SandboxOrchestrator {
    #[must_use]
    pub fn new(
        config: Arc<NodeConfig>,
        allocator: SlotAllocator,
        network: NetworkBuilder,
        backend: Arc<dyn VmmBackend>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            allocator,
            network,
            backend,
            telemetry,
            http: reqwest::Client::new(),
            registry: Arc::new(Registry::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Create a sandbox and start supervising it.
    ///
    /// Returns once the guest is running; clock resync continues in the
    /// background.
    ///
    /// # Errors
    /// - [`SandboxError::InvalidRequest`] / [`SandboxError::TemplateNotFound`]
    ///   / [`SandboxError::AlreadyExists`] before anything is reserved. An id
    ///   stays taken until the previous sandbox with it is cleaned up.
    /// - Any setup failure, or [`SandboxError::Timeout`] past the create
    ///   deadline, after everything already built has been cleaned up.
    pub async fn create(&self, config: SandboxConfig) -> Result<Arc<Sandbox>, SandboxError> {
        config.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(SandboxError::ShuttingDown);
        }
        let id = config.sandbox_id.clone();
        if !self.registry.reserve(&id) {
            return Err(SandboxError::AlreadyExists { sandbox_id: id });
        }

        let files = FileLayout::new(&self.config, &config);
        if let Err(e) = files.validate_artifacts().await {
            self.registry.abandon(&id);
            return Err(e);
        }

        tracing::info!(
            sandbox_id = %id,
            template_id = %config.template_id,
            "creating sandbox"
        );
        let mut undo = CleanupStack::new(id.clone());
        let mut reserved = None;
        let timeout = self.config.create_timeout;
        let provision = self.provision(&config, &files, &mut undo, &mut reserved);
        let result = match tokio::time::timeout(timeout, provision).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout { timeout }),
        };

        let provisioned = match result {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %id,
                    error = %e,
                    steps = undo.len(),
                    "create failed, cleaning up"
                );
                if let (SandboxError::Timeout { .. }, Some(slot)) = (&e, &reserved) {
                    self.sweep_network(slot, &id).await;
                }
                let failures = undo.unwind().await;
                if !failures.is_empty() {
                    tracing::error!(
                        sandbox_id = %id,
                        failed = failures.len(),
                        "cleanup after failed create was incomplete"
                    );
                }
                self.registry.abandon(&id);
                let failed = LifecycleEvent::CreateFailed {
                    reason: e.to_string(),
                };
                self.telemetry.lifecycle(&id, &failed);
                return Err(e);
            }
        };

        let sandbox = Arc::new(Sandbox::new(
            config,
            self.config.node_id.clone(),
            provisioned.slot,
            files,
            provisioned.vmm,
            provisioned.uffd,
            undo,
        ));
        self.registry.activate(&id, Arc::clone(&sandbox));
        self.spawn_waiter(Arc::clone(&sandbox));
        self.spawn_clock_sync(&sandbox);
        self.telemetry.lifecycle(&id, &LifecycleEvent::Created);
        tracing::info!(
            sandbox_id = %id,
            slot = sandbox.slot().index(),
            vm_ip = %sandbox.vm_ip(),
            "sandbox running"
        );

        if self.shutdown.is_cancelled() && self.registry.retire_if_same(&id, &sandbox) {
            // Raced with shutdown; it already collected the running set.
            sandbox.vmm().stop();
        }
        Ok(sandbox)
    }

    async fn provision(
        &self,
        config: &SandboxConfig,
        files: &FileLayout,
        undo: &mut CleanupStack,
        reserved: &mut Option<Slot>,
    ) -> Result<Provisioned, SandboxError> {
        let id = config.sandbox_id.as_str();

        let slot = self.allocator.reserve().await?;
        *reserved = Some(slot.clone());
        let allocator = self.allocator.clone();
        let held = slot.clone();
        undo.push("release slot", async move { allocator.release(&held).await });

        self.network.build_into(&slot, id, undo).await?;

        let layout = files.clone();
        undo.push("remove sandbox directory", async move { layout.cleanup().await });
        files.prepare().await?;

        let uffd = match &files.uffd_socket_path {
            Some(socket) => {
                let helper = UffdHelper::start(&files.uffd_binary, socket, &files.memfile_path)?;
                let helper = Arc::new(helper);
                let stopping = Arc::clone(&helper);
                let grace = self.config.uffd_stop_grace;
                undo.push("stop uffd helper", async move {
                    stopping.stop(grace).await;
                    Ok::<(), UndoError>(())
                });
                helper.wait_for_socket(self.config.uffd_socket_timeout).await?;
                Some(helper)
            }
            None => None,
        };

        let plan = SpawnPlan::new(files, addressing::namespace_name(slot.index()));
        let vmm = Arc::new(self.backend.spawn(id, &plan).await?);
        let stopping = Arc::clone(&vmm);
        undo.push("stop vmm", async move {
            stopping.stop();
            stopping.wait().await.map(|_| ())
        });

        if let Err(e) = self.start_vmm(&vmm, files, config).await {
            vmm.advance(VmmState::Failed);
            vmm.stop();
            return Err(e.into());
        }
        Ok(Provisioned { slot, vmm, uffd })
    }

    /// Remove whatever a network step cut off by the create deadline may
    /// have built without recording its undo.
    async fn sweep_network(&self, slot: &Slot, sandbox_id: &str) {
        if let Err(e) = self.network.teardown(slot.index(), sandbox_id).await {
            tracing::error!(sandbox_id, error = %e, "network sweep after timeout failed");
        }
    }

    async fn start_vmm(
        &self,
        vmm: &VmmHandle,
        files: &FileLayout,
        config: &SandboxConfig,
    ) -> Result<(), VmmError> {
        self.backend
            .wait_api_ready(vmm, self.config.api_socket_timeout)
            .await?;
        vmm.advance(VmmState::ApiReady);

        let memory = MemoryBackend::for_layout(files);
        let load = SnapshotLoad::resume(files.snapfile_path.clone(), memory);
        self.backend.load_snapshot(vmm, &load).await?;

        let metadata = MmdsMetadata::for_sandbox(config, &self.config.logs_proxy_address);
        self.backend.set_mmds(vmm, &metadata).await?;
        vmm.advance(VmmState::Loaded);
        Ok(())
    }

    fn spawn_waiter(&self, sandbox: Arc<Sandbox>) {
        let registry = Arc::clone(&self.registry);
        let telemetry = Arc::clone(&self.telemetry);
        let unit = self.config.instance_length_unit;
        self.tasks.spawn(supervise(registry, telemetry, sandbox, unit));
    }

    fn spawn_clock_sync(&self, sandbox: &Sandbox) {
        let sync = ClockSync::new(
            self.http.clone(),
            sandbox.vm_ip(),
            self.config.agent_port,
            self.config.clock_sync_interval,
        );
        let cancel = sandbox.background().clone();
        let telemetry = Arc::clone(&self.telemetry);
        let id = sandbox.id().to_owned();
        self.tasks.spawn(async move {
            match sync.run(&cancel).await {
                SyncOutcome::Synced { attempts } => {
                    telemetry.lifecycle(&id, &LifecycleEvent::ClockSynced { attempts });
                }
                SyncOutcome::Cancelled { attempts } => {
                    tracing::debug!(sandbox_id = %id, attempts, "clock sync abandoned");
                }
            }
        });
    }

    /// Stop a running sandbox. Returns at once; the waiter cleans up.
    ///
    /// The returned handle resolves [`Sandbox::cleaned`] when cleanup ends.
    /// Until then the id is hidden from lookups but cannot be reused.
    ///
    /// # Errors
    /// Returns [`SandboxError::NotFound`] if no running sandbox has this id
    /// (including one that is still being created or already stopping).
    pub fn stop(&self, sandbox_id: &str) -> Result<Arc<Sandbox>, SandboxError> {
        let sandbox = self
            .registry
            .take(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound {
                sandbox_id: sandbox_id.to_owned(),
            })?;
        tracing::info!(sandbox_id, "stopping sandbox");
        self.telemetry.lifecycle(sandbox_id, &LifecycleEvent::StopRequested);
        sandbox.vmm().stop();
        Ok(sandbox)
    }

    /// The running sandbox with this id.
    #[must_use]
    pub fn get(&self, sandbox_id: &str) -> Option<Arc<Sandbox>> {
        self.registry.get(sandbox_id)
    }

    /// Snapshot of every running sandbox.
    #[must_use]
    pub fn list(&self) -> Vec<SandboxInfo> {
        self.registry.snapshot().iter().map(|s| s.info()).collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.registry.len()
    }

    /// Refuse new creates, stop every sandbox and wait for all cleanup.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let running = self.registry.snapshot();
        tracing::info!(
            sandboxes = running.len(),
            "shutting down, stopping all sandboxes"
        );
        for sandbox in running {
            if self.registry.retire_if_same(sandbox.id(), &sandbox) {
                self.telemetry.lifecycle(sandbox.id(), &LifecycleEvent::StopRequested);
                sandbox.vmm().stop();
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("all sandboxes cleaned up");
    }
}

/// Wait for the VMM to exit (or outlive its limit), then release everything.
///
/// The registry keeps the id claimed until cleanup is done.
async fn supervise(
    registry: Arc<Registry<Sandbox>>,
    telemetry: Arc<dyn TelemetrySink>,
    sandbox: Arc<Sandbox>,
    unit: Duration,
) {
    let id = sandbox.id().to_owned();
    let lifetime = async {
        match instance_deadline(sandbox.config().max_instance_length_hours, unit) {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        status = sandbox.vmm().wait() => {
            tracing::info!(sandbox_id = %id, ?status, "vmm exited");
        }
        () = lifetime => {
            tracing::warn!(sandbox_id = %id, "maximum instance length exceeded, stopping");
            telemetry.lifecycle(&id, &LifecycleEvent::LifetimeExceeded);
            sandbox.vmm().stop();
            let status = sandbox.vmm().wait().await;
            tracing::info!(sandbox_id = %id, ?status, "vmm exited");
        }
    }
    telemetry.lifecycle(&id, &LifecycleEvent::Exited);

    sandbox.background().cancel();
    registry.retire_if_same(&id, &sandbox);
    let failed_steps = sandbox.run_cleanup().await;
    if failed_steps > 0 {
        tracing::error!(sandbox_id = %id, failed_steps, "sandbox cleanup incomplete");
    }
    registry.remove_if_same(&id, &sandbox);
    telemetry.lifecycle(&id, &LifecycleEvent::CleanedUp { failed_steps });
    sandbox.mark_cleaned();
}
