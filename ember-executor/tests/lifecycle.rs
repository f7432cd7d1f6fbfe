//! Integration test: sandbox create/stop against fakes for everything that
//! needs root.
//!
//! The KV store is in-memory, host networking is a simulated host that
//! tracks namespaces, routes and rules, and the VMM is a `sleep` process
//! driven by a scripted backend. Files, the hosts file and the uffd helper
//! are real, under a temp dir.
//!
//! The real-Firecracker test needs root and KVM; run it with
//! `cargo test --test lifecycle -- --ignored`.

use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ember_core::{addressing, MmdsMetadata, NodeConfig, SandboxConfig};
use ember_executor::firecracker::wait_for_api_socket;
use ember_executor::{
    ErrorKind, LifecycleEvent, MemoryBackend, MemorySink, Sandbox, SandboxError,
    SandboxOrchestrator, SnapshotLoad, SpawnPlan, TelemetrySink, VmmBackend, VmmError, VmmHandle,
    VmmState,
};
use ember_net::{
    CommandFailure, DnsPublisher, HostNet, KvStore, MemoryKv, NetCommand, NetworkBuilder,
    SlotAllocator,
};
use tokio::process::Command;

const NODE_ID: &str = "node-0000beef";

// ---- host network ----------------------------------------------------------

/// Tracks the host-visible objects a sandbox network leaves behind.
#[derive(Default)]
struct RecordingHost {
    namespaces: Mutex<BTreeSet<String>>,
    routes: Mutex<BTreeSet<String>>,
    rules: Mutex<BTreeSet<String>>,
    fail_on: Mutex<Option<String>>,
    /// Commands matching this take effect but never report back.
    stall_on: Mutex<Option<String>>,
}

impl RecordingHost {
    fn matches(slot: &Mutex<Option<String>>, command: &NetCommand) -> bool {
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|pattern| command.to_string().contains(pattern))
    }

    fn namespaces(&self) -> BTreeSet<String> {
        self.namespaces.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn is_clean(&self) -> bool {
        self.namespaces.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
            && self.routes.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
            && self.rules.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

fn refuse(command: &NetCommand, stderr: &str) -> CommandFailure {
    CommandFailure {
        command: command.to_string(),
        stderr: stderr.to_owned(),
    }
}

#[async_trait]
impl HostNet for RecordingHost {
    async fn run(&self, command: &NetCommand) -> Result<(), CommandFailure> {
        if Self::matches(&self.fail_on, command) {
            return Err(refuse(command, "RTNETLINK answers: Operation not permitted"));
        }
        let result = self.apply(command);
        if Self::matches(&self.stall_on, command) {
            std::future::pending::<()>().await;
        }
        result
    }

    async fn write_sysctl(
        &self,
        _namespace: Option<&str>,
        _key: &str,
        _value: &str,
    ) -> Result<(), CommandFailure> {
        Ok(())
    }
}

impl RecordingHost {
    fn apply(&self, command: &NetCommand) -> Result<(), CommandFailure> {
        let words: Vec<&str> = command.args().iter().map(String::as_str).collect();
        match (command.program(), words.as_slice()) {
            ("ip", ["netns", "add", ns]) => {
                let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
                if namespaces.insert((*ns).to_owned()) {
                    Ok(())
                } else {
                    Err(refuse(command, "Cannot create namespace file: File exists"))
                }
            }
            ("ip", ["netns", "del", ns]) => {
                if self.namespaces.lock().unwrap_or_else(PoisonError::into_inner).remove(*ns) {
                    Ok(())
                } else {
                    Err(refuse(command, "Cannot remove namespace file: No such file or directory"))
                }
            }
            ("ip", ["route", "add", dest, ..]) => {
                let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
                routes.insert((*dest).to_owned());
                Ok(())
            }
            ("ip", ["route", "del", dest]) => {
                if self.routes.lock().unwrap_or_else(PoisonError::into_inner).remove(*dest) {
                    Ok(())
                } else {
                    Err(refuse(command, "RTNETLINK answers: No such process"))
                }
            }
            ("iptables", ["-t", table, action, rest @ ..]) => {
                let rule = format!("{table} {}", rest.join(" "));
                let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
                match *action {
                    "-A" => {
                        rules.insert(rule);
                        Ok(())
                    }
                    "-D" if rules.remove(&rule) => Ok(()),
                    _ => Err(refuse(
                        command,
                        "iptables: Bad rule (does a matching rule exist in that chain?).",
                    )),
                }
            }
            _ => Ok(()),
        }
    }
}

// ---- VMM backend -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Healthy,
    /// The process exits before its API socket appears.
    ExitsImmediately,
    /// The API socket never appears.
    NeverReady,
    LoadFails,
}

struct ScriptedBackend {
    mode: Mutex<Mode>,
    telemetry: Arc<dyn TelemetrySink>,
    spawned: AtomicUsize,
    loads: Mutex<Vec<SnapshotLoad>>,
    mmds: Mutex<Vec<MmdsMetadata>>,
}

impl ScriptedBackend {
    fn new(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            mode: Mutex::new(Mode::Healthy),
            telemetry,
            spawned: AtomicUsize::new(0),
            loads: Mutex::new(Vec::new()),
            mmds: Mutex::new(Vec::new()),
        }
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn mode(&self) -> Mode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loads(&self) -> Vec<SnapshotLoad> {
        self.loads.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn mmds(&self) -> Vec<MmdsMetadata> {
        self.mmds.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl VmmBackend for ScriptedBackend {
    async fn spawn(&self, sandbox_id: &str, plan: &SpawnPlan) -> Result<VmmHandle, VmmError> {
        let mut command = match self.mode() {
            Mode::ExitsImmediately => Command::new("true"),
            _ => {
                let mut sleep = Command::new("sleep");
                sleep.arg("3600");
                sleep
            }
        };
        let child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmmError::StartupFailed(e.to_string()))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(VmmHandle::from_child(sandbox_id, plan.socket_path.clone(), child, &self.telemetry))
    }

    async fn wait_api_ready(&self, handle: &VmmHandle, timeout: Duration) -> Result<(), VmmError> {
        match self.mode() {
            Mode::ExitsImmediately => wait_for_api_socket(handle, timeout).await,
            Mode::NeverReady => std::future::pending().await,
            Mode::Healthy | Mode::LoadFails => Ok(()),
        }
    }

    async fn load_snapshot(
        &self,
        _handle: &VmmHandle,
        request: &SnapshotLoad,
    ) -> Result<(), VmmError> {
        if self.mode() == Mode::LoadFails {
            return Err(VmmError::SnapshotLoadFailed(
                "HTTP 400 Bad Request from /snapshot/load".to_owned(),
            ));
        }
        self.loads.lock().unwrap_or_else(PoisonError::into_inner).push(request.clone());
        Ok(())
    }

    async fn set_mmds(&self, _handle: &VmmHandle, metadata: &MmdsMetadata) -> Result<(), VmmError> {
        self.mmds.lock().unwrap_or_else(PoisonError::into_inner).push(metadata.clone());
        Ok(())
    }
}

// ---- fixture ---------------------------------------------------------------

struct Fixture {
    dir: tempfile::TempDir,
    kv: Arc<MemoryKv>,
    host: Arc<RecordingHost>,
    dns: Arc<DnsPublisher>,
    backend: Arc<ScriptedBackend>,
    sink: Arc<MemorySink>,
    orchestrator: Arc<SandboxOrchestrator>,
}

fn touch(path: &Path, contents: &str, executable: bool) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("mkdir {}: {e}", parent.display()));
    }
    std::fs::write(path, contents).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
    if executable {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .unwrap_or_else(|e| panic!("chmod {}: {e}", path.display()));
    }
}

async fn fixture_with(tune: impl FnOnce(&mut NodeConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let root = dir.path();

    let mut node = NodeConfig::new(NODE_ID);
    node.envs_root = root.join("envs");
    node.kernels_root = root.join("kernels");
    node.firecracker_binaries_root = root.join("versions");
    node.sandbox_root = root.join("sandboxes");
    node.hosts_file = root.join("hosts");
    node.create_timeout = Duration::from_secs(10);
    node.api_socket_timeout = Duration::from_secs(5);
    node.uffd_socket_timeout = Duration::from_secs(5);
    node.uffd_stop_grace = Duration::from_millis(200);
    tune(&mut node);

    for file in ["rootfs.ext4", "snapfile", "memfile"] {
        touch(&node.template_dir("base").join(file), "", false);
    }
    touch(&node.kernel_dir("vmlinux-6.1").join("vmlinux.bin"), "", false);
    touch(&node.firecracker_binary("v1.7.0"), "#!/bin/sh\n", true);
    // Page server stand-in: create the socket path, then serve forever.
    touch(&node.uffd_binary("v1.7.0"), "#!/bin/sh\ntouch \"$1\"\nexec sleep 3600\n", true);

    let kv = Arc::new(MemoryKv::new());
    let host = Arc::new(RecordingHost::default());
    let dns = Arc::new(
        DnsPublisher::open(&node.hosts_file)
            .await
            .unwrap_or_else(|e| panic!("open hosts file: {e}")),
    );
    let sink = Arc::new(MemorySink::new());
    let telemetry: Arc<dyn TelemetrySink> = Arc::clone(&sink) as Arc<dyn TelemetrySink>;
    let backend = Arc::new(ScriptedBackend::new(Arc::clone(&telemetry)));

    let orchestrator = Arc::new(SandboxOrchestrator::new(
        Arc::new(node),
        SlotAllocator::new(Arc::clone(&kv) as Arc<dyn KvStore>, NODE_ID),
        NetworkBuilder::new(Arc::clone(&host) as Arc<dyn HostNet>, Arc::clone(&dns)),
        Arc::clone(&backend) as Arc<dyn VmmBackend>,
        telemetry,
    ));
    Fixture {
        dir,
        kv,
        host,
        dns,
        backend,
        sink,
        orchestrator,
    }
}

async fn fixture() -> Fixture {
    fixture_with(|_| {}).await
}

fn request(sandbox_id: &str) -> SandboxConfig {
    SandboxConfig {
        sandbox_id: sandbox_id.to_owned(),
        template_id: "base".to_owned(),
        build_id: "b-1".to_owned(),
        kernel_version: "vmlinux-6.1".to_owned(),
        firecracker_version: "v1.7.0".to_owned(),
        team_id: "team-a".to_owned(),
        huge_pages: false,
        max_instance_length_hours: 0,
    }
}

impl Fixture {
    async fn create(&self, sandbox_id: &str) -> Arc<Sandbox> {
        self.orchestrator
            .create(request(sandbox_id))
            .await
            .unwrap_or_else(|e| panic!("create {sandbox_id}: {e}"))
    }

    /// Nothing a sandbox could have left behind is present.
    async fn assert_clean(&self, sandbox_id: &str) {
        assert!(self.kv.is_empty(), "slot keys left: {:?}", self.kv.keys());
        assert!(self.host.is_clean(), "network left: {:?}", self.host.namespaces());
        assert_eq!(self.dns.lookup(sandbox_id).await, None, "hosts entry left for {sandbox_id}");
        assert!(
            !self.dir.path().join("sandboxes").join(sandbox_id).exists(),
            "sandbox directory left for {sandbox_id}"
        );
        assert!(self.orchestrator.get(sandbox_id).is_none());
    }
}

async fn stop_and_wait(fx: &Fixture, sandbox_id: &str) {
    let sandbox = fx
        .orchestrator
        .stop(sandbox_id)
        .unwrap_or_else(|e| panic!("stop {sandbox_id}: {e}"));
    if tokio::time::timeout(Duration::from_secs(10), sandbox.cleaned()).await.is_err() {
        panic!("{sandbox_id} was not cleaned up within 10s");
    }
}

// ---- create ----------------------------------------------------------------

#[tokio::test]
async fn create_provisions_every_resource() {
    let fx = fixture().await;

    let sandbox = fx.create("s-1").await;
    let index = sandbox.slot().index();

    assert_eq!(fx.kv.keys(), vec![ember_core::slot::slot_key(NODE_ID, index)]);
    assert_eq!(fx.host.namespaces(), BTreeSet::from([addressing::namespace_name(index)]));
    assert_eq!(fx.dns.lookup("s-1").await, Some(addressing::host_vm_ip(index)));
    assert!(sandbox.files().build_dir.is_dir());
    assert!(sandbox.files().kernel_mount_dir.is_dir());
    assert_eq!(sandbox.vmm().state(), VmmState::Loaded);
    assert!(!sandbox.uses_uffd());

    let loads = fx.backend.loads();
    assert_eq!(loads.len(), 1);
    assert!(loads[0].resume_vm);
    assert_eq!(loads[0].snapshot_path, fx.dir.path().join("envs/base/snapfile"));
    assert_eq!(
        loads[0].mem_backend,
        MemoryBackend::File { backend_path: fx.dir.path().join("envs/base/memfile") }
    );
    let mmds = fx.backend.mmds();
    assert_eq!(mmds.len(), 1);
    assert_eq!(mmds[0].instance_id, "s-1");
    assert_eq!(mmds[0].env_id, "base");
    assert_eq!(mmds[0].team_id, "team-a");

    let listed = fx.orchestrator.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].config, request("s-1"));
    assert_eq!(listed[0].client_id, NODE_ID);
    assert_eq!(fx.orchestrator.count(), 1);
    assert_eq!(fx.sink.events("s-1"), vec![LifecycleEvent::Created]);

    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn huge_pages_serve_memory_through_the_uffd_helper() {
    let fx = fixture().await;
    let mut config = request("s-huge");
    config.huge_pages = true;

    let sandbox = fx.orchestrator.create(config).await.unwrap_or_else(|e| panic!("create: {e}"));
    assert!(sandbox.uses_uffd());
    let socket = fx.dir.path().join("sandboxes/s-huge/uffd.sock");
    assert_eq!(fx.backend.loads()[0].mem_backend, MemoryBackend::Uffd { backend_path: socket });

    stop_and_wait(&fx, "s-huge").await;
    fx.assert_clean("s-huge").await;
}

#[tokio::test]
async fn invalid_request_touches_nothing() {
    let fx = fixture().await;
    let mut config = request("s-1");
    config.template_id = "../etc".to_owned();

    let err = fx.orchestrator.create(config).await.err();
    assert!(matches!(err, Some(SandboxError::InvalidRequest(_))), "got {err:?}");
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::InvalidArgument));
    assert_eq!(fx.backend.spawned.load(Ordering::SeqCst), 0);
    fx.assert_clean("s-1").await;
}

#[tokio::test]
async fn missing_template_is_rejected_before_any_reservation() {
    let fx = fixture().await;
    let mut config = request("s-1");
    config.template_id = "absent".to_owned();

    let err = fx.orchestrator.create(config).await.err();
    assert!(matches!(err, Some(SandboxError::TemplateNotFound { .. })), "got {err:?}");
    fx.assert_clean("s-1").await;

    // The id was released again.
    fx.create("s-1").await;
    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_a_second_slot() {
    let fx = fixture().await;
    fx.create("s-1").await;

    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(matches!(err, Some(SandboxError::AlreadyExists { .. })), "got {err:?}");
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::InvalidArgument));
    assert_eq!(fx.kv.len(), 1);
    assert_eq!(fx.orchestrator.count(), 1);

    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn concurrent_creates_with_one_id_admit_exactly_one() {
    let fx = fixture().await;
    let (a, b) = tokio::join!(
        fx.orchestrator.create(request("s-1")),
        fx.orchestrator.create(request("s-1"))
    );
    assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1, "got {a:?} and {b:?}");
    assert_eq!(fx.kv.len(), 1);
    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn hundred_concurrent_creates_get_distinct_slots() {
    let fx = fixture().await;
    let mut creates = tokio::task::JoinSet::new();
    for i in 0..100 {
        let orchestrator = Arc::clone(&fx.orchestrator);
        creates.spawn(async move { orchestrator.create(request(&format!("s-{i}"))).await });
    }

    let mut indices = BTreeSet::new();
    while let Some(joined) = creates.join_next().await {
        let sandbox = match joined {
            Ok(Ok(sandbox)) => sandbox,
            Ok(Err(e)) => panic!("create: {e}"),
            Err(e) => panic!("create task: {e}"),
        };
        let index = sandbox.slot().index();
        assert!(indices.insert(index), "slot {index} handed out twice");
    }
    assert_eq!(fx.kv.len(), 100);
    assert_eq!(fx.host.namespaces().len(), 100);
    assert_eq!(fx.orchestrator.count(), 100);

    fx.orchestrator.shutdown().await;
    assert!(fx.kv.is_empty(), "slot keys left: {:?}", fx.kv.keys());
    assert!(fx.host.is_clean());
    assert_eq!(fx.orchestrator.count(), 0);
}

// ---- failure paths ---------------------------------------------------------

#[tokio::test]
async fn saturated_node_fails_fast_with_slot_exhausted() {
    let fx = fixture().await;
    for index in 0..=u16::MAX {
        let key = ember_core::slot::slot_key(NODE_ID, index);
        assert!(fx.kv.put_if_absent(&key, &[]).await.unwrap_or(false));
    }

    let create = fx.orchestrator.create(request("s-1"));
    let result = tokio::time::timeout(Duration::from_secs(2), create).await;
    match result {
        Ok(Err(e)) => {
            assert!(e.is_slot_exhausted(), "got {e}");
            assert_eq!(e.kind(), ErrorKind::Internal);
        }
        other => panic!("expected SlotExhausted within 2s, got {other:?}"),
    }
    assert_eq!(fx.kv.len(), 1 << 16);
    assert!(fx.host.is_clean());
    assert_eq!(fx.backend.spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn kv_outage_fails_the_create() {
    let fx = fixture().await;
    fx.kv.set_available(false);

    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(err.as_ref().is_some_and(SandboxError::is_kv_unavailable), "got {err:?}");
    fx.kv.set_available(true);
    fx.assert_clean("s-1").await;
}

#[tokio::test]
async fn network_failure_releases_the_slot() {
    let fx = fixture().await;
    *fx.host.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = Some("MASQUERADE".to_owned());

    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(matches!(err, Some(SandboxError::Network(_))), "got {err:?}");
    fx.assert_clean("s-1").await;
    assert!(matches!(fx.sink.events("s-1").as_slice(), [LifecycleEvent::CreateFailed { .. }]));
}

#[tokio::test]
async fn vmm_exiting_before_its_socket_unwinds_everything() {
    let fx = fixture().await;
    fx.backend.set_mode(Mode::ExitsImmediately);

    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(matches!(err, Some(SandboxError::Vmm(VmmError::StartupFailed(_)))), "got {err:?}");
    fx.assert_clean("s-1").await;

    fx.backend.set_mode(Mode::Healthy);
    fx.create("s-1").await;
    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn failed_snapshot_load_unwinds_everything() {
    let fx = fixture().await;
    fx.backend.set_mode(Mode::LoadFails);

    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(matches!(err, Some(SandboxError::Vmm(VmmError::SnapshotLoadFailed(_)))), "got {err:?}");
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Internal));
    fx.assert_clean("s-1").await;
}

#[tokio::test]
async fn create_past_its_deadline_times_out_and_unwinds() {
    let fx = fixture_with(|node| node.create_timeout = Duration::from_millis(300)).await;
    fx.backend.set_mode(Mode::NeverReady);

    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(matches!(err, Some(SandboxError::Timeout { .. })), "got {err:?}");
    assert_eq!(fx.backend.spawned.load(Ordering::SeqCst), 1);
    fx.assert_clean("s-1").await;
}

// ---- stop and exit ---------------------------------------------------------

#[tokio::test]
async fn stop_releases_every_resource() {
    let fx = fixture().await;
    fx.create("s-1").await;

    stop_and_wait(&fx, "s-1").await;
    fx.assert_clean("s-1").await;
    assert_eq!(fx.orchestrator.count(), 0);
    assert_eq!(
        fx.sink.events("s-1"),
        vec![
            LifecycleEvent::Created,
            LifecycleEvent::StopRequested,
            LifecycleEvent::Exited,
            LifecycleEvent::CleanedUp { failed_steps: 0 },
        ]
    );
}

#[tokio::test]
async fn stopping_an_unknown_or_stopped_sandbox_is_not_found() {
    let fx = fixture().await;
    let err = fx.orchestrator.stop("nope").err();
    assert!(matches!(err, Some(SandboxError::NotFound { .. })), "got {err:?}");
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::NotFound));

    fx.create("s-1").await;
    assert!(fx.orchestrator.stop("s-1").is_ok());
    assert!(matches!(fx.orchestrator.stop("s-1"), Err(SandboxError::NotFound { .. })));
    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn guest_exit_is_cleaned_up_without_a_stop() {
    let fx = fixture().await;
    let sandbox = fx.create("s-1").await;
    let pid = sandbox.vmm().pid().unwrap_or_else(|| panic!("vmm has no pid"));

    let killed = Command::new("kill").arg("-9").arg(pid.to_string()).status().await;
    assert!(killed.is_ok_and(|s| s.success()));

    if tokio::time::timeout(Duration::from_secs(10), sandbox.cleaned()).await.is_err() {
        panic!("exited sandbox was not cleaned up");
    }
    fx.assert_clean("s-1").await;
    assert!(!fx.sink.events("s-1").contains(&LifecycleEvent::StopRequested));
}

#[tokio::test]
async fn recreating_after_stop_reuses_the_id() {
    let fx = fixture().await;
    fx.create("s-1").await;
    stop_and_wait(&fx, "s-1").await;

    let again = fx.create("s-1").await;
    assert_eq!(fx.orchestrator.count(), 1);
    assert_eq!(fx.dns.lookup("s-1").await, Some(again.vm_ip()));
    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn stopped_id_stays_taken_until_its_cleanup_finishes() {
    let fx = fixture().await;
    fx.create("s-1").await;

    let old = fx.orchestrator.stop("s-1").unwrap_or_else(|e| panic!("stop: {e}"));
    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(
        matches!(err, Some(SandboxError::AlreadyExists { .. })),
        "id reused while the old sandbox was still being torn down: {err:?}"
    );
    assert!(fx.orchestrator.get("s-1").is_none());
    assert_eq!(fx.orchestrator.count(), 0);

    if tokio::time::timeout(Duration::from_secs(10), old.cleaned()).await.is_err() {
        panic!("s-1 was not cleaned up within 10s");
    }
    let again = fx.create("s-1").await;
    assert_eq!(fx.dns.lookup("s-1").await, Some(again.vm_ip()));
    assert!(again.files().build_dir.is_dir());
    assert_eq!(fx.kv.len(), 1);
    fx.orchestrator.shutdown().await;
}

#[tokio::test]
async fn sandbox_past_its_maximum_length_is_stopped_and_cleaned() {
    let fx = fixture_with(|node| node.instance_length_unit = Duration::from_millis(200)).await;
    let mut config = request("s-1");
    config.max_instance_length_hours = 1;

    let sandbox = fx
        .orchestrator
        .create(config)
        .await
        .unwrap_or_else(|e| panic!("create: {e}"));
    if tokio::time::timeout(Duration::from_secs(10), sandbox.cleaned()).await.is_err() {
        panic!("expired sandbox was not cleaned up");
    }
    fx.assert_clean("s-1").await;
    assert_eq!(
        fx.sink.events("s-1"),
        vec![
            LifecycleEvent::Created,
            LifecycleEvent::LifetimeExceeded,
            LifecycleEvent::Exited,
            LifecycleEvent::CleanedUp { failed_steps: 0 },
        ]
    );
}

#[tokio::test]
async fn network_step_cut_off_by_the_deadline_is_swept() {
    let fx = fixture_with(|node| node.create_timeout = Duration::from_millis(300)).await;
    *fx.host.stall_on.lock().unwrap_or_else(PoisonError::into_inner) = Some("netns add".to_owned());

    let err = fx.orchestrator.create(request("s-1")).await.err();
    assert!(matches!(err, Some(SandboxError::Timeout { .. })), "got {err:?}");
    assert_eq!(fx.backend.spawned.load(Ordering::SeqCst), 0);
    fx.assert_clean("s-1").await;
}

#[tokio::test]
async fn shutdown_cleans_everything_and_refuses_new_work() {
    let fx = fixture().await;
    for id in ["s-1", "s-2", "s-3"] {
        fx.create(id).await;
    }

    tokio::time::timeout(Duration::from_secs(10), fx.orchestrator.shutdown())
        .await
        .unwrap_or_else(|_| panic!("shutdown did not finish within 10s"));
    for id in ["s-1", "s-2", "s-3"] {
        fx.assert_clean(id).await;
    }

    let err = fx.orchestrator.create(request("s-4")).await.err();
    assert!(matches!(err, Some(SandboxError::ShuttingDown)), "got {err:?}");
}

#[tokio::test]
#[ignore = "requires root, KVM and Firecracker artifacts under /fc-*"]
async fn real_firecracker_round_trip() {
    use ember_executor::{FirecrackerBackend, TracingSink};
    use ember_net::SystemHost;

    let node = Arc::new(NodeConfig::new(NODE_ID));
    let kv = Arc::new(MemoryKv::new());
    let dns = Arc::new(
        DnsPublisher::open(&node.hosts_file)
            .await
            .unwrap_or_else(|e| panic!("open hosts file: {e}")),
    );
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingSink);
    let orchestrator = SandboxOrchestrator::new(
        Arc::clone(&node),
        SlotAllocator::new(Arc::clone(&kv) as Arc<dyn KvStore>, NODE_ID),
        NetworkBuilder::new(Arc::new(SystemHost), dns),
        Arc::new(FirecrackerBackend::new(Arc::clone(&telemetry))),
        telemetry,
    );

    let template = std::env::var("EMBER_TEST_TEMPLATE").unwrap_or_else(|_| "base".to_owned());
    let mut config = request("real-1");
    config.template_id = template;
    let sandbox = orchestrator.create(config).await.unwrap_or_else(|e| panic!("create: {e}"));
    assert_eq!(sandbox.vmm().state(), VmmState::Loaded);

    let stopped = orchestrator.stop("real-1").unwrap_or_else(|e| panic!("stop: {e}"));
    stopped.cleaned().await;
    assert!(kv.is_empty());
}
