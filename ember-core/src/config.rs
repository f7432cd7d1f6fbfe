//! Node configuration, built once at startup and shared by every component.

use std::path::PathBuf;
use std::time::Duration;

/// Everything a node needs to know about its host and its peers.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity used as the KV key prefix and returned as `client_id`.
    pub node_id: String,

    /// Per-template artifacts (`<envs_root>/<template_id>/`), read-only.
    pub envs_root: PathBuf,

    /// Kernels (`<kernels_root>/<kernel_version>/vmlinux.bin`), read-only.
    pub kernels_root: PathBuf,

    /// Version-pinned `firecracker` and `uffd` binaries.
    pub firecracker_binaries_root: PathBuf,

    /// Root of the per-sandbox scratch directories.
    pub sandbox_root: PathBuf,

    /// Hosts-format file the DNS publisher owns.
    pub hosts_file: PathBuf,

    /// KV store endpoint; `None` runs with an in-process store.
    pub kv_endpoint: Option<String>,

    /// KV access token.
    pub kv_token: Option<String>,

    /// Placed into MMDS as `address`.
    pub logs_proxy_address: String,

    /// Port the in-guest agent serves `/sync` on.
    pub agent_port: u16,

    /// Upper bound on waiting for the Firecracker API socket.
    pub api_socket_timeout: Duration,

    /// Upper bound on waiting for the uffd helper's socket.
    pub uffd_socket_timeout: Duration,

    /// Time between SIGTERM and SIGKILL when stopping the uffd helper.
    pub uffd_stop_grace: Duration,

    /// Deadline for a whole create.
    pub create_timeout: Duration,

    /// Pause between clock resync attempts.
    pub clock_sync_interval: Duration,

    /// Length of one unit of `max_instance_length_hours`. One hour.
    pub instance_length_unit: Duration,
}

impl NodeConfig {
    /// Create a config with default paths and timeouts for `node_id`.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            envs_root: PathBuf::from("/fc-envs"),
            kernels_root: PathBuf::from("/fc-kernels"),
            firecracker_binaries_root: PathBuf::from("/fc-versions"),
            sandbox_root: PathBuf::from("/tmp/ember/sandboxes"),
            hosts_file: PathBuf::from("/etc/hosts.ember"),
            kv_endpoint: None,
            kv_token: None,
            logs_proxy_address: "http://127.0.0.1:30006".to_owned(),
            agent_port: 49_982,
            api_socket_timeout: Duration::from_secs(10),
            uffd_socket_timeout: Duration::from_secs(10),
            uffd_stop_grace: Duration::from_secs(1),
            create_timeout: Duration::from_secs(60),
            clock_sync_interval: Duration::from_secs(10),
            instance_length_unit: Duration::from_secs(3600),
        }
    }

    /// Template directory holding `rootfs.ext4`, `snapfile` and `memfile`.
    #[must_use]
    pub fn template_dir(&self, template_id: &str) -> PathBuf {
        self.envs_root.join(template_id)
    }

    /// Kernel directory holding `vmlinux.bin`.
    #[must_use]
    pub fn kernel_dir(&self, kernel_version: &str) -> PathBuf {
        self.kernels_root.join(kernel_version)
    }

    #[must_use]
    pub fn firecracker_binary(&self, firecracker_version: &str) -> PathBuf {
        self.firecracker_binaries_root
            .join(firecracker_version)
            .join("firecracker")
    }

    #[must_use]
    pub fn uffd_binary(&self, firecracker_version: &str) -> PathBuf {
        self.firecracker_binaries_root
            .join(firecracker_version)
            .join("uffd")
    }
}

/// Generate a node identity of the form `node-<8 hex chars>`.
#[must_use]
pub fn generate_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}
