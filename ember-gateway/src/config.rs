//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ember_core::{generate_node_id, NodeConfig};

/// Per-node Firecracker sandbox orchestrator.
#[derive(Debug, Clone, Parser)]
#[command(name = "ember-gateway", version, about)]
pub struct Cli {
    /// Address the HTTP API listens on.
    #[arg(long, env = "EMBER_LISTEN_ADDR", default_value = "127.0.0.1:5008")]
    pub listen_addr: SocketAddr,

    /// Node identity; generated as `node-<8 hex>` when unset.
    #[arg(long, env = "EMBER_NODE_ID")]
    pub node_id: Option<String>,

    /// Per-template artifacts (read-only).
    #[arg(long, env = "EMBER_ENVS_ROOT", default_value = "/fc-envs")]
    pub envs_root: PathBuf,

    /// Kernels (read-only).
    #[arg(long, env = "EMBER_KERNELS_ROOT", default_value = "/fc-kernels")]
    pub kernels_root: PathBuf,

    /// Version-pinned firecracker and uffd binaries.
    #[arg(long, env = "EMBER_FIRECRACKER_BINARIES_ROOT", default_value = "/fc-versions")]
    pub firecracker_binaries_root: PathBuf,

    /// Root of the per-sandbox scratch directories.
    #[arg(long, env = "EMBER_SANDBOX_ROOT", default_value = "/tmp/ember/sandboxes")]
    pub sandbox_root: PathBuf,

    /// Hosts-format file sandbox names are published to.
    #[arg(long, env = "EMBER_HOSTS_FILE", default_value = "/etc/hosts.ember")]
    pub hosts_file: PathBuf,

    /// Consul-compatible KV endpoint; an in-process store is used when unset.
    #[arg(long, env = "EMBER_KV_ENDPOINT")]
    pub kv_endpoint: Option<String>,

    #[arg(long, env = "EMBER_KV_TOKEN", hide_env_values = true)]
    pub kv_token: Option<String>,

    /// Log forwarding address handed to guests through MMDS.
    #[arg(long, env = "EMBER_LOGS_PROXY_ADDRESS", default_value = "http://127.0.0.1:30006")]
    pub logs_proxy_address: String,

    /// Port of the in-guest agent.
    #[arg(long, env = "EMBER_AGENT_PORT", default_value_t = 49_982)]
    pub agent_port: u16,

    #[arg(long, env = "EMBER_API_SOCKET_TIMEOUT_SECS", default_value_t = 10)]
    pub api_socket_timeout_secs: u64,

    #[arg(long, env = "EMBER_UFFD_SOCKET_TIMEOUT_SECS", default_value_t = 10)]
    pub uffd_socket_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL for the uffd helper.
    #[arg(long, env = "EMBER_UFFD_STOP_GRACE_MS", default_value_t = 1000)]
    pub uffd_stop_grace_ms: u64,

    /// Deadline for a whole create request.
    #[arg(long, env = "EMBER_CREATE_TIMEOUT_SECS", default_value_t = 60)]
    pub create_timeout_secs: u64,

    #[arg(long, env = "EMBER_CLOCK_SYNC_INTERVAL_SECS", default_value_t = 10)]
    pub clock_sync_interval_secs: u64,
}

impl Cli {
    /// Resolve into the node configuration shared by every component.
    #[must_use]
    pub fn into_node_config(self) -> NodeConfig {
        let defaults = NodeConfig::new(String::new());
        NodeConfig {
            node_id: self.node_id.unwrap_or_else(generate_node_id),
            envs_root: self.envs_root,
            kernels_root: self.kernels_root,
            firecracker_binaries_root: self.firecracker_binaries_root,
            sandbox_root: self.sandbox_root,
            hosts_file: self.hosts_file,
            kv_endpoint: self.kv_endpoint,
            kv_token: self.kv_token,
            logs_proxy_address: self.logs_proxy_address,
            agent_port: self.agent_port,
            api_socket_timeout: Duration::from_secs(self.api_socket_timeout_secs),
            uffd_socket_timeout: Duration::from_secs(self.uffd_socket_timeout_secs),
            uffd_stop_grace: Duration::from_millis(self.uffd_stop_grace_ms),
            create_timeout: Duration::from_secs(self.create_timeout_secs),
            clock_sync_interval: Duration::from_secs(self.clock_sync_interval_secs),
            instance_length_unit: defaults.instance_length_unit,
        }
    }
}
