//! Error types for the network crate.

use crate::host::CommandFailure;

/// KV transport failure. The only error the KV wrapper surfaces.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KvError {
    /// The store could not be reached or answered with a server error.
    #[error("KV store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from slot reservation and release.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AllocError {
    /// The KV store is unreachable.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Every index on this node is reserved.
    #[error("no free slot on node {node_id}")]
    SlotExhausted { node_id: String },
}

/// Errors from the hosts-file publisher.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DnsError {
    /// Writing or renaming the hosts file failed.
    #[error("writing hosts file {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from building or tearing down a sandbox network.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NetworkError {
    #[error("creating namespace {namespace}: {source}")]
    NamespaceCreate {
        namespace: String,
        #[source]
        source: CommandFailure,
    },

    #[error("creating link for {namespace}: {source}")]
    LinkCreate {
        namespace: String,
        #[source]
        source: CommandFailure,
    },

    #[error("assigning address for {namespace}: {source}")]
    AddrAssign {
        namespace: String,
        #[source]
        source: CommandFailure,
    },

    #[error("installing route for {namespace}: {source}")]
    RouteInstall {
        namespace: String,
        #[source]
        source: CommandFailure,
    },

    #[error("installing NAT for {namespace}: {source}")]
    NatInstall {
        namespace: String,
        #[source]
        source: CommandFailure,
    },

    #[error("publishing DNS entry for {sandbox_id}: {source}")]
    DnsPublish {
        sandbox_id: String,
        #[source]
        source: DnsError,
    },

    /// One or more teardown steps failed; the rest still ran.
    #[error("teardown of {namespace} incomplete: {}", .failures.join("; "))]
    Teardown {
        namespace: String,
        failures: Vec<String>,
    },
}
