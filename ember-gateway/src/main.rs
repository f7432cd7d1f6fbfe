//! Entry point for the `ember-gateway` node agent.

use std::sync::Arc;

use clap::Parser;
use ember_executor::{FirecrackerBackend, SandboxOrchestrator, TelemetrySink, TracingSink};
use ember_gateway::{config::Cli, routes::create_router};
use ember_net::{
    ConsulKv, DnsPublisher, KvStore, MemoryKv, NetworkBuilder, SlotAllocator, SystemHost,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let addr = cli.listen_addr;
    let node = Arc::new(cli.into_node_config());

    let kv: Arc<dyn KvStore> = match &node.kv_endpoint {
        Some(endpoint) => Arc::new(ConsulKv::new(endpoint.clone(), node.kv_token.clone())),
        None => {
            tracing::warn!(
                "no KV endpoint configured, slots are reserved in-process (single-node mode)"
            );
            Arc::new(MemoryKv::new())
        }
    };
    let dns = match DnsPublisher::open(&node.hosts_file).await {
        Ok(d) => Arc::new(d),
        Err(e) => {
            tracing::error!(
                path = %node.hosts_file.display(),
                error = %e,
                "failed to open hosts file"
            );
            std::process::exit(1);
        }
    };

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingSink);
    let orchestrator = Arc::new(SandboxOrchestrator::new(
        Arc::clone(&node),
        SlotAllocator::new(kv, node.node_id.clone()),
        NetworkBuilder::new(Arc::new(SystemHost), dns),
        Arc::new(FirecrackerBackend::new(Arc::clone(&telemetry))),
        telemetry,
    ));
    let app = create_router(Arc::clone(&orchestrator));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, node_id = %node.node_id, "ember-gateway listening");

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    orchestrator.shutdown().await;
    if let Err(e) = served {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot listen for SIGTERM, relying on SIGINT");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for SIGINT");
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
}
