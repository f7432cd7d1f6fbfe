//! Sandbox execution for the ember node agent.
//!
//! Supervises Firecracker processes and composes the per-sandbox pieces
//! (slot, network, files, uffd helper, VMM) into a create/stop lifecycle
//! where every partially built sandbox is torn down again.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod clock;
pub mod error;
pub mod files;
pub mod firecracker;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod telemetry;
pub mod uffd;
mod unix_client;

pub use backend::VmmBackend;
pub use clock::{ClockSync, SyncOutcome};
pub use error::{ErrorKind, SandboxError, UffdError, VmmError};
pub use files::FileLayout;
pub use firecracker::{
    FirecrackerBackend, MemoryBackend, SnapshotLoad, SpawnPlan, VmmHandle, VmmState,
};
pub use orchestrator::{instance_deadline, SandboxOrchestrator};
pub use registry::Registry;
pub use sandbox::{Sandbox, SandboxInfo};
pub use telemetry::{LifecycleEvent, LogStream, MemorySink, TelemetrySink, TracingSink};
pub use uffd::UffdHelper;
