//! Core types for the ember microVM orchestrator.
//!
//! Defines the node configuration, the sandbox request, the network slot
//! and its deterministic addressing, and the cleanup stack every
//! multi-step construction unwinds on failure.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod addressing;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod slot;

pub use cleanup::{CleanupFailure, CleanupStack, UndoError};
pub use config::{generate_node_id, NodeConfig};
pub use error::CoreError;
pub use sandbox::{MmdsMetadata, SandboxConfig};
pub use slot::Slot;
