//! Network identity for ember sandboxes.
//!
//! Reserves cluster-unique slot indices through a compare-and-set KV store,
//! builds and tears down the per-sandbox namespace, veth pair, tap device and
//! NAT rules derived from a slot, and publishes sandbox names to a hosts file.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod allocator;
pub mod consul;
pub mod dns;
pub mod error;
pub mod host;
pub mod kv;
pub mod netns;
pub mod network;

pub use allocator::SlotAllocator;
pub use consul::ConsulKv;
pub use dns::DnsPublisher;
pub use error::{AllocError, DnsError, KvError, NetworkError};
pub use host::{CommandFailure, HostNet, NetCommand, SystemHost};
pub use kv::{KvEntry, KvStore, MemoryKv};
pub use network::NetworkBuilder;
