//! Network slot reserved for one sandbox.

use std::fmt;

use serde::Serialize;

/// Number of slot indices available per node.
pub const SLOT_COUNT: usize = 1 << 16;

/// A node-scoped slot index, unique across the cluster while reserved.
///
/// Immutable after allocation. The KV key `<node_id>/<index>` is what the
/// allocator compare-and-sets to claim it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Slot {
    index: u16,
    node_id: String,
    kv_key: String,
}

impl Slot {
    /// Create a slot for `index` on `node_id`.
    #[must_use]
    pub fn new(node_id: impl Into<String>, index: u16) -> Self {
        let node_id = node_id.into();
        let kv_key = slot_key(&node_id, index);
        Self {
            index,
            node_id,
            kv_key,
        }
    }

    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// KV key holding the reservation.
    #[must_use]
    pub fn kv_key(&self) -> &str {
        &self.kv_key
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kv_key)
    }
}

/// Prefix under which all of a node's slot keys live (`<node_id>/`).
#[must_use]
pub fn slot_prefix(node_id: &str) -> String {
    format!("{node_id}/")
}

/// KV key for `index` on `node_id`.
#[must_use]
pub fn slot_key(node_id: &str, index: u16) -> String {
    format!("{node_id}/{index}")
}

/// Parse the index back out of a key returned by a prefix listing.
///
/// Returns `None` for keys that do not belong to `node_id` or whose suffix is
/// not a valid index.
#[must_use]
pub fn parse_slot_key(node_id: &str, key: &str) -> Option<u16> {
    key.strip_prefix(node_id)?.strip_prefix('/')?.parse().ok()
}
