//! Cluster-unique slot allocation through KV compare-and-set.
//!
//! Reservation first tries random indices, which succeeds without
//! contention in the common case. When that phase runs out of attempts the
//! allocator lists the node's keys and walks every index in order, which
//! guarantees progress under saturation.

use std::collections::HashSet;
use std::sync::Arc;

use ember_core::slot::{parse_slot_key, slot_prefix};
use ember_core::Slot;

use crate::kv::KvStore;
use crate::{AllocError, KvError};

/// Random picks before falling back to the ordered scan.
pub const RANDOM_ATTEMPTS: usize = 10;

/// Reserves and releases slots for one node.
#[derive(Clone)]
pub struct SlotAllocator {
    kv: Arc<dyn KvStore>,
    node_id: String,
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAllocator").field("node_id", &self.node_id).finish_non_exhaustive()
    }
}

impl SlotAllocator {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, node_id: impl Into<String>) -> Self {
        Self {
            kv,
            node_id: node_id.into(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Reserve a slot unique to this node across the cluster.
    ///
    /// Safe to call concurrently; the KV CAS is the only synchronization.
    ///
    /// # Errors
    /// Returns [`AllocError::Kv`] if the store is unreachable and
    /// [`AllocError::SlotExhausted`] if every index is taken.
    pub async fn reserve(&self) -> Result<Slot, AllocError> {
        for attempt in 0..RANDOM_ATTEMPTS {
            let index: u16 = rand::random();
            if let Some(slot) = self.try_claim(index).await? {
                tracing::debug!(
                    node_id = %self.node_id,
                    index,
                    attempt,
                    "slot reserved by random pick"
                );
                return Ok(slot);
            }
        }

        tracing::info!(node_id = %self.node_id, "random probing exhausted, scanning slots");
        let reserved: HashSet<u16> = self
            .kv
            .list_prefix(&slot_prefix(&self.node_id))
            .await?
            .iter()
            .filter_map(|key| parse_slot_key(&self.node_id, key))
            .collect();

        for index in 0..=u16::MAX {
            if reserved.contains(&index) {
                continue;
            }
            if let Some(slot) = self.try_claim(index).await? {
                tracing::debug!(node_id = %self.node_id, index, "slot reserved by scan");
                return Ok(slot);
            }
        }

        tracing::warn!(node_id = %self.node_id, "all slots reserved");
        Err(AllocError::SlotExhausted { node_id: self.node_id.clone() })
    }

    async fn try_claim(&self, index: u16) -> Result<Option<Slot>, KvError> {
        let slot = Slot::new(self.node_id.clone(), index);
        if self.kv.put_if_absent(slot.kv_key(), &[]).await? {
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }

    /// Release a reserved slot. Idempotent.
    ///
    /// A key that is already gone counts as released. A key whose modify
    /// index changed between read and delete is no longer ours and is left
    /// alone.
    ///
    /// # Errors
    /// Returns [`AllocError::Kv`] if the store is unreachable.
    pub async fn release(&self, slot: &Slot) -> Result<(), AllocError> {
        let Some(entry) = self.kv.read(slot.kv_key()).await? else {
            return Ok(());
        };
        if !self.kv.delete_if_unchanged(slot.kv_key(), entry.mod_index).await? {
            tracing::warn!(key = %slot.kv_key(), "slot key changed before release, leaving it");
        }
        Ok(())
    }
}
