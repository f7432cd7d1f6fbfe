//! Strongly-consistent KV store abstraction with compare-and-set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::KvError;

/// A stored value and the index of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub mod_index: u64,
}

/// KV store with the CAS primitives the slot allocator needs.
///
/// Every method fails only with [`KvError::Unavailable`]; a lost CAS race
/// is reported as `Ok(false)`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key` only if the key does not exist.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, KvError>;

    /// Read a key and its modify index.
    async fn read(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// Delete `key` only if its modify index still equals `mod_index`.
    async fn delete_if_unchanged(&self, key: &str, mod_index: u64) -> Result<bool, KvError>;

    /// List all keys starting with `prefix`.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, KvEntry>,
    last_index: u64,
}

/// In-process KV store with the same CAS semantics as the cluster store.
///
/// Backs single-node development mode and tests.
#[derive(Debug)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a transport outage: every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .keys()
            .cloned()
            .collect()
    }

    fn check(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("memory store marked unavailable".to_owned()))
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, KvError> {
        self.check()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.last_index += 1;
        let mod_index = state.last_index;
        let entry = KvEntry {
            value: value.to_vec(),
            mod_index,
        };
        state.entries.insert(key.to_owned(), entry);
        Ok(true)
    }

    async fn read(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        self.check()?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.entries.get(key).cloned())
    }

    async fn delete_if_unchanged(&self, key: &str, mod_index: u64) -> Result<bool, KvError> {
        self.check()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.entries.get(key) {
            Some(entry) if entry.mod_index == mod_index => {
                state.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.check()?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
