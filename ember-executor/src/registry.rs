//! In-memory sandbox registry.
//!
//! Maps sandbox ids to live sandboxes. An id is claimed as `Starting` before
//! any resource is reserved, so concurrent creates with the same id are
//! rejected. A stopped sandbox stays as `Stopping` until its cleanup is done,
//! so a new create cannot reuse the id while old resources are torn down.
//! Only `Running` entries are visible to lookups and listings.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug)]
enum Entry<T> {
    Starting,
    Running(Arc<T>),
    Stopping(Arc<T>),
}

/// Thread-safe registry of sandboxes by id.
#[derive(Debug)]
pub struct Registry<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a create in progress. Returns `false` if it is taken,
    /// including by a sandbox that is still being cleaned up.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn reserve(&self, id: &str) -> bool {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut entries = self.entries.write().expect("registry write lock poisoned");
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.to_owned(), Entry::Starting);
        true
    }

    /// Publish the running sandbox for a reserved `id`.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn activate(&self, id: &str, value: Arc<T>) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.entries
            .write()
            .expect("registry write lock poisoned")
            .insert(id.to_owned(), Entry::Running(value));
    }

    /// Release a reservation whose create failed. Other entries are kept.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn abandon(&self, id: &str) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut entries = self.entries.write().expect("registry write lock poisoned");
        if matches!(entries.get(id), Some(Entry::Starting)) {
            entries.remove(id);
        }
    }

    /// The running sandbox for `id`.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let entries = self.entries.read().expect("registry read lock poisoned");
        match entries.get(id) {
            Some(Entry::Running(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Mark the running sandbox for `id` as stopping and return it.
    ///
    /// The id stays claimed until [`Registry::remove_if_same`].
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn take(&self, id: &str) -> Option<Arc<T>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut entries = self.entries.write().expect("registry write lock poisoned");
        let entry = entries.get_mut(id)?;
        let Entry::Running(value) = entry else {
            return None;
        };
        let value = Arc::clone(value);
        *entry = Entry::Stopping(Arc::clone(&value));
        Some(value)
    }

    /// Mark `id` as stopping only if it is still running `value`. Returns
    /// whether it did.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn retire_if_same(&self, id: &str, value: &Arc<T>) -> bool {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut entries = self.entries.write().expect("registry write lock poisoned");
        let running = matches!(
            entries.get(id),
            Some(Entry::Running(current)) if Arc::ptr_eq(current, value)
        );
        if running {
            entries.insert(id.to_owned(), Entry::Stopping(Arc::clone(value)));
        }
        running
    }

    /// Release `id` only if it still maps to `value`, running or stopping.
    /// Returns whether it did.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn remove_if_same(&self, id: &str, value: &Arc<T>) -> bool {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut entries = self.entries.write().expect("registry write lock poisoned");
        let same = entries.get(id).is_some_and(|entry| entry.holds(value));
        if same {
            entries.remove(id);
        }
        same
    }

    /// Every running sandbox, at one instant.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let entries = self.entries.read().expect("registry read lock poisoned");
        entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Running(value) => Some(Arc::clone(value)),
                Entry::Starting | Entry::Stopping(_) => None,
            })
            .collect()
    }

    /// Number of running sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Entry<T> {
    fn holds(&self, value: &Arc<T>) -> bool {
        match self {
            Self::Running(current) | Self::Stopping(current) => Arc::ptr_eq(current, value),
            Self::Starting => false,
        }
    }
}
