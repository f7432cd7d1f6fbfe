//! Host-resident name table for sandboxes.
//!
//! Owns a hosts-format file mapping sandbox ids to their host-routable VM IP.
//! Every mutation rewrites the file under a single mutex via write-to-temp
//! and rename, so readers never see a partial file.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::DnsError;

/// Process-wide sandbox name table.
#[derive(Debug)]
pub struct DnsPublisher {
    hosts_path: PathBuf,
    entries: Mutex<BTreeMap<String, Ipv4Addr>>,
}

impl DnsPublisher {
    /// Take ownership of `hosts_path`, writing an empty table to it.
    ///
    /// # Errors
    /// Returns [`DnsError::Write`] if the file cannot be written.
    pub async fn open(hosts_path: impl Into<PathBuf>) -> Result<Self, DnsError> {
        let publisher = Self {
            hosts_path: hosts_path.into(),
            entries: Mutex::new(BTreeMap::new()),
        };
        if let Some(parent) = publisher.hosts_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| DnsError::Write {
                path: publisher.hosts_path.clone(),
                source,
            })?;
        }
        publisher.flush(&BTreeMap::new()).await?;
        Ok(publisher)
    }

    #[must_use]
    pub fn hosts_path(&self) -> &Path {
        &self.hosts_path
    }

    /// Publish `id → ip`, replacing any previous entry for `id`.
    ///
    /// # Errors
    /// Returns [`DnsError::Write`] if the file cannot be rewritten; the
    /// in-memory table is left unchanged in that case.
    pub async fn add(&self, id: &str, ip: Ipv4Addr) -> Result<(), DnsError> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(id.to_owned(), ip);
        if let Err(e) = self.flush(&entries).await {
            match previous {
                Some(old) => entries.insert(id.to_owned(), old),
                None => entries.remove(id),
            };
            return Err(e);
        }
        tracing::debug!(sandbox_id = %id, %ip, "dns entry published");
        Ok(())
    }

    /// Remove the entry for `id`. Removing an unknown id is a no-op.
    ///
    /// # Errors
    /// Returns [`DnsError::Write`] if the file cannot be rewritten.
    pub async fn remove(&self, id: &str) -> Result<(), DnsError> {
        let mut entries = self.entries.lock().await;
        let Some(ip) = entries.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.flush(&entries).await {
            entries.insert(id.to_owned(), ip);
            return Err(e);
        }
        tracing::debug!(sandbox_id = %id, "dns entry removed");
        Ok(())
    }

    /// Current address for `id`.
    pub async fn lookup(&self, id: &str) -> Option<Ipv4Addr> {
        self.entries.lock().await.get(id).copied()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn flush(&self, entries: &BTreeMap<String, Ipv4Addr>) -> Result<(), DnsError> {
        let file_name = self
            .hosts_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self.hosts_path.with_file_name(format!(".{file_name}.tmp"));
        let write_err = |source| DnsError::Write {
            path: self.hosts_path.clone(),
            source,
        };

        tokio::fs::write(&tmp, render(entries)).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.hosts_path).await.map_err(write_err)
    }
}

/// Render the table in hosts-file format, one `ip<TAB>name` line per entry.
fn render(entries: &BTreeMap<String, Ipv4Addr>) -> String {
    let mut out = String::new();
    for (name, ip) in entries {
        let _ = writeln!(out, "{ip}\t{name}");
    }
    out
}
