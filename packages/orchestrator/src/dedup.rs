//! TTL-bounded cache of record keys a job family has already seen.
//!
//! Each job family owns one namespace file, `<dir>/<namespace>_cache.json`,
//! and is its only reader and writer, so no cross-job locking is needed.
//! Entries whose first sighting is older than the retention window are
//! evicted on the next write.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub first_seen: NaiveDate,
    pub last_checked: NaiveDate,
}

#[derive(Debug)]
pub struct DedupCache {
    path: PathBuf,
    retention_days: i64,
    entries: HashMap<String, DedupEntry>,
}

impl DedupCache {
    /// Open (or start) the cache for one namespace.
    ///
    /// An unreadable or corrupt file starts an empty cache rather than
    /// failing the job that consults it.
    pub fn open(dir: impl AsRef<Path>, namespace: &str, retention_days: i64) -> Self {
        let path = dir.as_ref().join(format!("{namespace}_cache.json"));
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt dedup cache, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            retention_days,
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&DedupEntry> {
        self.entries.get(key)
    }

    /// False while `key` is known and within the retention window.
    pub fn should_process(&self, key: &str, today: NaiveDate) -> bool {
        match self.entries.get(key) {
            Some(entry) => self.is_expired(entry, today),
            None => true,
        }
    }

    /// Record a sighting of `key`, evict expired entries and persist.
    ///
    /// An expired key starts over with a fresh `first_seen`.
    pub fn record(&mut self, key: &str, today: NaiveDate) -> Result<()> {
        self.evict_expired(today);
        self.entries
            .entry(key.to_string())
            .and_modify(|e| e.last_checked = today)
            .or_insert(DedupEntry {
                first_seen: today,
                last_checked: today,
            });
        self.save()
    }

    /// Evict expired entries and persist. Returns how many were removed.
    pub fn prune(&mut self, today: NaiveDate) -> Result<usize> {
        let removed = self.evict_expired(today);
        self.save()?;
        Ok(removed)
    }

    fn is_expired(&self, entry: &DedupEntry, today: NaiveDate) -> bool {
        (today - entry.first_seen).num_days() > self.retention_days
    }

    fn evict_expired(&mut self, today: NaiveDate) -> usize {
        let before = self.entries.len();
        let retention = self.retention_days;
        self.entries
            .retain(|_, e| (today - e.first_seen).num_days() <= retention);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(path = %self.path.display(), removed, "evicted expired dedup entries");
        }
        removed
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
