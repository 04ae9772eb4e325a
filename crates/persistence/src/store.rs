//! Atomic, backed-up key -> JSON document store.
//!
//! Writes go to a temp file and are renamed into place, so readers never
//! observe a partial document. Every overwrite of an existing document
//! first copies it into a timestamped backup; on a corrupt or missing
//! primary, reads fall back to the newest readable backup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Store-level error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to prepare data directory {path}: {source}")]
    Init {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize document '{key}': {source}")]
    Serialize {
        key: String,
        source: serde_json::Error,
    },

    #[error("failed to write document '{key}': {source}")]
    Write {
        key: String,
        source: std::io::Error,
    },
}

/// Disk usage summary for the data directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskStats {
    pub data_bytes: u64,
    pub backup_count: usize,
}

/// A pending debounce timer for one key.
struct PendingSave {
    generation: u64,
    handle: JoinHandle<()>,
}

struct StoreInner {
    data_dir: PathBuf,
    backups_dir: PathBuf,
    timers: Mutex<HashMap<String, PendingSave>>,
    generation: Mutex<u64>,
}

/// Atomic JSON document store.
///
/// Cheap to clone; clones share the same directories and debounce timers.
#[derive(Clone)]
pub struct PersistenceStore {
    inner: Arc<StoreInner>,
}

impl PersistenceStore {
    /// Open (or create) a store rooted at `data_dir`.
    ///
    /// Backups live in a `backups/` subdirectory.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        let backups_dir = data_dir.join("backups");

        for dir in [&data_dir, &backups_dir] {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Init {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                data_dir,
                backups_dir,
                timers: Mutex::new(HashMap::new()),
                generation: Mutex::new(0),
            }),
        })
    }

    fn document_path(&self, key: &str) -> PathBuf {
        self.inner.data_dir.join(format!("{key}.json"))
    }

    /// Save `document` under `key`, atomically.
    ///
    /// Backup-copy failure is logged and swallowed; serialization and the
    /// atomic write itself propagate.
    pub async fn save<T: Serialize>(&self, key: &str, document: &T) -> Result<(), StoreError> {
        let path = self.document_path(key);
        let tmp_path = self.inner.data_dir.join(format!("{key}.json.tmp"));

        let json = serde_json::to_string_pretty(document).map_err(|source| {
            StoreError::Serialize {
                key: key.to_string(),
                source,
            }
        })?;

        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|source| StoreError::Write {
                key: key.to_string(),
                source,
            })?;

        // Back up the previous version before it is replaced.
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            if let Err(e) = self.create_backup(key, &path).await {
                warn!(key, error = %e, "backup copy failed, continuing with save");
            }
        }

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| StoreError::Write {
                key: key.to_string(),
                source,
            })?;

        debug!(key, "saved document");
        Ok(())
    }

    /// Load the document stored under `key`.
    ///
    /// Returns `Ok(None)` when neither the primary file nor any readable
    /// backup holds data for the key. A corrupt or missing primary falls
    /// back to the newest readable backup.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.document_path(key);

        match read_document::<T>(&path).await {
            Ok(doc) => {
                debug!(key, "loaded document");
                Ok(Some(doc))
            }
            Err(e) => {
                if !matches!(&e, ReadError::Io(io) if io.kind() == std::io::ErrorKind::NotFound) {
                    warn!(key, error = %e, "primary document unreadable, trying backups");
                }
                self.load_from_latest_backup(key).await
            }
        }
    }

    /// Schedule a save of `supplier()` under `key` after `delay` of
    /// inactivity on that key.
    ///
    /// A newer call for the same key cancels the pending one, so within a
    /// quiet period only the last registered supplier runs. Failures
    /// inside the deferred save are logged and swallowed.
    pub fn debounced_save<T, F>(&self, key: &str, supplier: F, delay: Duration)
    where
        // Sync because the timer task borrows the document across the
        // save's await points.
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let generation = {
            let mut gen_guard = self.inner.generation.lock().unwrap();
            *gen_guard += 1;
            *gen_guard
        };

        let store = self.clone();
        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let document = supplier();
            if let Err(e) = store.save(&task_key, &document).await {
                error!(key = %task_key, error = %e, "debounced save failed");
            }

            let mut timers = store.inner.timers.lock().unwrap();
            if timers.get(&task_key).is_some_and(|p| p.generation == generation) {
                timers.remove(&task_key);
            }
        });

        let mut timers = self.inner.timers.lock().unwrap();
        if let Some(previous) = timers.insert(key.to_string(), PendingSave { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel every pending debounce timer without saving.
    ///
    /// This does not force the corresponding data to disk; shutdown paths
    /// must pair it with an explicit final save of each collection.
    pub fn flush_all(&self) {
        let mut timers = self.inner.timers.lock().unwrap();
        for (key, pending) in timers.drain() {
            pending.handle.abort();
            debug!(key, "cancelled pending debounced save");
        }
    }

    async fn create_backup(&self, key: &str, source: &Path) -> std::io::Result<()> {
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let backup_path = self
            .inner
            .backups_dir
            .join(format!("{key}_{timestamp}.json"));

        tokio::fs::copy(source, &backup_path).await?;
        debug!(key, backup = %backup_path.display(), "created backup");
        Ok(())
    }

    /// All backup files for `key`, newest first.
    async fn backups_for(&self, key: &str) -> Vec<PathBuf> {
        let prefix = format!("{key}_");
        let mut backups = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.inner.backups_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key, error = %e, "failed to list backups directory");
                return backups;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                backups.push(entry.path());
            }
        }

        // Timestamps are embedded zero-padded, so lexicographic order is
        // chronological order.
        backups.sort();
        backups.reverse();
        backups
    }

    async fn load_from_latest_backup<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        for backup in self.backups_for(key).await {
            match read_document::<T>(&backup).await {
                Ok(doc) => {
                    warn!(key, backup = %backup.display(), "recovered document from backup");
                    return Ok(Some(doc));
                }
                Err(e) => {
                    warn!(key, backup = %backup.display(), error = %e, "backup unreadable, trying older one");
                }
            }
        }

        debug!(key, "no persisted data found");
        Ok(None)
    }

    /// Delete all but the newest `keep` backups for `key`.
    ///
    /// Best-effort: individual deletion failures are logged and skipped.
    /// Returns the number of backups deleted.
    pub async fn cleanup_old_backups(&self, key: &str, keep: usize) -> usize {
        let backups = self.backups_for(key).await;
        let mut deleted = 0;

        for old in backups.iter().skip(keep) {
            match tokio::fs::remove_file(old).await {
                Ok(()) => {
                    debug!(key, backup = %old.display(), "deleted old backup");
                    deleted += 1;
                }
                Err(e) => {
                    warn!(key, backup = %old.display(), error = %e, "failed to delete old backup");
                }
            }
        }

        deleted
    }

    /// Probe whether the data directory accepts writes.
    pub async fn is_writable(&self) -> bool {
        let probe = self.inner.data_dir.join(".write-test");
        if tokio::fs::write(&probe, b"test").await.is_err() {
            return false;
        }
        let _ = tokio::fs::remove_file(&probe).await;
        true
    }

    /// Total size of the stored documents plus the number of backups.
    pub async fn disk_stats(&self) -> DiskStats {
        let mut stats = DiskStats::default();

        if let Ok(mut entries) = tokio::fs::read_dir(&self.inner.data_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(meta) = entry.metadata().await {
                    if meta.is_file() {
                        stats.data_bytes += meta.len();
                    }
                }
            }
        }

        if let Ok(mut entries) = tokio::fs::read_dir(&self.inner.backups_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.metadata().await.map(|m| m.is_file()).unwrap_or(false) {
                    stats.backup_count += 1;
                }
            }
        }

        stats
    }
}

#[derive(Debug, Error)]
enum ReadError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, ReadError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}
