//! Store abstraction for governed registries
//!
//! Budgets, policies, baselines and anomalies persist through a small
//! keyed-store interface so the business logic stays independent of the
//! persistence technology. Two backends are provided:
//! - `MemoryStore`: sharded in-memory map, per-key atomic updates
//! - `JsonFileStore`: memory store with load-on-open and atomic
//!   temp-file-rename flush

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{GovernorError, Result};

/// Flush retry attempts for transient I/O failures
const FLUSH_RETRIES: u32 = 3;

/// Initial backoff between flush retries
const FLUSH_BACKOFF: Duration = Duration::from_millis(50);

/// Keyed store with per-key atomic updates.
///
/// `update` runs the closure while holding the key's entry lock, so
/// check-then-write sequences against one key are linearizable.
pub trait Store<T: Clone + Send + Sync>: Send + Sync {
    fn get(&self, id: &str) -> Option<T>;

    fn put(&self, id: &str, value: T);

    fn list(&self) -> Vec<T>;

    /// Remove and return the value; `NotFound` if absent
    fn remove(&self, id: &str) -> Result<T>;

    /// Mutate the value under the entry lock and return the updated copy
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T)) -> Result<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist pending changes; a no-op for purely in-memory backends
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory store backed by a sharded concurrent map
pub struct MemoryStore<T> {
    kind: &'static str,
    map: DashMap<String, T>,
}

impl<T: Clone + Send + Sync> MemoryStore<T> {
    /// `kind` names the stored record type in NotFound errors
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            map: DashMap::new(),
        }
    }
}

impl<T: Clone + Send + Sync> Store<T> for MemoryStore<T> {
    fn get(&self, id: &str) -> Option<T> {
        self.map.get(id).map(|v| v.clone())
    }

    fn put(&self, id: &str, value: T) {
        self.map.insert(id.to_string(), value);
    }

    fn list(&self) -> Vec<T> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    fn remove(&self, id: &str) -> Result<T> {
        self.map
            .remove(id)
            .map(|(_, v)| v)
            .ok_or_else(|| GovernorError::not_found(self.kind, id))
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T)) -> Result<T> {
        let mut entry = self
            .map
            .get_mut(id)
            .ok_or_else(|| GovernorError::not_found(self.kind, id))?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// JSON-file-backed store: memory store plus durable snapshots.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// mid-flush never leaves a truncated snapshot behind. Transient I/O
/// failures are retried with bounded backoff here, at the storage
/// boundary, never inside business logic.
pub struct JsonFileStore<T> {
    inner: MemoryStore<T>,
    path: PathBuf,
    dirty: AtomicBool,
}

impl<T> JsonFileStore<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned,
{
    pub fn open(kind: &'static str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self {
            inner: MemoryStore::new(kind),
            path,
            dirty: AtomicBool::new(false),
        };

        if store.path.exists() {
            store.load()?;
        }

        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let data = std::fs::read(&self.path)
            .map_err(|e| GovernorError::Store(format!("read {:?}: {}", self.path, e)))?;
        let records: Vec<(String, T)> = serde_json::from_slice(&data)
            .map_err(|e| GovernorError::Store(format!("deserialize {:?}: {}", self.path, e)))?;

        for (id, value) in records {
            self.inner.put(&id, value);
        }

        debug!(path = %self.path.display(), entries = self.inner.len(), "Loaded store from disk");
        Ok(())
    }

    /// Persist the current contents if anything changed since the last flush
    fn flush_to_disk(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let records: Vec<(String, T)> = self
            .inner
            .map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let json = serde_json::to_vec(&records)
            .map_err(|e| GovernorError::Store(format!("serialize: {}", e)))?;

        let mut backoff = FLUSH_BACKOFF;
        let mut last_err = None;
        for attempt in 0..FLUSH_RETRIES {
            match write_atomic(&self.path, &json) {
                Ok(()) => {
                    debug!(path = %self.path.display(), entries = records.len(), "Store flushed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Store flush failed, retrying");
                    last_err = Some(e);
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }

        self.dirty.store(true, Ordering::Release);
        Err(GovernorError::Store(format!(
            "flush {:?} failed after {} attempts: {}",
            self.path,
            FLUSH_RETRIES,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, data)?;
    std::fs::rename(&temp_path, path)
}

impl<T> Store<T> for JsonFileStore<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned,
{
    fn get(&self, id: &str) -> Option<T> {
        self.inner.get(id)
    }

    fn put(&self, id: &str, value: T) {
        self.inner.put(id, value);
        self.dirty.store(true, Ordering::Release);
    }

    fn list(&self) -> Vec<T> {
        self.inner.list()
    }

    fn remove(&self, id: &str) -> Result<T> {
        let removed = self.inner.remove(id)?;
        self.dirty.store(true, Ordering::Release);
        Ok(removed)
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T)) -> Result<T> {
        let updated = self.inner.update(id, f)?;
        self.dirty.store(true, Ordering::Release);
        Ok(updated)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn flush(&self) -> Result<()> {
        self.flush_to_disk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        value: u64,
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new("record");
        store.put(
            "r-1",
            Record {
                name: "one".to_string(),
                value: 1,
            },
        );

        assert_eq!(store.get("r-1").unwrap().value, 1);
        assert_eq!(store.list().len(), 1);
        assert!(store.get("r-2").is_none());
    }

    #[test]
    fn test_memory_store_update_atomicity() {
        let store = std::sync::Arc::new(MemoryStore::new("record"));
        store.put(
            "counter",
            Record {
                name: "counter".to_string(),
                value: 0,
            },
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store
                        .update("counter", &mut |r| r.value += 1)
                        .expect("counter exists");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get("counter").unwrap().value, 800);
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let store: MemoryStore<Record> = MemoryStore::new("record");
        let err = store.remove("nope").unwrap_err();
        assert!(matches!(err, GovernorError::NotFound { .. }));
    }

    #[test]
    fn test_json_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        {
            let store = JsonFileStore::open("record", &path).unwrap();
            store.put(
                "r-1",
                Record {
                    name: "persisted".to_string(),
                    value: 42,
                },
            );
            store.flush().unwrap();
        }

        let reopened: JsonFileStore<Record> = JsonFileStore::open("record", &path).unwrap();
        assert_eq!(reopened.get("r-1").unwrap().value, 42);
    }

    #[test]
    fn test_json_store_flush_is_noop_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let store: JsonFileStore<Record> = JsonFileStore::open("record", &path).unwrap();
        store.flush().unwrap();
        assert!(!path.exists());
    }
}
