//! Cumulative per-plate counters that outlive a single run.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};

use crate::error::StoreError;
use crate::session::RunSummary;

pub trait CounterStore: Send + Sync {
    fn increment(&self, plate: &str, by: u64) -> Result<u64, StoreError>;

    fn get(&self, plate: &str) -> Result<u64, StoreError>;

    fn get_all(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    fn reset_all(&self) -> Result<(), StoreError>;

    /// Adds every count of a finished run.
    fn merge(&self, summary: &RunSummary) -> Result<(), StoreError> {
        for (plate, count) in &summary.counts {
            self.increment(plate, *count)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCounters {
    counts: Mutex<HashMap<String, u64>>,
}

impl InMemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for InMemoryCounters {
    fn increment(&self, plate: &str, by: u64) -> Result<u64, StoreError> {
        let mut counts = self.counts.lock().map_err(|_| StoreError::Poisoned)?;
        let count = counts.entry(plate.to_string()).or_insert(0);
        *count += by;
        Ok(*count)
    }

    fn get(&self, plate: &str) -> Result<u64, StoreError> {
        let counts = self.counts.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(counts.get(plate).copied().unwrap_or(0))
    }

    fn get_all(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let counts = self.counts.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(counts.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    fn reset_all(&self) -> Result<(), StoreError> {
        self.counts
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .clear();
        Ok(())
    }
}

/// Counters kept in a pretty printed JSON object, `{"PLATE": count}`.
///
/// Every update rereads the file and replaces it through a temporary sibling,
/// so a crash never leaves half a document behind.
pub struct JsonFileCounters {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCounters {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let store = Self {
            path,
            lock: Mutex::new(()),
        };
        if !store.path.exists() {
            info!("creating counter store {}", store.path.display());
            store.write(&BTreeMap::new())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(io_error(&self.path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, counts: &BTreeMap<String, u64>) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(counts).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let mut file = fs::File::create(&temp).map_err(|source| io_error(&temp, source))?;
        file.write_all(body.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|source| io_error(&temp, source))?;
        drop(file);

        fs::rename(&temp, &self.path).map_err(|source| io_error(&self.path, source))?;
        debug!("counter store {} saved", self.path.display());
        Ok(())
    }

    fn update<T>(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, u64>) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut counts = self.read()?;
        let result = apply(&mut counts);
        self.write(&counts)?;
        Ok(result)
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl CounterStore for JsonFileCounters {
    fn increment(&self, plate: &str, by: u64) -> Result<u64, StoreError> {
        self.update(|counts| {
            let count = counts.entry(plate.to_string()).or_insert(0);
            *count += by;
            *count
        })
    }

    fn get(&self, plate: &str) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.read()?.get(plate).copied().unwrap_or(0))
    }

    fn get_all(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.read()
    }

    fn reset_all(&self) -> Result<(), StoreError> {
        self.update(|counts| counts.clear())
    }

    fn merge(&self, summary: &RunSummary) -> Result<(), StoreError> {
        self.update(|counts| {
            for (plate, count) in &summary.counts {
                *counts.entry(plate.clone()).or_insert(0) += count;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn summary(pairs: &[(&str, u64)]) -> RunSummary {
        RunSummary {
            counts: pairs.iter().map(|(p, c)| (p.to_string(), *c)).collect(),
            total_frames_processed: 10,
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn in_memory_merge_and_reset() {
        let store = InMemoryCounters::new();
        store.increment("A", 1).unwrap();
        store.merge(&summary(&[("A", 2), ("B", 1)])).unwrap();
        assert_eq!(store.get("A").unwrap(), 3);
        assert_eq!(store.get("missing").unwrap(), 0);
        assert_eq!(store.get_all().unwrap().len(), 2);

        store.reset_all().unwrap();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn json_store_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plates.json");
        let store = JsonFileCounters::open(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.json");
        {
            let store = JsonFileCounters::open(&path).unwrap();
            store.merge(&summary(&[("01A123BC", 2), ("TP12345", 1)])).unwrap();
            assert_eq!(store.increment("TP12345", 1).unwrap(), 2);
        }

        let reopened = JsonFileCounters::open(&path).unwrap();
        assert_eq!(reopened.get("01A123BC").unwrap(), 2);
        assert_eq!(reopened.get("TP12345").unwrap(), 2);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"01A123BC\": 2"), "pretty printed: {raw}");
        assert!(!path.with_extension("json.tmp").exists());

        reopened.reset_all().unwrap();
        assert!(JsonFileCounters::open(&path).unwrap().get_all().unwrap().is_empty());
    }

    #[test]
    fn json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.json");
        fs::write(&path, "not json").unwrap();
        let store = JsonFileCounters::open(&path).unwrap();
        assert!(matches!(store.get_all(), Err(StoreError::Json { .. })));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileCounters::open(dir.path().join("plates.json")).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..10 {
                        store.increment("A", 1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(store.get("A").unwrap(), 40);
    }
}
