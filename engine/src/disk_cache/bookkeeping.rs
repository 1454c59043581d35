//! Ordered key-value store recording cache-entry expiry times.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::EngineError;

use crate::lock;

pub trait BookkeepingStore: Send + Sync {
    fn put(&self, key: &str, value: &str) -> Result<(), EngineError>;

    fn remove(&self, key: &str) -> Result<(), EngineError>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, EngineError>;

    fn clear(&self) -> Result<(), EngineError>;
}

fn scan(map: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock!(self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BookkeepingStore for MemoryStore {
    fn put(&self, key: &str, value: &str) -> Result<(), EngineError> {
        lock!(self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), EngineError> {
        lock!(self.entries).remove(key);
        Ok(())
    }

    fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, EngineError> {
        Ok(scan(&lock!(self.entries), prefix))
    }

    fn clear(&self) -> Result<(), EngineError> {
        lock!(self.entries).clear();
        Ok(())
    }
}

/// JSON file store, rewritten atomically on every change
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it is missing or unreadable
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!(
                    "Discarding unreadable cache bookkeeping {}: {}",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), EngineError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| EngineError::Io(format!("{} has no parent", self.path.display())))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string(entries)?.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| EngineError::Io(e.to_string()))?;
        Ok(())
    }
}

impl BookkeepingStore for JsonFileStore {
    fn put(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let mut entries = lock!(self.entries);
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), EngineError> {
        let mut entries = lock!(self.entries);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, EngineError> {
        Ok(scan(&lock!(self.entries), prefix))
    }

    fn clear(&self) -> Result<(), EngineError> {
        let mut entries = lock!(self.entries);
        entries.clear();
        self.persist(&entries)
    }
}
