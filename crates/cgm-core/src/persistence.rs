//! Connection state that must survive restarts.
//!
//! Two values are remembered between runs: the BLE peripheral identifier of
//! the paired sensor (so reconnection can skip scanning) and the unlock
//! counter, which must never repeat for the same sensor.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Storage port for connection state.
///
/// Implementations are called from the connection task and must not block
/// for long.
pub trait ConnectionPersistence: Send + Sync {
    /// Identifier of the last connected peripheral.
    fn peripheral_id(&self) -> Option<String>;

    /// Remember (or forget, with `None`) the connected peripheral.
    fn set_peripheral_id(&self, id: Option<String>) -> Result<()>;

    /// Number of unlock payloads sent to the current sensor.
    fn unlock_count(&self) -> u16;

    /// Store the unlock counter.
    fn set_unlock_count(&self, count: u16) -> Result<()>;

    /// Forget everything tied to the previous sensor.
    fn reset_for_pairing(&self) -> Result<()> {
        self.set_peripheral_id(None)?;
        self.set_unlock_count(0)
    }
}

/// Persisted values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Last connected peripheral.
    #[serde(default)]
    pub peripheral_id: Option<String>,
    /// Unlock counter of the current sensor.
    #[serde(default)]
    pub unlock_count: u16,
}

/// In-memory persistence, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    record: RwLock<ConnectionRecord>,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with initial values.
    pub fn with_record(record: ConnectionRecord) -> Self {
        Self {
            record: RwLock::new(record),
        }
    }

    /// Snapshot of the stored values.
    pub fn record(&self) -> ConnectionRecord {
        self.record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ConnectionPersistence for MemoryPersistence {
    fn peripheral_id(&self) -> Option<String> {
        self.record().peripheral_id
    }

    fn set_peripheral_id(&self, id: Option<String>) -> Result<()> {
        self.record
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .peripheral_id = id;
        Ok(())
    }

    fn unlock_count(&self) -> u16 {
        self.record().unlock_count
    }

    fn set_unlock_count(&self, count: u16) -> Result<()> {
        self.record
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .unlock_count = count;
        Ok(())
    }
}

/// JSON file persistence.
///
/// The file is rewritten on every change through a temporary file and an
/// atomic rename. A missing or unreadable file starts from defaults.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    cache: MemoryPersistence,
}

impl FilePersistence {
    /// Open (or start) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring unreadable connection state {}: {}", path.display(), e);
                ConnectionRecord::default()
            }),
            Err(_) => ConnectionRecord::default(),
        };
        debug!("Loaded connection state from {}: {:?}", path.display(), record);
        Self {
            path,
            cache: MemoryPersistence::with_record(record),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.cache.record())?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConnectionPersistence for FilePersistence {
    fn peripheral_id(&self) -> Option<String> {
        self.cache.peripheral_id()
    }

    fn set_peripheral_id(&self, id: Option<String>) -> Result<()> {
        self.cache.set_peripheral_id(id)?;
        self.flush()
    }

    fn unlock_count(&self) -> u16 {
        self.cache.unlock_count()
    }

    fn set_unlock_count(&self, count: u16) -> Result<()> {
        self.cache.set_unlock_count(count)?;
        self.flush()
    }
}
