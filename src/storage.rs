//! Durable key-value storage.
//!
//! Only values that outlive a run live here: the device identifier, the
//! admin-mode toggle and the participation record. Admin authentication is
//! session state and is never written through this trait.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

pub const DEVICE_ID_KEY: &str = "deviceId";
pub const ADMIN_MODE_ACTIVE_KEY: &str = "adminModeActive";
pub const PARTICIPATED_DEVICES_KEY: &str = "participatedDevices";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait DurableStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests and throwaway runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RefCell<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.borrow_mut().remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten on every change
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: RefCell<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open `path`, starting empty when it is missing or unreadable.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "unreadable store, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        debug!(path = %path.display(), entries = values.len(), "store opened");
        Self {
            path,
            values: RefCell::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(&*self.values.borrow())?;
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.path, &data)
        };
        write().map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let removed = self.values.borrow_mut().remove(key).is_some();
        if removed {
            self.flush()
        } else {
            Ok(())
        }
    }
}

pub fn get_flag(store: &dyn DurableStore, key: &str) -> bool {
    store.get(key).as_deref() == Some("true")
}

pub fn set_flag(store: &dyn DurableStore, key: &str, value: bool) -> Result<(), StoreError> {
    store.set(key, if value { "true" } else { "false" })
}

fn participated_devices(store: &dyn DurableStore) -> Vec<String> {
    store
        .get(PARTICIPATED_DEVICES_KEY)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn has_participated(store: &dyn DurableStore, device_id: &str) -> bool {
    participated_devices(store).iter().any(|d| d == device_id)
}

pub fn record_participation(store: &dyn DurableStore, device_id: &str) -> Result<(), StoreError> {
    let mut devices = participated_devices(store);
    if devices.iter().any(|d| d == device_id) {
        return Ok(());
    }
    devices.push(device_id.to_string());
    store.set(PARTICIPATED_DEVICES_KEY, &serde_json::to_string(&devices)?)
}

/// Forget every recorded participation. Returns how many were dropped.
pub fn clear_participation(store: &dyn DurableStore) -> Result<usize, StoreError> {
    let count = participated_devices(store).len();
    store.remove(PARTICIPATED_DEVICES_KEY)?;
    Ok(count)
}
