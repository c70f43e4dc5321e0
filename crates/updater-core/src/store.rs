//! Per-version persisted state (priority, purpose).
//!
//! Written synchronously at each transition boundary so that after a crash
//! the store reflects the last completed transition.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::local::write_atomic;
use crate::version::{InvalidVersionId, VersionId, VersionPurpose};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state for {id}: {message}")]
    Corrupt { id: VersionId, message: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    InvalidId(#[from] InvalidVersionId),
}

/// Persisted fields of one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedVersion {
    pub priority: Option<u8>,
    pub purpose: Option<VersionPurpose>,
}

pub trait PersistStore: Send + Sync {
    fn load(&self, id: &VersionId) -> Result<PersistedVersion, StoreError>;

    fn save(&self, id: &VersionId, state: &PersistedVersion) -> Result<(), StoreError>;

    /// Remove everything persisted for `id`. Missing state is not an error.
    fn remove(&self, id: &VersionId) -> Result<(), StoreError>;

    fn store_priority(&self, id: &VersionId, priority: u8) -> Result<(), StoreError> {
        let mut state = self.load(id)?;
        state.priority = Some(priority);
        self.save(id, &state)
    }

    fn restore_priority(&self, id: &VersionId) -> Result<Option<u8>, StoreError> {
        Ok(self.load(id)?.priority)
    }

    fn store_purpose(&self, id: &VersionId, purpose: VersionPurpose) -> Result<(), StoreError> {
        let mut state = self.load(id)?;
        state.purpose = Some(purpose);
        self.save(id, &state)
    }

    fn restore_purpose(&self, id: &VersionId) -> Result<Option<VersionPurpose>, StoreError> {
        Ok(self.load(id)?.purpose)
    }
}

/// `<dir>/<id>/state.toml` per version.
#[derive(Debug, Clone)]
pub struct FsPersistStore {
    dir: PathBuf,
}

impl FsPersistStore {
    const FILE_NAME: &'static str = "state.toml";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn version_dir(&self, id: &VersionId) -> Result<PathBuf, StoreError> {
        id.ensure_valid()?;
        Ok(self.dir.join(id.as_str()))
    }
}

impl PersistStore for FsPersistStore {
    fn load(&self, id: &VersionId) -> Result<PersistedVersion, StoreError> {
        match fs::read_to_string(self.version_dir(id)?.join(Self::FILE_NAME)) {
            Ok(content) => toml::from_str(&content).map_err(|e| StoreError::Corrupt {
                id: id.clone(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedVersion::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, id: &VersionId, state: &PersistedVersion) -> Result<(), StoreError> {
        let content = toml::to_string(state)?;
        write_atomic(&self.version_dir(id)?.join(Self::FILE_NAME), content.as_bytes())?;
        Ok(())
    }

    fn remove(&self, id: &VersionId) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.version_dir(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<VersionId, PersistedVersion>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &VersionId) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }
}

impl PersistStore for MemoryStore {
    fn load(&self, id: &VersionId) -> Result<PersistedVersion, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    fn save(&self, id: &VersionId, state: &PersistedVersion) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(id.clone(), state.clone());
        Ok(())
    }

    fn remove(&self, id: &VersionId) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(id);
        Ok(())
    }
}
