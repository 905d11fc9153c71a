//! Plaintext listing cache (`wallets.json`).
//!
//! The index only ever holds display data. It is rebuilt from the encrypted
//! records whenever it goes missing, so every read here is best-effort.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;
use super::RecordId;
use crate::errors::WalletResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    Standalone,
    SeedGroup,
}

/// Non-secret display metadata for one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub name: String,
    pub chain_type: String,
    pub network: String,
    pub updated_at: DateTime<Utc>,
}

impl RecordMetadata {
    pub fn new(
        kind: RecordKind,
        name: impl Into<String>,
        chain_type: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            chain_type: chain_type.into(),
            network: network.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

pub type MetadataMap = BTreeMap<RecordId, RecordMetadata>;

/// Read-modify-write access to `wallets.json`, serialized by an internal lock.
#[derive(Debug)]
pub struct MetadataIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetadataIndex {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &RecordId) -> Option<RecordMetadata> {
        let _guard = self.lock.lock();
        self.load().remove(id)
    }

    pub fn get_all(&self) -> MetadataMap {
        let _guard = self.lock.lock();
        self.load()
    }

    pub fn save(&self, id: &RecordId, metadata: RecordMetadata) -> WalletResult<()> {
        self.update(|entries| {
            entries.insert(id.clone(), metadata);
        })
    }

    pub fn remove(&self, id: &RecordId) -> WalletResult<bool> {
        let mut removed = false;
        self.update(|entries| {
            removed = entries.remove(id).is_some();
        })?;
        Ok(removed)
    }

    /// Apply `mutate` to the whole index as one critical section.
    pub fn update<F>(&self, mutate: F) -> WalletResult<()>
    where
        F: FnOnce(&mut MetadataMap),
    {
        let _guard = self.lock.lock();
        let mut entries = self.load();
        mutate(&mut entries);
        let serialized = serde_json::to_vec_pretty(&entries)?;
        write_atomic(&self.path, &serialized)
    }

    fn load(&self) -> MetadataMap {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return MetadataMap::new(),
            Err(err) => {
                log::warn!("Metadata index unreadable, ignoring: {}", err);
                return MetadataMap::new();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("Metadata index corrupted, ignoring: {}", err);
                MetadataMap::new()
            }
        }
    }
}
