use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::atomic::restrict_dir;
use crate::errors::{WalletError, WalletResult};

/// Manages filesystem paths used by the vault.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    /// Root directory for vault data.
    root_dir: PathBuf,
    /// Master credential file.
    auth_file: PathBuf,
    /// Persisted session marker.
    session_file: PathBuf,
    /// Unlock backoff carried across restarts.
    throttle_file: PathBuf,
    /// Application configuration.
    config_file: PathBuf,
    /// Plaintext metadata index.
    metadata_file: PathBuf,
    /// One encrypted file per record.
    records_dir: PathBuf,
    /// Snapshots of the records directory.
    backup_dir: PathBuf,
}

impl VaultPaths {
    pub const AUTH_FILENAME: &'static str = "auth.json";
    pub const SESSION_FILENAME: &'static str = ".session";
    pub const THROTTLE_FILENAME: &'static str = ".throttle";
    pub const CONFIG_FILENAME: &'static str = "config.json";
    pub const METADATA_FILENAME: &'static str = "wallets.json";
    pub const RECORDS_DIRNAME: &'static str = "wallets";
    pub const BACKUPS_DIRNAME: &'static str = "backups";
    /// Extension of encrypted record files.
    pub const RECORD_EXTENSION: &'static str = "enc";

    /// Create a new path manager rooted at the provided directory.
    pub fn new(root: impl AsRef<Path>) -> WalletResult<Self> {
        let root_dir = root.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(WalletError::StorageError(
                "Vault root directory cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            auth_file: root_dir.join(Self::AUTH_FILENAME),
            session_file: root_dir.join(Self::SESSION_FILENAME),
            throttle_file: root_dir.join(Self::THROTTLE_FILENAME),
            config_file: root_dir.join(Self::CONFIG_FILENAME),
            metadata_file: root_dir.join(Self::METADATA_FILENAME),
            records_dir: root_dir.join(Self::RECORDS_DIRNAME),
            backup_dir: root_dir.join(Self::BACKUPS_DIRNAME),
            root_dir,
        })
    }

    /// Ensure the directory structure exists, restricted to the owner.
    pub fn ensure_directories(&self) -> WalletResult<()> {
        for dir in [&self.root_dir, &self.records_dir, &self.backup_dir] {
            fs::create_dir_all(dir)?;
            restrict_dir(dir)?;
        }
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn auth_file(&self) -> &Path {
        &self.auth_file
    }

    pub fn session_file(&self) -> &Path {
        &self.session_file
    }

    pub fn throttle_file(&self) -> &Path {
        &self.throttle_file
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn metadata_file(&self) -> &Path {
        &self.metadata_file
    }

    pub fn records_dir(&self) -> &Path {
        &self.records_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Path of the encrypted file for a record identifier.
    pub fn record_file(&self, id: &str) -> PathBuf {
        self.records_dir
            .join(format!("{}.{}", id, Self::RECORD_EXTENSION))
    }

    /// Copy every record file into a fresh timestamped snapshot directory.
    /// Returns the snapshot path.
    pub fn snapshot_records(&self) -> WalletResult<PathBuf> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let snapshot = self.backup_dir.join(format!("records_{}", timestamp));
        fs::create_dir_all(&snapshot)?;
        restrict_dir(&snapshot)?;

        if self.records_dir.exists() {
            for entry in fs::read_dir(&self.records_dir)? {
                let path = entry?.path();
                if !is_record_file(&path) {
                    continue;
                }
                if let Some(name) = path.file_name() {
                    let target = snapshot.join(name);
                    fs::copy(&path, &target)?;

                    let original_size = fs::metadata(&path)?.len();
                    let copied_size = fs::metadata(&target)?.len();
                    if original_size != copied_size {
                        return Err(WalletError::StorageError(
                            "Snapshot verification failed: size mismatch".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(snapshot)
    }

    /// Restore every record file from a snapshot directory. Record files
    /// absent from the snapshot are left untouched.
    pub fn restore_records(&self, snapshot: impl AsRef<Path>) -> WalletResult<usize> {
        let snapshot = snapshot.as_ref();
        if !snapshot.is_dir() {
            return Err(WalletError::NotFound(format!(
                "Snapshot does not exist: {}",
                snapshot.display()
            )));
        }

        fs::create_dir_all(&self.records_dir)?;
        let mut restored = 0;
        for entry in fs::read_dir(snapshot)? {
            let path = entry?.path();
            if !is_record_file(&path) {
                continue;
            }
            if let Some(name) = path.file_name() {
                fs::copy(&path, self.records_dir.join(name))?;
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// List snapshot directories, newest first.
    pub fn list_backups(&self) -> WalletResult<Vec<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            let is_snapshot = path.is_dir()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("records_"))
                    .unwrap_or(false);
            if is_snapshot {
                backups.push(path);
            }
        }

        // Names embed a sortable timestamp.
        backups.sort();
        backups.reverse();
        Ok(backups)
    }

    /// Delete old snapshots, keeping only the N most recent.
    pub fn prune_old_backups(&self, keep_count: usize) -> WalletResult<usize> {
        let backups = self.list_backups()?;
        let mut deleted_count = 0;

        for backup_path in backups.iter().skip(keep_count) {
            fs::remove_dir_all(backup_path)?;
            deleted_count += 1;
        }

        Ok(deleted_count)
    }
}

pub(crate) fn is_record_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == VaultPaths::RECORD_EXTENSION)
            .unwrap_or(false)
}
