use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::KdfParameters;
use crate::errors::{WalletError, WalletResult};
use crate::storage::atomic::write_atomic;
use crate::storage::VaultPaths;

const CONFIG_VERSION: u16 = 1;

const ENV_SESSION_TIMEOUT: &str = "KEYVAULT_SESSION_TIMEOUT";
const ENV_FREE_ATTEMPTS: &str = "KEYVAULT_FREE_ATTEMPTS";
const ENV_DEFAULT_CHAIN: &str = "KEYVAULT_DEFAULT_CHAIN";
const ENV_DEFAULT_NETWORK: &str = "KEYVAULT_DEFAULT_NETWORK";
const ENV_BACKUP_KEEP: &str = "KEYVAULT_BACKUP_KEEP";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub timeout_minutes: u32,
    /// Consecutive failed unlocks tolerated before backoff starts.
    pub free_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 15,
            free_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 32_000,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes.max(1)).saturating_mul(60))
    }
}

/// Defaults applied to wallet options when the caller leaves them out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletDefaults {
    pub chain_type: String,
    pub network: String,
}

impl Default for WalletDefaults {
    fn default() -> Self {
        Self {
            chain_type: "ed25519".to_string(),
            network: "mainnet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfig {
    pub keep: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { keep: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub defaults: WalletDefaults,
    #[serde(default)]
    pub backups: BackupConfig,
    /// Work factor for a vault created with this config. An existing
    /// vault keeps the one recorded in its credential.
    #[serde(default)]
    pub kdf: KdfParameters,
    /// Free-form application settings, preserved verbatim.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub last_updated: DateTime<Utc>,
    pub version: u16,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            defaults: WalletDefaults::default(),
            backups: BackupConfig::default(),
            kdf: KdfParameters::default(),
            extra: serde_json::Map::new(),
            last_updated: Utc::now(),
            version: CONFIG_VERSION,
        }
    }
}

impl VaultConfig {
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Overlay `KEYVAULT_*` environment variables onto this config. Values
    /// that do not parse are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let keys = [
            ENV_SESSION_TIMEOUT,
            ENV_FREE_ATTEMPTS,
            ENV_DEFAULT_CHAIN,
            ENV_DEFAULT_NETWORK,
            ENV_BACKUP_KEEP,
        ];

        for key in keys {
            let Some(value) = lookup(key) else {
                continue;
            };

            if value.trim().is_empty() {
                log::warn!("Environment variable {} is empty", key);
                continue;
            }

            if value.chars().any(|c| c.is_control()) {
                log::warn!(
                    "Environment variable {} contains control characters, ignoring",
                    key
                );
                continue;
            }

            let value = value.trim();
            match key {
                ENV_DEFAULT_CHAIN => self.defaults.chain_type = value.to_string(),
                ENV_DEFAULT_NETWORK => self.defaults.network = value.to_string(),
                _ => {
                    let Some(number) = parse_u32_value(value, key) else {
                        continue;
                    };
                    match key {
                        ENV_SESSION_TIMEOUT => self.session.timeout_minutes = number,
                        ENV_FREE_ATTEMPTS => self.session.free_attempts = number,
                        _ => self.backups.keep = number,
                    }
                }
            }
            log::debug!("Loaded configuration override from {}", key);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigEnvelope {
    version: u16,
    checksum: String,
    payload: VaultConfig,
    modified_at_unix: i64,
}

/// Handles persistence of vault configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_paths(paths: &VaultPaths) -> Self {
        Self {
            path: paths.config_file().to_path_buf(),
        }
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the stored config, writing defaults on first use.
    pub fn load_or_default(&self) -> WalletResult<VaultConfig> {
        if !self.path.exists() {
            let config = VaultConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != CONFIG_VERSION {
            return Err(WalletError::ValidationError(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(WalletError::ValidationError(
                "Config integrity verification failed".to_string(),
            ));
        }

        Ok(envelope.payload)
    }

    /// Like `load_or_default`, but a config that cannot be read or does not
    /// verify yields the defaults instead of an error. The file is left as is
    /// until the next save.
    pub fn load_or_fallback(&self) -> VaultConfig {
        match self.load_or_default() {
            Ok(config) => config,
            Err(err) => {
                log::warn!(
                    "Config at {} is unusable, falling back to defaults: {}",
                    self.path.display(),
                    err
                );
                VaultConfig::default()
            }
        }
    }

    pub fn save(&self, config: &VaultConfig) -> WalletResult<()> {
        let mut payload = config.clone();
        payload.touch();

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(&payload)?,
            modified_at_unix: Utc::now().timestamp(),
            payload,
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(&self.path, &serialized)
    }

    pub fn update<F>(&self, updater: F) -> WalletResult<VaultConfig>
    where
        F: FnOnce(&mut VaultConfig) -> WalletResult<()>,
    {
        let mut config = self.load_or_fallback();
        updater(&mut config)?;
        config.touch();
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &VaultConfig) -> WalletResult<String> {
    let mut hasher = Blake3::new();
    hasher.update(&serde_json::to_vec(config)?);
    Ok(hasher.finalize().to_hex().to_string())
}

fn parse_u32_value(value: &str, key: &str) -> Option<u32> {
    match value.parse::<u32>() {
        Ok(number) => Some(number),
        Err(_) => {
            log::warn!(
                "Environment variable {} has invalid numeric value '{}', ignoring",
                key,
                value
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn first_load_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("config.json"));

        let config = store.load_or_default().unwrap();
        assert_eq!(config.session.timeout_minutes, 15);
        assert_eq!(config.defaults.chain_type, "ed25519");
        assert!(store.path().exists());
    }

    #[test]
    fn save_and_load_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("config.json"));

        let mut config = VaultConfig::default();
        config.defaults.network = "devnet".into();
        config
            .extra
            .insert("theme".into(), serde_json::Value::String("dark".into()));
        store.save(&config).unwrap();

        let loaded = store.load_or_default().unwrap();
        assert_eq!(loaded.defaults.network, "devnet");
        assert_eq!(loaded.extra["theme"], "dark");
    }

    #[test]
    fn update_persists_changes() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("config.json"));
        store
            .update(|config| {
                config.backups.keep = 2;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.load_or_default().unwrap().backups.keep, 2);
    }

    #[test]
    fn tampered_config_detected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        let store = ConfigStore::new(&path);
        store.save(&VaultConfig::default()).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("mainnet", "testnet")).unwrap();

        let result = store.load_or_default();
        assert!(matches!(result, Err(WalletError::ValidationError(_))));
    }

    #[test]
    fn overrides_apply_and_skip_bad_values() {
        let vars: HashMap<&str, &str> = [
            (ENV_SESSION_TIMEOUT, "5"),
            (ENV_DEFAULT_NETWORK, "testnet"),
            (ENV_DEFAULT_CHAIN, "  "),
            (ENV_BACKUP_KEEP, "1\n"),
        ]
        .into_iter()
        .collect();

        let mut config = VaultConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.session.timeout_minutes, 5);
        assert_eq!(config.defaults.network, "testnet");
        assert_eq!(config.defaults.chain_type, "ed25519");
        assert_eq!(config.backups.keep, 5);
    }

    #[test]
    fn non_numeric_override_is_ignored() {
        let mut config = VaultConfig::default();
        config.apply_overrides(|key| match key {
            ENV_FREE_ATTEMPTS => Some("many".to_string()),
            ENV_SESSION_TIMEOUT => Some("30".to_string()),
            _ => None,
        });
        assert_eq!(config.session.free_attempts, 3);
        assert_eq!(config.session.timeout_minutes, 30);
    }

    #[test]
    fn unusable_config_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        let store = ConfigStore::new(&path);
        let mut config = VaultConfig::default();
        config.backups.keep = 9;
        store.save(&config).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\"keep\": 9", "\"keep\": 1")).unwrap();
        assert!(store.load_or_default().is_err());
        assert_eq!(store.load_or_fallback().backups.keep, 5);
        assert!(fs::read_to_string(&path).unwrap().contains("\"keep\": 1"));

        let repaired = store
            .update(|config| {
                config.defaults.network = "devnet".into();
                Ok(())
            })
            .unwrap();
        assert_eq!(repaired.backups.keep, 5);
        assert_eq!(store.load_or_default().unwrap().defaults.network, "devnet");

        fs::write(&path, b"{ not json").unwrap();
        assert_eq!(store.load_or_fallback().session, SessionConfig::default());
    }
}
