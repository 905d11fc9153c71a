use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};

use crate::chain::ChainAdapters;
use crate::config_store::{ConfigStore, VaultConfig};
use crate::crypto::Envelope;
use crate::errors::{WalletError, WalletResult};
use crate::registry::{
    RehydrationReport, SeedGroupId, SeedGroupSummary, WalletId, WalletListing, WalletOptions,
    WalletRegistry, WalletSummary,
};
use crate::session::{GateState, SessionGate, ThrottlePolicy};
use crate::storage::{MetadataMap, RecordId, RecordStore, VaultPaths};
use crate::validation::{self, validate_password};

/// Everything one vault directory needs: credential gate, encrypted
/// records, and the registry rebuilt from them while unlocked.
#[derive(Debug)]
pub struct VaultContext {
    paths: VaultPaths,
    config_store: ConfigStore,
    config: VaultConfig,
    gate: SessionGate,
    store: RecordStore,
    registry: WalletRegistry,
    last_rehydration: Option<RehydrationReport>,
}

impl VaultContext {
    pub fn open(root_dir: impl AsRef<Path>, adapters: ChainAdapters) -> WalletResult<Self> {
        let paths = VaultPaths::new(root_dir)?;
        paths.ensure_directories()?;

        let config_store = ConfigStore::from_paths(&paths);
        let mut config = config_store.load_or_fallback();
        config.apply_env_overrides();

        let gate = SessionGate::open(
            &paths,
            config.session.timeout(),
            ThrottlePolicy::from(&config.session),
        )?;
        let envelope = gate
            .envelope()
            .unwrap_or_else(|| Envelope::new(config.kdf));
        let store = RecordStore::new(&paths, envelope);

        log::info!("Opened vault at {}", paths.root_dir().display());
        Ok(Self {
            paths,
            config_store,
            config,
            gate,
            store,
            registry: WalletRegistry::new(adapters),
            last_rehydration: None,
        })
    }

    /// `open` with the built-in chain adapters.
    pub fn open_default(root_dir: impl AsRef<Path>) -> WalletResult<Self> {
        Self::open(root_dir, ChainAdapters::with_defaults())
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config_store
    }

    pub fn update_config<F>(&mut self, updater: F) -> WalletResult<VaultConfig>
    where
        F: FnOnce(&mut VaultConfig) -> WalletResult<()>,
    {
        let mut updated = self.config_store.update(updater)?;
        updated.apply_env_overrides();
        self.gate.set_timeout(updated.session.timeout());
        self.config = updated.clone();
        Ok(updated)
    }

    pub fn set_session_timeout(&mut self, minutes: u32) -> WalletResult<()> {
        if minutes == 0 {
            return Err(WalletError::ValidationError(
                "Session timeout must be at least one minute".to_string(),
            ));
        }
        self.update_config(|config| {
            config.session.timeout_minutes = minutes;
            Ok(())
        })?;
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        self.gate.timeout()
    }

    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    pub fn has_password(&self) -> bool {
        self.gate.has_password()
    }

    pub fn password_policy(&self) -> String {
        validation::password_policy()
    }

    /// Pure state query.
    pub fn is_locked(&self) -> bool {
        self.gate.is_locked()
    }

    /// Create the master credential. The vault is left unlocked.
    pub fn set_password(&mut self, password: &SecretString) -> WalletResult<()> {
        self.gate.set_password(password, self.config.kdf)?;
        self.store.set_envelope(Envelope::new(self.config.kdf));
        self.rehydrate(password)
    }

    /// Returns `false` for a wrong password. On success the registry is
    /// rebuilt from disk.
    pub fn unlock(&mut self, password: &SecretString) -> WalletResult<bool> {
        if !self.gate.unlock(password)? {
            return Ok(false);
        }
        if let Some(envelope) = self.gate.envelope() {
            self.store.set_envelope(envelope);
        }

        if let Err(err) = self.rehydrate(password) {
            self.lock();
            return Err(err);
        }
        Ok(true)
    }

    /// Rotate the master password and re-seal every record under it.
    /// `wallets/` is snapshotted into `backups/` first.
    pub fn change_password(&mut self, old: &SecretString, new: &SecretString) -> WalletResult<()> {
        self.check_session()?;
        if !self.gate.verify(old)? {
            return Err(WalletError::AuthenticationFailed);
        }
        validate_password(new.expose_secret())?;

        let snapshot = self.paths.snapshot_records()?;
        let resealed = match self.store.reseal_all(old, new) {
            Ok(resealed) => resealed,
            Err(err) => {
                self.restore_snapshot(&snapshot);
                return Err(err);
            }
        };

        if let Err(err) = self.gate.replace_password(new) {
            log::error!("Credential update failed, restoring records sealed under the old password");
            if let Err(rollback) = self.store.reseal_all(new, old) {
                log::error!("Re-sealing back failed: {}", rollback);
                self.restore_snapshot(&snapshot);
            }
            return Err(err);
        }

        let keep = self.config.backups.keep as usize;
        match self.paths.prune_old_backups(keep) {
            Ok(0) => {}
            Ok(pruned) => log::debug!("Pruned {} old backups", pruned),
            Err(err) => log::warn!("Failed to prune old backups: {}", err),
        }

        log::info!("Password changed, {} records re-sealed", resealed);
        Ok(())
    }

    /// Destroy the session and every secret held in memory. Idempotent.
    pub fn lock(&mut self) {
        self.gate.lock();
        self.registry.clear();
        self.last_rehydration = None;
    }

    /// Liveness check run before every operation that needs the password.
    /// Slides the session forward, or locks once it has expired.
    pub fn check_session(&mut self) -> WalletResult<()> {
        match self.gate.check_session() {
            Err(WalletError::Locked) => {
                self.registry.clear();
                self.last_rehydration = None;
                Err(WalletError::Locked)
            }
            other => other,
        }
    }

    pub fn last_rehydration(&self) -> Option<&RehydrationReport> {
        self.last_rehydration.as_ref()
    }

    /// Display listing from `wallets.json`. Available while locked.
    pub fn metadata_listing(&self) -> MetadataMap {
        self.store.get_all_metadata()
    }

    pub fn create_standalone(&mut self, options: WalletOptions) -> WalletResult<WalletId> {
        self.check_session()?;
        let profile = options.resolve(&self.config.defaults)?;
        let password = self.gate.password()?;
        self.registry
            .create_standalone(&self.store, password, &profile, None)
    }

    pub fn import_standalone(
        &mut self,
        private_key: &SecretString,
        options: WalletOptions,
    ) -> WalletResult<WalletId> {
        self.check_session()?;
        let profile = options.resolve(&self.config.defaults)?;
        let password = self.gate.password()?;
        self.registry
            .import_standalone(&self.store, password, &profile, private_key)
    }

    /// Create a seed group from `options.mnemonic`, or a fresh one, and
    /// derive its first wallet.
    pub fn create_seed_group(&mut self, options: WalletOptions) -> WalletResult<SeedGroupId> {
        self.check_session()?;
        let profile = options.resolve(&self.config.defaults)?;
        let password = self.gate.password()?;
        self.registry.create_seed_group(
            &self.store,
            password,
            &profile,
            options.mnemonic.as_ref(),
        )
    }

    pub fn derive_next(&mut self, group: &SeedGroupId) -> WalletResult<WalletId> {
        self.check_session()?;
        let password = self.gate.password()?;
        self.registry.derive_next(&self.store, password, group)
    }

    pub fn list_wallets(&mut self) -> WalletResult<WalletListing> {
        self.check_session()?;
        Ok(self.registry.list())
    }

    /// Flat list of every wallet, standalone and derived.
    pub fn wallets(&mut self) -> WalletResult<Vec<WalletSummary>> {
        self.check_session()?;
        Ok(self.registry.wallets())
    }

    pub fn get_wallet(&mut self, id: &WalletId) -> WalletResult<WalletSummary> {
        self.check_session()?;
        self.registry.get(id)
    }

    pub fn get_seed_group(&mut self, id: &SeedGroupId) -> WalletResult<SeedGroupSummary> {
        self.check_session()?;
        self.registry.seed_group(id)
    }

    pub fn active_wallet(&mut self) -> WalletResult<Option<WalletSummary>> {
        self.check_session()?;
        match self.registry.active() {
            Some(id) => self.registry.get(id).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_active(&mut self, id: &WalletId) -> WalletResult<()> {
        self.check_session()?;
        self.registry.set_active(id)
    }

    pub fn remove(&mut self, id: &RecordId) -> WalletResult<()> {
        self.check_session()?;
        self.registry.remove(&self.store, id)
    }

    pub fn rename(&mut self, id: &RecordId, name: &str) -> WalletResult<()> {
        self.check_session()?;
        let password = self.gate.password()?;
        self.registry.rename(&self.store, password, id, name)
    }

    pub fn export_private_key(&mut self, id: &WalletId) -> WalletResult<SecretString> {
        self.check_session()?;
        log::info!("Private key exported for {}", id);
        self.registry.export_private_key(id)
    }

    pub fn export_mnemonic(&mut self, group: &SeedGroupId) -> WalletResult<SecretString> {
        self.check_session()?;
        log::info!("Mnemonic exported for {}", group);
        self.registry.export_mnemonic(group)
    }

    pub fn sign_message(&mut self, id: &WalletId, message: &[u8]) -> WalletResult<String> {
        self.check_session()?;
        self.registry.sign_message(id, message)
    }

    /// Snapshots taken before password rotations, newest first.
    pub fn available_backups(&self) -> WalletResult<Vec<PathBuf>> {
        self.paths.list_backups()
    }

    /// Copy the records of `snapshot` back into `wallets/` and reload. Records
    /// sealed under an earlier password show up as rehydration failures.
    pub fn restore_backup(&mut self, snapshot: impl AsRef<Path>) -> WalletResult<RehydrationReport> {
        self.check_session()?;
        let restored = self.paths.restore_records(snapshot.as_ref())?;
        log::info!(
            "Restored {} records from {}",
            restored,
            snapshot.as_ref().display()
        );

        let password = self.gate.password()?.clone();
        self.rehydrate(&password)?;
        Ok(self.last_rehydration.clone().unwrap_or_default())
    }

    /// Best-effort return of every record to its pre-rotation content.
    fn restore_snapshot(&self, snapshot: &Path) {
        match self.paths.restore_records(snapshot) {
            Ok(restored) => log::warn!(
                "Restored {} records from {}",
                restored,
                snapshot.display()
            ),
            Err(err) => log::error!(
                "Records could not be restored from {}: {}",
                snapshot.display(),
                err
            ),
        }
    }

    fn rehydrate(&mut self, password: &SecretString) -> WalletResult<()> {
        let report = self.registry.rehydrate(&self.store, password)?;
        for failure in &report.failures {
            log::warn!("Record {} could not be loaded: {}", failure.id, failure.error);
        }
        self.last_rehydration = Some(report);
        Ok(())
    }
}

/// Shared vault context for callers on several threads or tasks.
#[derive(Clone)]
pub struct SharedVaultContext(pub Arc<RwLock<VaultContext>>);

impl SharedVaultContext {
    pub fn new(inner: VaultContext) -> Self {
        Self(Arc::new(RwLock::new(inner)))
    }

    pub fn read<F, T>(&self, op: F) -> WalletResult<T>
    where
        F: FnOnce(&VaultContext) -> WalletResult<T>,
    {
        let guard = self.0.read();
        op(&guard)
    }

    pub fn write<F, T>(&self, op: F) -> WalletResult<T>
    where
        F: FnOnce(&mut VaultContext) -> WalletResult<T>,
    {
        let mut guard = self.0.write();
        op(&mut guard)
    }

    /// Run `op` on the blocking pool. Key stretching and file I/O must not
    /// stall the async executor.
    pub async fn run_blocking<F, T>(&self, op: F) -> WalletResult<T>
    where
        F: FnOnce(&mut VaultContext) -> WalletResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.write();
            op(&mut guard)
        })
        .await
        .map_err(|e| WalletError::Unknown(format!("Vault task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::FAST_KDF;
    use crate::storage::atomic::staged_path;
    use tempfile::TempDir;

    const PASSWORD: &str = "Abcd1234!";

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn open(dir: &TempDir) -> VaultContext {
        let mut ctx = VaultContext::open_default(dir.path()).unwrap();
        ctx.config.kdf = FAST_KDF;
        ctx
    }

    fn initialized(dir: &TempDir) -> VaultContext {
        let mut ctx = open(dir);
        ctx.set_password(&secret(PASSWORD)).unwrap();
        ctx
    }

    #[test]
    fn operations_require_an_unlocked_vault() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open(&dir);
        assert_eq!(ctx.state(), GateState::Uninitialized);
        assert_eq!(
            ctx.create_standalone(WalletOptions::new()).unwrap_err(),
            WalletError::Locked
        );

        ctx.set_password(&secret(PASSWORD)).unwrap();
        assert!(!ctx.is_locked());
        ctx.lock();
        assert_eq!(ctx.list_wallets().unwrap_err(), WalletError::Locked);
        assert_eq!(ctx.state(), GateState::Locked);
    }

    #[test]
    fn metadata_listing_works_while_locked() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        let id = ctx
            .create_standalone(WalletOptions::new().with_name("Cold"))
            .unwrap();
        ctx.lock();

        let listing = ctx.metadata_listing();
        assert_eq!(listing[&id].name, "Cold");
        assert_eq!(listing[&id].chain_type, "ed25519");
    }

    #[test]
    fn lock_clears_registry_and_unlock_restores_it() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        let group = ctx.create_seed_group(WalletOptions::new()).unwrap();
        ctx.derive_next(&group).unwrap();
        let addresses = |summary: SeedGroupSummary| -> Vec<(Option<u32>, String)> {
            summary
                .wallets
                .into_iter()
                .map(|w| (w.derivation_index, w.address))
                .collect()
        };
        let before = addresses(ctx.get_seed_group(&group).unwrap());

        ctx.lock();
        assert!(ctx.registry.is_empty());
        assert!(!ctx.unlock(&secret("Wrong1234!")).unwrap());
        assert!(ctx.is_locked());

        assert!(ctx.unlock(&secret(PASSWORD)).unwrap());
        assert!(ctx.last_rehydration().unwrap().is_complete());
        assert_eq!(addresses(ctx.get_seed_group(&group).unwrap()), before);
    }

    #[test]
    fn change_password_reseals_records() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        let id = ctx.create_standalone(WalletOptions::new()).unwrap();
        let key = ctx.export_private_key(&id).unwrap();

        let new = secret("Efgh5678?");
        assert_eq!(
            ctx.change_password(&secret("Wrong1234!"), &new).unwrap_err(),
            WalletError::AuthenticationFailed
        );
        assert!(matches!(
            ctx.change_password(&secret(PASSWORD), &secret("weak")),
            Err(WalletError::WeakPassword(_))
        ));

        ctx.change_password(&secret(PASSWORD), &new).unwrap();
        assert_eq!(ctx.available_backups().unwrap().len(), 1);

        ctx.lock();
        assert!(!ctx.unlock(&secret(PASSWORD)).unwrap());
        assert!(ctx.unlock(&new).unwrap());
        assert!(ctx.last_rehydration().unwrap().is_complete());
        assert_eq!(
            ctx.export_private_key(&id).unwrap().expose_secret(),
            key.expose_secret()
        );
    }

    fn staged_leftovers(ctx: &VaultContext) -> usize {
        std::fs::read_dir(ctx.paths().records_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".new"))
            .count()
    }

    #[test]
    fn failed_credential_write_keeps_old_password() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        let id = ctx.create_standalone(WalletOptions::new()).unwrap();
        let group = ctx.create_seed_group(WalletOptions::new()).unwrap();

        // A directory where the staged credential would go makes the write fail.
        std::fs::create_dir(staged_path(ctx.paths().auth_file())).unwrap();
        assert!(ctx
            .change_password(&secret(PASSWORD), &secret("Efgh5678?"))
            .is_err());
        assert_eq!(staged_leftovers(&ctx), 0);

        ctx.lock();
        assert!(ctx.unlock(&secret(PASSWORD)).unwrap());
        assert!(ctx.last_rehydration().unwrap().is_complete());
        assert!(ctx.get_wallet(&id).is_ok());
        assert!(ctx.get_seed_group(&group).is_ok());
    }

    #[test]
    fn failed_reseal_leaves_records_under_old_password() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        let id = ctx.create_standalone(WalletOptions::new()).unwrap();
        let foreign = RecordId::parse("foreign").unwrap();
        ctx.store
            .put(&foreign, &serde_json::json!({ "note": "x" }), &secret("Other1234!"))
            .unwrap();

        assert_eq!(
            ctx.change_password(&secret(PASSWORD), &secret("Efgh5678?"))
                .unwrap_err(),
            WalletError::AuthenticationFailed
        );
        assert_eq!(staged_leftovers(&ctx), 0);

        ctx.lock();
        assert!(ctx.unlock(&secret(PASSWORD)).unwrap());
        assert!(ctx.get_wallet(&id).is_ok());
        let report = ctx.last_rehydration().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, foreign);
        let untouched: serde_json::Value =
            ctx.store.get(&foreign, &secret("Other1234!")).unwrap();
        assert_eq!(untouched["note"], "x");
    }

    #[test]
    fn restore_backup_brings_back_removed_wallets() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        let id = ctx.create_standalone(WalletOptions::new()).unwrap();
        let snapshot = ctx.paths().snapshot_records().unwrap();

        ctx.remove(&id).unwrap();
        assert!(ctx.get_wallet(&id).is_err());

        let report = ctx.restore_backup(&snapshot).unwrap();
        assert_eq!(report.loaded, vec![id.clone()]);
        assert!(ctx.get_wallet(&id).is_ok());

        assert!(matches!(
            ctx.restore_backup(dir.path().join("backups").join("records_missing")),
            Err(WalletError::NotFound(_))
        ));
        ctx.lock();
        assert_eq!(
            ctx.restore_backup(&snapshot).unwrap_err(),
            WalletError::Locked
        );
    }

    #[test]
    fn session_timeout_is_configurable() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        assert!(ctx.set_session_timeout(0).is_err());
        ctx.set_session_timeout(5).unwrap();
        assert_eq!(ctx.session_timeout(), Duration::from_secs(300));
        assert_eq!(
            ctx.config_store().load_or_default().unwrap().session.timeout_minutes,
            5
        );
    }

    #[test]
    fn active_wallet_follows_removals() {
        let dir = TempDir::new().unwrap();
        let mut ctx = initialized(&dir);
        assert!(ctx.active_wallet().unwrap().is_none());

        let first = ctx.create_standalone(WalletOptions::new()).unwrap();
        let second = ctx.create_standalone(WalletOptions::new()).unwrap();
        assert_eq!(ctx.active_wallet().unwrap().unwrap().id, first);

        ctx.set_active(&second).unwrap();
        ctx.remove(&second).unwrap();
        assert_eq!(ctx.active_wallet().unwrap().unwrap().id, first);
        ctx.remove(&first).unwrap();
        assert!(ctx.active_wallet().unwrap().is_none());
    }

    #[tokio::test]
    async fn shared_context_runs_blocking_work() {
        let dir = TempDir::new().unwrap();
        let shared = SharedVaultContext::new(initialized(&dir));

        let id = shared
            .run_blocking(|ctx| ctx.create_standalone(WalletOptions::new()))
            .await
            .unwrap();
        let listed = shared.write(|ctx| ctx.wallets()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(shared.read(|ctx| Ok(ctx.has_password())).unwrap());
    }
}
