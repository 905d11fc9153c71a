use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config_store::SessionConfig;
use crate::crypto::{Envelope, KdfParameters};
use crate::errors::{WalletError, WalletResult};
use crate::storage::atomic::write_atomic;
use crate::storage::VaultPaths;
use crate::validation::validate_password;

/// Default duration before an unlocked vault automatically locks.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const MAX_BACKOFF_EXPONENT: u32 = 8;

/// Persisted master password verifier (`auth.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MasterCredential {
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Envelope work factor used for every record of this vault.
    #[serde(default)]
    pub kdf: KdfParameters,
}

/// Persisted proof of a recent unlock (`.session`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub authenticated: bool,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    fn issue(timeout: Duration) -> WalletResult<Self> {
        let now = Utc::now();
        Ok(Self {
            authenticated: true,
            timestamp: now,
            expires_at: now + chrono_timeout(timeout)?,
        })
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.authenticated && now <= self.expires_at
    }
}

/// Failed-unlock bookkeeping (`.throttle`). Kept on disk so restarting the
/// process does not reset the backoff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleState {
    pub failed_attempts: u32,
    pub backoff_exponent: u32,
    pub next_allowed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Uninitialized,
    Locked,
    Unlocked,
}

/// Backoff applied to repeated failed unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub free_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for ThrottlePolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            free_attempts: config.free_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

/// Owns the master credential and the time-bounded session.
///
/// The password itself is kept in memory only while unlocked; it is what
/// the record store seals and opens with.
#[derive(Debug)]
pub struct SessionGate {
    auth_path: PathBuf,
    session_path: PathBuf,
    throttle_path: PathBuf,
    timeout: Duration,
    throttle: ThrottlePolicy,
    credential: Option<MasterCredential>,
    session: Option<SessionRecord>,
    password: Option<SecretString>,
    attempts: ThrottleState,
}

impl SessionGate {
    /// Load the credential if one exists. A process always starts locked:
    /// a surviving `.session` proves a recent unlock but carries no key.
    pub fn open(paths: &VaultPaths, timeout: Duration, throttle: ThrottlePolicy) -> WalletResult<Self> {
        let credential = match fs::read(paths.auth_file()) {
            Ok(bytes) => Some(serde_json::from_slice::<MasterCredential>(&bytes).map_err(|e| {
                WalletError::StorageError(format!("Credential file unreadable: {e}"))
            })?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let mut gate = Self {
            auth_path: paths.auth_file().to_path_buf(),
            session_path: paths.session_file().to_path_buf(),
            throttle_path: paths.throttle_file().to_path_buf(),
            timeout,
            throttle,
            credential,
            session: None,
            password: None,
            attempts: ThrottleState::default(),
        };
        gate.attempts = gate.read_throttle_file();

        if let Some(stale) = gate.read_session_file() {
            if !stale.is_live(Utc::now()) {
                gate.remove_session_file();
            }
        }

        Ok(gate)
    }

    pub fn has_password(&self) -> bool {
        self.credential.is_some()
    }

    pub fn credential(&self) -> Option<&MasterCredential> {
        self.credential.as_ref()
    }

    /// Envelope configured with this vault's work factor.
    pub fn envelope(&self) -> Option<Envelope> {
        self.credential.as_ref().map(|c| Envelope::new(c.kdf))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Pure state query. No I/O.
    pub fn state(&self) -> GateState {
        if self.credential.is_none() {
            return GateState::Uninitialized;
        }
        match (&self.session, &self.password) {
            (Some(session), Some(_)) if session.is_live(Utc::now()) => GateState::Unlocked,
            _ => GateState::Locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state() != GateState::Unlocked
    }

    /// Create the master credential and open a session.
    pub fn set_password(&mut self, password: &SecretString, kdf: KdfParameters) -> WalletResult<()> {
        if self.credential.is_some() {
            return Err(WalletError::AlreadyInitialized);
        }
        validate_password(password.expose_secret())?;

        let envelope = Envelope::new(kdf);
        let now = Utc::now();
        let credential = MasterCredential {
            password_hash: envelope.hash_password(password)?,
            created_at: now,
            updated_at: now,
            kdf,
        };
        self.persist_credential(&credential)?;
        self.credential = Some(credential);
        log::info!("Master password set");

        self.issue_session(password)
    }

    /// Verify `password` and open a session. Returns `false` on a wrong
    /// password without saying anything else.
    pub fn unlock(&mut self, password: &SecretString) -> WalletResult<bool> {
        if self.credential.is_none() {
            return Err(WalletError::NotInitialized);
        }
        self.ensure_attempt_allowed()?;

        if !self.verify(password)? {
            self.register_failed_attempt();
            log::warn!("Unlock attempt rejected");
            return Ok(false);
        }

        if self.attempts != ThrottleState::default() {
            self.attempts = ThrottleState::default();
            self.remove_throttle_file();
        }
        self.issue_session(password)?;
        log::info!("Vault unlocked");
        Ok(true)
    }

    /// Check `password` against the credential without touching state.
    pub fn verify(&self, password: &SecretString) -> WalletResult<bool> {
        let credential = self.credential.as_ref().ok_or(WalletError::NotInitialized)?;
        Ok(Envelope::new(credential.kdf).verify_password(password, &credential.password_hash))
    }

    /// Re-hash under `new_password` and re-issue the session. The caller has
    /// already verified the old password and re-sealed the records.
    pub fn replace_password(&mut self, new_password: &SecretString) -> WalletResult<()> {
        let credential = self.credential.as_ref().ok_or(WalletError::NotInitialized)?;
        validate_password(new_password.expose_secret())?;

        let mut updated = credential.clone();
        updated.password_hash = Envelope::new(updated.kdf).hash_password(new_password)?;
        updated.updated_at = Utc::now();
        self.persist_credential(&updated)?;
        self.credential = Some(updated);
        log::info!("Master password changed");

        self.issue_session(new_password)
    }

    /// Destroy the session unconditionally. Idempotent.
    pub fn lock(&mut self) {
        let was_unlocked = self.session.is_some();
        self.session = None;
        self.password = None;
        self.remove_session_file();
        if was_unlocked {
            log::info!("Vault locked");
        }
    }

    /// Liveness check: re-read `.session`, lock if it is gone or expired,
    /// otherwise slide the expiry forward.
    pub fn check_session(&mut self) -> WalletResult<()> {
        if self.password.is_none() || self.session.is_none() {
            return Err(WalletError::Locked);
        }

        let now = Utc::now();
        let persisted_live = self
            .read_session_file()
            .map(|record| record.is_live(now))
            .unwrap_or(false);
        let memory_live = self
            .session
            .as_ref()
            .map(|record| record.is_live(now))
            .unwrap_or(false);

        if !(persisted_live && memory_live) {
            log::info!("Session expired");
            self.lock();
            return Err(WalletError::Locked);
        }

        let mut session = SessionRecord::issue(self.timeout)?;
        if let Some(current) = &self.session {
            session.timestamp = current.timestamp;
        }
        self.write_session_file(&session)?;
        self.session = Some(session);
        Ok(())
    }

    /// The in-memory password, provided the session is live. Pure.
    pub fn password(&self) -> WalletResult<&SecretString> {
        if self.is_locked() {
            return Err(WalletError::Locked);
        }
        self.password.as_ref().ok_or(WalletError::Locked)
    }

    pub fn session(&self) -> Option<&SessionRecord> {
        self.session.as_ref()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.attempts.failed_attempts
    }

    fn issue_session(&mut self, password: &SecretString) -> WalletResult<()> {
        let session = SessionRecord::issue(self.timeout)?;
        self.write_session_file(&session)?;
        self.session = Some(session);
        self.password = Some(SecretString::from(
            password.expose_secret().to_string(),
        ));
        Ok(())
    }

    fn ensure_attempt_allowed(&self) -> WalletResult<()> {
        if let Some(until) = self.attempts.next_allowed_at {
            let now = Utc::now();
            if now < until {
                let remaining = (until - now).to_std().unwrap_or_default();
                return Err(WalletError::PermissionDenied(format!(
                    "Unlock temporarily disabled. Retry in {}.{:03} seconds",
                    remaining.as_secs(),
                    remaining.subsec_millis()
                )));
            }
        }
        Ok(())
    }

    fn register_failed_attempt(&mut self) {
        let attempts = &mut self.attempts;
        attempts.failed_attempts = attempts.failed_attempts.saturating_add(1);
        if attempts.failed_attempts > self.throttle.free_attempts {
            attempts.backoff_exponent = (attempts.backoff_exponent + 1).min(MAX_BACKOFF_EXPONENT);
            let multiplier = 1_u32 << attempts.backoff_exponent.saturating_sub(1);
            let delay = self
                .throttle
                .backoff_base
                .checked_mul(multiplier)
                .unwrap_or(self.throttle.backoff_cap)
                .min(self.throttle.backoff_cap);
            attempts.next_allowed_at = Some(deadline_after(Utc::now(), delay));
        }

        if let Err(err) = self.write_throttle_file() {
            log::warn!("Failed to persist unlock backoff: {}", err);
        }
    }

    /// Load the persisted backoff. A deadline further out than the current
    /// cap allows (clock changes, a lowered cap) is pulled back to it.
    fn read_throttle_file(&self) -> ThrottleState {
        let bytes = match fs::read(&self.throttle_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ThrottleState::default()
            }
            Err(err) => {
                log::warn!("Throttle file unreadable, starting fresh: {}", err);
                return ThrottleState::default();
            }
        };

        let mut state: ThrottleState = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(err) => {
                log::warn!("Throttle file corrupt, starting fresh: {}", err);
                return ThrottleState::default();
            }
        };
        let latest = deadline_after(Utc::now(), self.throttle.backoff_cap);
        if let Some(until) = state.next_allowed_at {
            if until > latest {
                state.next_allowed_at = Some(latest);
            }
        }
        state
    }

    fn write_throttle_file(&self) -> WalletResult<()> {
        let serialized = serde_json::to_vec(&self.attempts)?;
        write_atomic(&self.throttle_path, &serialized)
    }

    fn remove_throttle_file(&self) {
        match fs::remove_file(&self.throttle_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("Failed to remove throttle file: {}", err),
        }
    }

    fn persist_credential(&self, credential: &MasterCredential) -> WalletResult<()> {
        let serialized = serde_json::to_vec_pretty(credential)?;
        write_atomic(&self.auth_path, &serialized)
    }

    fn read_session_file(&self) -> Option<SessionRecord> {
        let bytes = fs::read(&self.session_path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                log::warn!("Session file unreadable, treating as absent: {}", err);
                None
            }
        }
    }

    fn write_session_file(&self, session: &SessionRecord) -> WalletResult<()> {
        let serialized = serde_json::to_vec(session)?;
        write_atomic(&self.session_path, &serialized)
    }

    fn remove_session_file(&self) {
        match fs::remove_file(&self.session_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("Failed to remove session file: {}", err),
        }
    }
}

fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn chrono_timeout(timeout: Duration) -> WalletResult<chrono::Duration> {
    chrono::Duration::from_std(timeout)
        .map_err(|e| WalletError::ValidationError(format!("Session timeout out of range: {e}")))
}
