use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::atomic::{self, write_atomic};
use super::metadata::{MetadataIndex, MetadataMap, RecordMetadata};
use super::paths::{is_record_file, VaultPaths};
use crate::crypto::Envelope;
use crate::errors::{WalletError, WalletResult};

const MAX_RECORD_ID_LEN: usize = 160;

/// Stable, non-secret name of an encrypted record. Restricted to
/// `[a-z0-9_-]` so it can be used verbatim as a file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Accept an identifier that is already in canonical form.
    pub fn parse(raw: &str) -> WalletResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_RECORD_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(WalletError::ValidationError(format!(
                "Invalid record identifier '{raw}'"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Canonicalize arbitrary public data into an identifier: lower-cased,
    /// anything outside `[a-z0-9_-]` replaced by `_`.
    pub fn canonical(raw: &str) -> WalletResult<Self> {
        let canonical: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self::parse(&canonical)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordId {
    type Error = WalletError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

/// One encrypted file per record under `wallets/`, plus the plaintext
/// metadata index kept alongside.
#[derive(Debug)]
pub struct RecordStore {
    paths: VaultPaths,
    envelope: Envelope,
    index: MetadataIndex,
}

impl RecordStore {
    pub fn new(paths: &VaultPaths, envelope: Envelope) -> Self {
        Self {
            index: MetadataIndex::new(paths.metadata_file()),
            paths: paths.clone(),
            envelope,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn set_envelope(&mut self, envelope: Envelope) {
        self.envelope = envelope;
    }

    pub fn exists(&self, id: &RecordId) -> bool {
        self.paths.record_file(id.as_str()).is_file()
    }

    /// Seal `payload` under `password` and atomically replace the record file.
    pub fn put<T: Serialize>(
        &self,
        id: &RecordId,
        payload: &T,
        password: &SecretString,
    ) -> WalletResult<()> {
        let encoded = self.seal_payload(payload, password)?;
        write_atomic(&self.paths.record_file(id.as_str()), encoded.as_bytes())?;
        log::debug!("Stored record {}", id);
        Ok(())
    }

    /// `put` followed by a metadata index update. Only the record write can
    /// fail; the index is rebuilt on the next rehydration if its update does.
    pub fn put_with_metadata<T: Serialize>(
        &self,
        id: &RecordId,
        payload: &T,
        metadata: RecordMetadata,
        password: &SecretString,
    ) -> WalletResult<()> {
        self.put(id, payload, password)?;
        if let Err(err) = self.save_metadata(id, metadata) {
            log::warn!("Metadata index not updated for {}: {}", id, err);
        }
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, id: &RecordId, password: &SecretString) -> WalletResult<T> {
        let path = self.paths.record_file(id.as_str());
        let encoded = match fs::read_to_string(&path) {
            Ok(encoded) => Zeroizing::new(encoded),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(WalletError::RecordNotFound(id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let plaintext = self.open_encoded(&encoded, password)?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            WalletError::StorageError(format!("Record {} has an unexpected layout: {}", id, e))
        })
    }

    pub fn delete(&self, id: &RecordId) -> WalletResult<()> {
        let path = self.paths.record_file(id.as_str());
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Drop a stale listing entry even though the record is gone.
                self.forget_metadata(id);
                return Err(WalletError::RecordNotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        self.forget_metadata(id);
        log::debug!("Deleted record {}", id);
        Ok(())
    }

    fn forget_metadata(&self, id: &RecordId) {
        if let Err(err) = self.index.remove(id) {
            log::warn!("Metadata index entry for {} not removed: {}", id, err);
        }
    }

    /// Enumerate record identifiers. Needs no password.
    pub fn list(&self) -> WalletResult<Vec<RecordId>> {
        let dir = self.paths.records_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !is_record_file(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match RecordId::parse(stem) {
                Ok(id) => ids.push(id),
                Err(_) => log::warn!("Ignoring foreign file {}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn save_metadata(&self, id: &RecordId, metadata: RecordMetadata) -> WalletResult<()> {
        self.index.save(id, metadata)
    }

    pub fn get_metadata(&self, id: &RecordId) -> Option<RecordMetadata> {
        self.index.get(id)
    }

    pub fn get_all_metadata(&self) -> MetadataMap {
        self.index.get_all()
    }

    /// Drop index entries whose record file no longer exists.
    pub fn prune_metadata(&self) -> WalletResult<usize> {
        let ids = self.list()?;
        let mut pruned = 0;
        self.index.update(|entries| {
            let before = entries.len();
            entries.retain(|id, _| ids.binary_search(id).is_ok());
            pruned = before - entries.len();
        })?;
        Ok(pruned)
    }

    /// Re-seal every record from `old` to `new`. All new blobs are staged
    /// first; nothing is replaced unless every record re-sealed. If a commit
    /// fails, records already replaced are written back with their previous
    /// content.
    pub fn reseal_all(&self, old: &SecretString, new: &SecretString) -> WalletResult<usize> {
        self.reseal_all_with(old, new, atomic::commit)
    }

    fn reseal_all_with<F>(
        &self,
        old: &SecretString,
        new: &SecretString,
        mut commit: F,
    ) -> WalletResult<usize>
    where
        F: FnMut(&Path, &Path) -> WalletResult<()>,
    {
        let ids = self.list()?;
        let mut staged: Vec<StagedRecord> = Vec::with_capacity(ids.len());

        for id in &ids {
            let path = self.paths.record_file(id.as_str());
            let result = fs::read_to_string(&path)
                .map_err(WalletError::from)
                .map(Zeroizing::new)
                .and_then(|original| {
                    let plaintext = self.open_encoded(&original, old)?;
                    let blob = self.envelope.seal(&plaintext, new)?;
                    let tmp = atomic::stage(&path, STANDARD.encode(blob).as_bytes())?;
                    Ok((tmp, original))
                });

            match result {
                Ok((tmp, original)) => staged.push(StagedRecord {
                    tmp,
                    path,
                    original,
                }),
                Err(err) => {
                    log::warn!("Re-sealing record {} failed, aborting rotation", id);
                    for record in &staged {
                        atomic::discard(&record.tmp);
                    }
                    return Err(err);
                }
            }
        }

        for (position, record) in staged.iter().enumerate() {
            if let Err(err) = commit(&record.tmp, &record.path) {
                log::warn!(
                    "Committing {} failed, reverting {} re-sealed record(s)",
                    record.path.display(),
                    position
                );
                for pending in &staged[position..] {
                    if pending.tmp.exists() {
                        atomic::discard(&pending.tmp);
                    }
                }
                revert(&staged[..position])?;
                return Err(err);
            }
        }
        Ok(staged.len())
    }

    fn seal_payload<T: Serialize>(
        &self,
        payload: &T,
        password: &SecretString,
    ) -> WalletResult<String> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let blob = self.envelope.seal(&plaintext, password)?;
        Ok(STANDARD.encode(blob))
    }

    fn open_encoded(&self, encoded: &str, password: &SecretString) -> WalletResult<Zeroizing<Vec<u8>>> {
        // Undecodable content is indistinguishable from tampering.
        let blob = STANDARD
            .decode(encoded.trim())
            .map_err(|_| WalletError::AuthenticationFailed)?;
        self.envelope.open(&blob, password)
    }
}

struct StagedRecord {
    tmp: PathBuf,
    path: PathBuf,
    original: Zeroizing<String>,
}

/// Put back the pre-rotation content of already committed records.
fn revert(committed: &[StagedRecord]) -> WalletResult<()> {
    let mut first_error = None;
    for record in committed {
        if let Err(err) = write_atomic(&record.path, record.original.as_bytes()) {
            log::error!("Could not revert {}: {}", record.path.display(), err);
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::FAST_KDF;
    use crate::storage::RecordKind;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        secret: String,
        count: u32,
    }

    fn secret(password: &str) -> SecretString {
        SecretString::from(password.to_string())
    }

    fn store() -> (TempDir, VaultPaths, RecordStore) {
        let dir = TempDir::new().unwrap();
        let paths = VaultPaths::new(dir.path()).unwrap();
        paths.ensure_directories().unwrap();
        let store = RecordStore::new(&paths, Envelope::new(FAST_KDF));
        (dir, paths, store)
    }

    fn id(raw: &str) -> RecordId {
        RecordId::parse(raw).unwrap()
    }

    fn payload() -> Payload {
        Payload {
            secret: "deadbeef".into(),
            count: 3,
        }
    }

    #[test]
    fn record_ids_are_canonical() {
        assert_eq!(
            RecordId::canonical("ED25519-0xAbC").unwrap().as_str(),
            "ed25519-0xabc"
        );
        assert_eq!(RecordId::canonical("a b/c").unwrap().as_str(), "a_b_c");
        assert!(RecordId::parse("Upper").is_err());
        assert!(RecordId::parse("../escape").is_err());
        assert!(RecordId::canonical("").is_err());
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, _paths, store) = store();
        store.put(&id("w1"), &payload(), &secret("pw")).unwrap();
        let loaded: Payload = store.get(&id("w1"), &secret("pw")).unwrap();
        assert_eq!(loaded, payload());
    }

    #[test]
    fn record_file_is_base64_and_hides_plaintext() {
        let (_dir, paths, store) = store();
        store.put(&id("w1"), &payload(), &secret("pw")).unwrap();

        let raw = fs::read_to_string(paths.record_file("w1")).unwrap();
        assert!(!raw.contains("deadbeef"));
        assert!(STANDARD.decode(raw.trim()).is_ok());
    }

    #[test]
    fn get_missing_record() {
        let (_dir, _paths, store) = store();
        let result: WalletResult<Payload> = store.get(&id("absent"), &secret("pw"));
        assert_eq!(result.unwrap_err(), WalletError::RecordNotFound("absent".into()));
    }

    #[test]
    fn wrong_password_and_corruption_fail_identically() {
        let (_dir, paths, store) = store();
        store.put(&id("w1"), &payload(), &secret("pw")).unwrap();

        let wrong: WalletResult<Payload> = store.get(&id("w1"), &secret("nope"));
        assert_eq!(wrong.unwrap_err(), WalletError::AuthenticationFailed);

        fs::write(paths.record_file("w1"), "!!not base64!!").unwrap();
        let corrupt: WalletResult<Payload> = store.get(&id("w1"), &secret("pw"));
        assert_eq!(corrupt.unwrap_err(), WalletError::AuthenticationFailed);
    }

    #[test]
    fn put_overwrites_existing_record() {
        let (_dir, _paths, store) = store();
        store.put(&id("w1"), &payload(), &secret("pw")).unwrap();
        let updated = Payload {
            secret: "cafebabe".into(),
            count: 4,
        };
        store.put(&id("w1"), &updated, &secret("pw")).unwrap();
        let loaded: Payload = store.get(&id("w1"), &secret("pw")).unwrap();
        assert_eq!(loaded, updated);
        assert_eq!(store.list().unwrap(), vec![id("w1")]);
    }

    #[test]
    fn delete_removes_file_and_metadata() {
        let (_dir, _paths, store) = store();
        store
            .put_with_metadata(
                &id("w1"),
                &payload(),
                RecordMetadata::new(RecordKind::Standalone, "One", "ed25519", "mainnet"),
                &secret("pw"),
            )
            .unwrap();
        assert!(store.get_metadata(&id("w1")).is_some());

        store.delete(&id("w1")).unwrap();
        assert!(!store.exists(&id("w1")));
        assert!(store.get_metadata(&id("w1")).is_none());
        assert_eq!(
            store.delete(&id("w1")).unwrap_err(),
            WalletError::RecordNotFound("w1".into())
        );
    }

    #[test]
    fn list_needs_no_password_and_skips_foreign_files() {
        let (_dir, paths, store) = store();
        store.put(&id("b"), &payload(), &secret("pw")).unwrap();
        store.put(&id("a"), &payload(), &secret("pw")).unwrap();
        fs::write(paths.records_dir().join("notes.txt"), b"x").unwrap();
        fs::write(paths.records_dir().join("Bad Name.enc"), b"x").unwrap();

        assert_eq!(store.list().unwrap(), vec![id("a"), id("b")]);
    }

    #[test]
    fn prune_metadata_drops_orphans() {
        let (_dir, _paths, store) = store();
        store
            .save_metadata(
                &id("ghost"),
                RecordMetadata::new(RecordKind::Standalone, "Ghost", "ed25519", "mainnet"),
            )
            .unwrap();
        assert_eq!(store.prune_metadata().unwrap(), 1);
        assert!(store.get_all_metadata().is_empty());
    }

    #[test]
    fn reseal_all_moves_every_record_to_new_password() {
        let (_dir, _paths, store) = store();
        store.put(&id("a"), &payload(), &secret("old")).unwrap();
        store.put(&id("b"), &payload(), &secret("old")).unwrap();

        assert_eq!(store.reseal_all(&secret("old"), &secret("new")).unwrap(), 2);

        for record in ["a", "b"] {
            let old: WalletResult<Payload> = store.get(&id(record), &secret("old"));
            assert_eq!(old.unwrap_err(), WalletError::AuthenticationFailed);
            let new: Payload = store.get(&id(record), &secret("new")).unwrap();
            assert_eq!(new, payload());
        }
    }

    #[test]
    fn reseal_all_is_all_or_nothing() {
        let (_dir, paths, store) = store();
        store.put(&id("a"), &payload(), &secret("old")).unwrap();
        store.put(&id("b"), &payload(), &secret("other")).unwrap();

        let err = store.reseal_all(&secret("old"), &secret("new")).unwrap_err();
        assert_eq!(err, WalletError::AuthenticationFailed);

        let untouched: Payload = store.get(&id("a"), &secret("old")).unwrap();
        assert_eq!(untouched, payload());
        let leftovers: Vec<_> = fs::read_dir(paths.records_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".new"))
            .collect();
        assert!(leftovers.is_empty());
    }

    fn staged_leftovers(paths: &VaultPaths) -> usize {
        fs::read_dir(paths.records_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".new"))
            .count()
    }

    #[test]
    fn failed_commit_reverts_records_already_replaced() {
        let (_dir, paths, store) = store();
        for record in ["a", "b", "c"] {
            store.put(&id(record), &payload(), &secret("old")).unwrap();
        }

        let mut commits = 0;
        let err = store
            .reseal_all_with(&secret("old"), &secret("new"), |tmp, path| {
                commits += 1;
                if commits == 2 {
                    return Err(WalletError::StorageError("disk full".into()));
                }
                atomic::commit(tmp, path)
            })
            .unwrap_err();
        assert_eq!(err, WalletError::StorageError("disk full".into()));

        for record in ["a", "b", "c"] {
            let loaded: Payload = store.get(&id(record), &secret("old")).unwrap();
            assert_eq!(loaded, payload());
        }
        assert_eq!(staged_leftovers(&paths), 0);
    }

    #[test]
    fn unwritable_index_does_not_fail_record_writes() {
        let (_dir, paths, store) = store();
        fs::create_dir(paths.metadata_file()).unwrap();

        store
            .put_with_metadata(
                &id("w1"),
                &payload(),
                RecordMetadata::new(RecordKind::Standalone, "One", "ed25519", "mainnet"),
                &secret("pw"),
            )
            .unwrap();
        let loaded: Payload = store.get(&id("w1"), &secret("pw")).unwrap();
        assert_eq!(loaded, payload());
        assert!(store.get_metadata(&id("w1")).is_none());

        store.delete(&id("w1")).unwrap();
        assert!(!store.exists(&id("w1")));
    }
}
