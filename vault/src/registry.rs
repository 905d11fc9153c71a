//! In-memory wallet graph rebuilt from encrypted records on every unlock.
//!
//! Standalone wallets and seed groups are persisted as records. Derived
//! wallets never are: a seed group stores its mnemonic and how many
//! children it has, and the children are re-derived on load.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chain::{normalize_mnemonic, ChainAdapter, ChainAdapters, KeyMaterial};
use crate::config_store::WalletDefaults;
use crate::errors::{WalletError, WalletResult};
use crate::storage::{RecordId, RecordKind, RecordMetadata, RecordStore};
use crate::validation::{validate_chain_tag, validate_wallet_name};

pub type WalletId = RecordId;
pub type SeedGroupId = RecordId;

const SEED_GROUP_PREFIX: &str = "seed-";
const SEED_FINGERPRINT_HEX_LEN: usize = 16;
const SEED_FINGERPRINT_CONTEXT: &str = "keyvault 2024-06-01 seed group fingerprint";

/// `lowercase("<chainType>-<address>")`, stable across restarts.
pub fn wallet_id(chain_type: &str, address: &str) -> WalletResult<WalletId> {
    RecordId::canonical(&format!("{chain_type}-{address}"))
}

/// One-way fingerprint of a mnemonic. Reveals none of its words.
pub fn seed_group_id(chain_type: &str, mnemonic: &SecretString) -> WalletResult<SeedGroupId> {
    let normalized = normalize_mnemonic(mnemonic);
    let mut hasher = blake3::Hasher::new_derive_key(SEED_FINGERPRINT_CONTEXT);
    hasher.update(chain_type.as_bytes());
    hasher.update(&[0]);
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize().to_hex();
    RecordId::parse(&format!(
        "{SEED_GROUP_PREFIX}{}",
        &digest.as_str()[..SEED_FINGERPRINT_HEX_LEN]
    ))
}

/// Caller-facing creation options. Unset fields fall back to the
/// configured defaults.
#[derive(Debug, Default)]
pub struct WalletOptions {
    pub chain_type: Option<String>,
    pub network: Option<String>,
    pub name: Option<String>,
    pub mnemonic: Option<SecretString>,
}

impl WalletOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain_type(mut self, chain_type: impl Into<String>) -> Self {
        self.chain_type = Some(chain_type.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mnemonic(mut self, mnemonic: SecretString) -> Self {
        self.mnemonic = Some(mnemonic);
        self
    }

    pub fn resolve(&self, defaults: &WalletDefaults) -> WalletResult<WalletProfile> {
        let chain_type = self
            .chain_type
            .clone()
            .unwrap_or_else(|| defaults.chain_type.clone());
        let network = self
            .network
            .clone()
            .unwrap_or_else(|| defaults.network.clone());
        validate_chain_tag("chain type", &chain_type)?;
        validate_chain_tag("network", &network)?;

        let name = match &self.name {
            Some(name) => {
                let name = name.trim();
                validate_wallet_name(name)?;
                Some(name.to_string())
            }
            None => None,
        };

        Ok(WalletProfile {
            chain_type,
            network,
            name,
        })
    }
}

/// Validated public attributes of a wallet being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletProfile {
    pub chain_type: String,
    pub network: String,
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum StoredRecord {
    Standalone(StandaloneRecord),
    SeedGroup(SeedGroupRecord),
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct StandaloneRecord {
    name: String,
    chain_type: String,
    network: String,
    address: String,
    public_key: String,
    private_key: String,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct SeedGroupRecord {
    name: String,
    chain_type: String,
    network: String,
    mnemonic: String,
    derived_count: u32,
    #[serde(default)]
    #[zeroize(skip)]
    child_names: BTreeMap<u32, String>,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

impl StoredRecord {
    fn metadata(&self) -> RecordMetadata {
        match self {
            Self::Standalone(r) => {
                RecordMetadata::new(RecordKind::Standalone, &r.name, &r.chain_type, &r.network)
            }
            Self::SeedGroup(r) => {
                RecordMetadata::new(RecordKind::SeedGroup, &r.name, &r.chain_type, &r.network)
            }
        }
    }
}

#[derive(Debug)]
pub struct StandaloneWallet {
    pub id: WalletId,
    pub name: String,
    pub chain_type: String,
    pub network: String,
    pub address: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    private_key: SecretString,
}

#[derive(Debug)]
pub struct DerivedWallet {
    pub id: WalletId,
    pub group: SeedGroupId,
    pub index: u32,
    pub name: String,
    pub chain_type: String,
    pub network: String,
    pub address: String,
    pub public_key: String,
    private_key: SecretString,
}

#[derive(Debug)]
pub struct SeedGroup {
    pub id: SeedGroupId,
    pub name: String,
    pub chain_type: String,
    pub network: String,
    pub created_at: DateTime<Utc>,
    derived_count: u32,
    children: BTreeMap<u32, WalletId>,
    child_names: BTreeMap<u32, String>,
    mnemonic: SecretString,
}

impl SeedGroup {
    /// Next index `derive_next` will use.
    pub fn derived_count(&self) -> u32 {
        self.derived_count
    }

    pub fn children(&self) -> impl Iterator<Item = (u32, &WalletId)> {
        self.children.iter().map(|(index, id)| (*index, id))
    }

    fn child_name(&self, index: u32) -> String {
        self.child_names
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("{} #{}", self.name, index))
    }

    fn to_record(&self, derived_count: u32) -> StoredRecord {
        StoredRecord::SeedGroup(SeedGroupRecord {
            name: self.name.clone(),
            chain_type: self.chain_type.clone(),
            network: self.network.clone(),
            mnemonic: self.mnemonic.expose_secret().to_string(),
            derived_count,
            child_names: self.child_names.clone(),
            created_at: self.created_at,
        })
    }
}

#[derive(Debug)]
enum WalletEntry {
    Standalone(StandaloneWallet),
    Derived(DerivedWallet),
}

impl WalletEntry {
    fn chain_type(&self) -> &str {
        match self {
            Self::Standalone(w) => &w.chain_type,
            Self::Derived(w) => &w.chain_type,
        }
    }

    fn private_key(&self) -> &SecretString {
        match self {
            Self::Standalone(w) => &w.private_key,
            Self::Derived(w) => &w.private_key,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WalletKind {
    Standalone,
    Derived,
}

/// Secret-free view of one wallet.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub id: WalletId,
    pub kind: WalletKind,
    pub name: String,
    pub chain_type: String,
    pub network: String,
    pub address: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_group: Option<SeedGroupId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_index: Option<u32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedGroupSummary {
    pub id: SeedGroupId,
    pub name: String,
    pub chain_type: String,
    pub network: String,
    pub derived_count: u32,
    pub created_at: DateTime<Utc>,
    pub wallets: Vec<WalletSummary>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalletListing {
    pub standalone: Vec<WalletSummary>,
    pub seed_groups: Vec<SeedGroupSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub id: RecordId,
    pub error: WalletError,
}

/// Outcome of rebuilding the registry from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehydrationReport {
    pub loaded: Vec<RecordId>,
    pub failures: Vec<RecordFailure>,
    pub metadata_repaired: usize,
    pub metadata_pruned: usize,
}

impl RehydrationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Wallets and seed groups of an unlocked vault, plus the active pointer.
#[derive(Debug)]
pub struct WalletRegistry {
    adapters: ChainAdapters,
    wallets: BTreeMap<WalletId, WalletEntry>,
    groups: BTreeMap<SeedGroupId, SeedGroup>,
    active: Option<WalletId>,
}

impl WalletRegistry {
    pub fn new(adapters: ChainAdapters) -> Self {
        Self {
            adapters,
            wallets: BTreeMap::new(),
            groups: BTreeMap::new(),
            active: None,
        }
    }

    pub fn adapters(&self) -> &ChainAdapters {
        &self.adapters
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub fn active(&self) -> Option<&WalletId> {
        self.active.as_ref()
    }

    /// Drop every wallet and secret held in memory.
    pub fn clear(&mut self) {
        self.wallets.clear();
        self.groups.clear();
        self.active = None;
    }

    /// Rebuild from every record in `store`. A record that fails to load is
    /// reported and skipped; the rest still load.
    pub fn rehydrate(
        &mut self,
        store: &RecordStore,
        password: &SecretString,
    ) -> WalletResult<RehydrationReport> {
        self.clear();
        let mut report = RehydrationReport::default();
        let indexed = store.get_all_metadata();

        for id in store.list()? {
            match self.load_record(store, &id, password) {
                Ok(metadata) => {
                    let stale = indexed.get(&id).map_or(true, |existing| {
                        existing.kind != metadata.kind
                            || existing.name != metadata.name
                            || existing.chain_type != metadata.chain_type
                            || existing.network != metadata.network
                    });
                    if stale {
                        match store.save_metadata(&id, metadata) {
                            Ok(()) => report.metadata_repaired += 1,
                            Err(err) => log::warn!("Could not repair metadata for {}: {}", id, err),
                        }
                    }
                    report.loaded.push(id);
                }
                Err(error) => {
                    log::warn!("Skipping record {}: {}", id, error);
                    report.failures.push(RecordFailure { id, error });
                }
            }
        }

        match store.prune_metadata() {
            Ok(pruned) => report.metadata_pruned = pruned,
            Err(err) => log::warn!("Could not prune metadata index: {}", err),
        }
        self.active = self.wallets.keys().next().cloned();

        log::info!(
            "Loaded {} records ({} wallets), {} failed",
            report.loaded.len(),
            self.wallets.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Persist a standalone wallet. Without key material a fresh key is
    /// generated by the chain adapter.
    pub fn create_standalone(
        &mut self,
        store: &RecordStore,
        password: &SecretString,
        profile: &WalletProfile,
        material: Option<KeyMaterial>,
    ) -> WalletResult<WalletId> {
        let adapter = self.adapters.get(&profile.chain_type)?;
        let material = match material {
            Some(material) => material,
            None => adapter.generate()?,
        };
        let private_key = material
            .private_key
            .ok_or_else(|| WalletError::InvalidKey("Key material has no private key".into()))?;

        let id = wallet_id(&profile.chain_type, &material.address)?;
        if self.wallets.contains_key(&id) || store.exists(&id) {
            return Err(WalletError::AlreadyExists(id.to_string()));
        }

        let standalone_count = self
            .wallets
            .values()
            .filter(|entry| matches!(entry, WalletEntry::Standalone(_)))
            .count();
        let wallet = StandaloneWallet {
            id: id.clone(),
            name: profile
                .name
                .clone()
                .unwrap_or_else(|| format!("Wallet {}", standalone_count + 1)),
            chain_type: profile.chain_type.clone(),
            network: profile.network.clone(),
            address: material.address,
            public_key: material.public_key,
            created_at: Utc::now(),
            private_key,
        };

        let record = standalone_record(&wallet);
        store.put_with_metadata(&id, &record, record.metadata(), password)?;
        self.register(id.clone(), WalletEntry::Standalone(wallet));
        log::info!("Created standalone wallet {}", id);
        Ok(id)
    }

    pub fn import_standalone(
        &mut self,
        store: &RecordStore,
        password: &SecretString,
        profile: &WalletProfile,
        private_key: &SecretString,
    ) -> WalletResult<WalletId> {
        let adapter = self.adapters.get(&profile.chain_type)?;
        let material = adapter.import_from_private_key(private_key)?;
        self.create_standalone(store, password, profile, Some(material))
    }

    /// Persist a seed group and derive its index 0 wallet.
    pub fn create_seed_group(
        &mut self,
        store: &RecordStore,
        password: &SecretString,
        profile: &WalletProfile,
        mnemonic: Option<&SecretString>,
    ) -> WalletResult<SeedGroupId> {
        let adapter = self.adapters.get(&profile.chain_type)?;
        let mnemonic = match mnemonic {
            Some(mnemonic) => SecretString::from(normalize_mnemonic(mnemonic).to_string()),
            None => adapter.generate()?.mnemonic.ok_or_else(|| {
                WalletError::ValidationError(format!(
                    "{} adapter does not produce mnemonics",
                    profile.chain_type
                ))
            })?,
        };

        let first = adapter.import_from_mnemonic(&mnemonic, 0)?;
        let group_id = seed_group_id(&profile.chain_type, &mnemonic)?;
        if self.groups.contains_key(&group_id) || store.exists(&group_id) {
            return Err(WalletError::AlreadyExists(group_id.to_string()));
        }
        let child_id = wallet_id(&profile.chain_type, &first.address)?;
        if self.wallets.contains_key(&child_id) {
            return Err(WalletError::AlreadyExists(child_id.to_string()));
        }

        let group = SeedGroup {
            id: group_id.clone(),
            name: profile
                .name
                .clone()
                .unwrap_or_else(|| format!("Seed {}", self.groups.len() + 1)),
            chain_type: profile.chain_type.clone(),
            network: profile.network.clone(),
            created_at: Utc::now(),
            derived_count: 0,
            children: BTreeMap::new(),
            child_names: BTreeMap::new(),
            mnemonic,
        };

        let record = group.to_record(1);
        store.put_with_metadata(&group_id, &record, record.metadata(), password)?;
        self.groups.insert(group_id.clone(), group);
        self.attach_child(&group_id, 0, child_id, first)?;
        log::info!("Created seed group {}", group_id);
        Ok(group_id)
    }

    /// Derive the next child of `group_id`.
    pub fn derive_next(
        &mut self,
        store: &RecordStore,
        password: &SecretString,
        group_id: &SeedGroupId,
    ) -> WalletResult<WalletId> {
        let index = self.group(group_id)?.derived_count;
        self.derive_at(store, password, group_id, index)
    }

    /// Derive the child at `index`, which must be the group's next index.
    pub fn derive_at(
        &mut self,
        store: &RecordStore,
        password: &SecretString,
        group_id: &SeedGroupId,
        index: u32,
    ) -> WalletResult<WalletId> {
        let group = self.group(group_id)?;
        if index != group.derived_count {
            return Err(WalletError::IndexAlreadyDerived {
                group: group_id.to_string(),
                index,
            });
        }

        let adapter = self.adapters.get(&group.chain_type)?;
        let material = adapter.import_from_mnemonic(&group.mnemonic, index)?;
        let child_id = wallet_id(&group.chain_type, &material.address)?;
        if self.wallets.contains_key(&child_id) {
            return Err(WalletError::AlreadyExists(child_id.to_string()));
        }

        let record = group.to_record(index + 1);
        store.put_with_metadata(group_id, &record, record.metadata(), password)?;
        self.attach_child(group_id, index, child_id.clone(), material)?;
        log::info!("Derived wallet {} at index {} of {}", child_id, index, group_id);
        Ok(child_id)
    }

    pub fn list(&self) -> WalletListing {
        let standalone = self
            .wallets
            .iter()
            .filter(|(_, entry)| matches!(entry, WalletEntry::Standalone(_)))
            .map(|(id, entry)| self.summarize(id, entry))
            .collect();

        let seed_groups = self
            .groups
            .values()
            .map(|group| self.summarize_group(group))
            .collect();

        WalletListing {
            standalone,
            seed_groups,
        }
    }

    /// Every wallet, standalone and derived, in identifier order.
    pub fn wallets(&self) -> Vec<WalletSummary> {
        self.wallets
            .iter()
            .map(|(id, entry)| self.summarize(id, entry))
            .collect()
    }

    pub fn get(&self, id: &WalletId) -> WalletResult<WalletSummary> {
        let entry = self
            .wallets
            .get(id)
            .ok_or_else(|| WalletError::NotFound(id.to_string()))?;
        Ok(self.summarize(id, entry))
    }

    pub fn seed_group(&self, id: &SeedGroupId) -> WalletResult<SeedGroupSummary> {
        Ok(self.summarize_group(self.group(id)?))
    }

    /// Remove a standalone wallet or a whole seed group. Removing a group
    /// drops all of its derived wallets.
    pub fn remove(&mut self, store: &RecordStore, id: &RecordId) -> WalletResult<()> {
        if self.groups.contains_key(id) {
            delete_record(store, id)?;
            if let Some(group) = self.groups.remove(id) {
                for child in group.children.values() {
                    self.wallets.remove(child);
                }
                log::info!(
                    "Removed seed group {} and {} derived wallets",
                    id,
                    group.children.len()
                );
            }
        } else {
            match self.wallets.get(id) {
                Some(WalletEntry::Standalone(_)) => {
                    delete_record(store, id)?;
                    self.wallets.remove(id);
                    log::info!("Removed wallet {}", id);
                }
                Some(WalletEntry::Derived(derived)) => {
                    return Err(WalletError::ValidationError(format!(
                        "Wallet {} is derived from seed group {}; remove the group instead",
                        id, derived.group
                    )));
                }
                None => return Err(WalletError::NotFound(id.to_string())),
            }
        }

        self.repair_active();
        Ok(())
    }

    pub fn set_active(&mut self, id: &WalletId) -> WalletResult<()> {
        if !self.wallets.contains_key(id) {
            return Err(WalletError::NotFound(id.to_string()));
        }
        self.active = Some(id.clone());
        Ok(())
    }

    /// Rename a standalone wallet, a derived wallet or a seed group.
    pub fn rename(
        &mut self,
        store: &RecordStore,
        password: &SecretString,
        id: &RecordId,
        name: &str,
    ) -> WalletResult<()> {
        let name = name.trim();
        validate_wallet_name(name)?;

        if let Some(group) = self.groups.get_mut(id) {
            let previous = std::mem::replace(&mut group.name, name.to_string());
            let record = group.to_record(group.derived_count);
            if let Err(err) = store.put_with_metadata(id, &record, record.metadata(), password) {
                group.name = previous;
                return Err(err);
            }
            // Children without their own name follow the group's.
            let renamed: Vec<(u32, WalletId)> = group
                .children
                .iter()
                .map(|(index, child)| (*index, child.clone()))
                .collect();
            for (index, child) in renamed {
                let child_name = self.group(id)?.child_name(index);
                if let Some(WalletEntry::Derived(derived)) = self.wallets.get_mut(&child) {
                    derived.name = child_name;
                }
            }
            return Ok(());
        }

        match self.wallets.get_mut(id) {
            Some(WalletEntry::Standalone(wallet)) => {
                let previous = std::mem::replace(&mut wallet.name, name.to_string());
                let record = standalone_record(wallet);
                if let Err(err) = store.put_with_metadata(id, &record, record.metadata(), password)
                {
                    wallet.name = previous;
                    return Err(err);
                }
                Ok(())
            }
            Some(WalletEntry::Derived(derived)) => {
                let group_id = derived.group.clone();
                let index = derived.index;
                let group = self
                    .groups
                    .get_mut(&group_id)
                    .ok_or_else(|| WalletError::SeedGroupNotFound(group_id.to_string()))?;

                let previous = group.child_names.insert(index, name.to_string());
                let record = group.to_record(group.derived_count);
                if let Err(err) =
                    store.put_with_metadata(&group_id, &record, record.metadata(), password)
                {
                    match previous {
                        Some(previous) => group.child_names.insert(index, previous),
                        None => group.child_names.remove(&index),
                    };
                    return Err(err);
                }

                if let Some(WalletEntry::Derived(derived)) = self.wallets.get_mut(id) {
                    derived.name = name.to_string();
                }
                Ok(())
            }
            None => Err(WalletError::NotFound(id.to_string())),
        }
    }

    pub fn export_private_key(&self, id: &WalletId) -> WalletResult<SecretString> {
        let entry = self
            .wallets
            .get(id)
            .ok_or_else(|| WalletError::NotFound(id.to_string()))?;
        Ok(SecretString::from(
            entry.private_key().expose_secret().to_string(),
        ))
    }

    pub fn export_mnemonic(&self, group_id: &SeedGroupId) -> WalletResult<SecretString> {
        let group = self.group(group_id)?;
        Ok(SecretString::from(group.mnemonic.expose_secret().to_string()))
    }

    pub fn sign_message(&self, id: &WalletId, message: &[u8]) -> WalletResult<String> {
        let entry = self
            .wallets
            .get(id)
            .ok_or_else(|| WalletError::NotFound(id.to_string()))?;
        let adapter = self.adapters.get(entry.chain_type())?;
        adapter.sign(entry.private_key(), message)
    }

    fn group(&self, id: &SeedGroupId) -> WalletResult<&SeedGroup> {
        self.groups
            .get(id)
            .ok_or_else(|| WalletError::SeedGroupNotFound(id.to_string()))
    }

    fn register(&mut self, id: WalletId, entry: WalletEntry) {
        self.wallets.insert(id.clone(), entry);
        if self.active.is_none() {
            self.active = Some(id);
        }
    }

    fn attach_child(
        &mut self,
        group_id: &SeedGroupId,
        index: u32,
        child_id: WalletId,
        material: KeyMaterial,
    ) -> WalletResult<()> {
        let private_key = material
            .private_key
            .ok_or_else(|| WalletError::InvalidKey("Derived key material has no private key".into()))?;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| WalletError::SeedGroupNotFound(group_id.to_string()))?;
        group.derived_count = group.derived_count.max(index + 1);
        group.children.insert(index, child_id.clone());

        let wallet = DerivedWallet {
            id: child_id.clone(),
            group: group_id.clone(),
            index,
            name: group.child_name(index),
            chain_type: group.chain_type.clone(),
            network: group.network.clone(),
            address: material.address,
            public_key: material.public_key,
            private_key,
        };
        self.register(child_id, WalletEntry::Derived(wallet));
        Ok(())
    }

    fn load_record(
        &mut self,
        store: &RecordStore,
        id: &RecordId,
        password: &SecretString,
    ) -> WalletResult<RecordMetadata> {
        let record: StoredRecord = store.get(id, password)?;
        let metadata = record.metadata();

        match record {
            StoredRecord::Standalone(stored) => {
                if self.wallets.contains_key(id) {
                    return Err(WalletError::AlreadyExists(id.to_string()));
                }
                let wallet = StandaloneWallet {
                    id: id.clone(),
                    name: stored.name.clone(),
                    chain_type: stored.chain_type.clone(),
                    network: stored.network.clone(),
                    address: stored.address.clone(),
                    public_key: stored.public_key.clone(),
                    created_at: stored.created_at,
                    private_key: SecretString::from(stored.private_key.clone()),
                };
                self.register(id.clone(), WalletEntry::Standalone(wallet));
            }
            StoredRecord::SeedGroup(stored) => {
                let adapter = self.adapters.get(&stored.chain_type)?;
                let mnemonic = SecretString::from(stored.mnemonic.clone());
                let derived = derive_range(adapter.as_ref(), &mnemonic, stored.derived_count)?;

                self.groups.insert(
                    id.clone(),
                    SeedGroup {
                        id: id.clone(),
                        name: stored.name.clone(),
                        chain_type: stored.chain_type.clone(),
                        network: stored.network.clone(),
                        created_at: stored.created_at,
                        derived_count: stored.derived_count,
                        children: BTreeMap::new(),
                        child_names: stored.child_names.clone(),
                        mnemonic,
                    },
                );

                for (index, material) in derived {
                    let child_id = wallet_id(&stored.chain_type, &material.address)?;
                    if self.wallets.contains_key(&child_id) {
                        log::warn!(
                            "Derived wallet {} of {} duplicates a loaded wallet, skipping",
                            child_id,
                            id
                        );
                        continue;
                    }
                    self.attach_child(id, index, child_id, material)?;
                }
            }
        }

        Ok(metadata)
    }

    fn repair_active(&mut self) {
        let dangling = self
            .active
            .as_ref()
            .map_or(false, |active| !self.wallets.contains_key(active));
        if dangling {
            self.active = self.wallets.keys().next().cloned();
            match &self.active {
                Some(id) => log::debug!("Active wallet reassigned to {}", id),
                None => log::debug!("Active wallet cleared"),
            }
        }
    }

    fn summarize(&self, id: &WalletId, entry: &WalletEntry) -> WalletSummary {
        let is_active = self.active.as_ref() == Some(id);
        match entry {
            WalletEntry::Standalone(w) => WalletSummary {
                id: id.clone(),
                kind: WalletKind::Standalone,
                name: w.name.clone(),
                chain_type: w.chain_type.clone(),
                network: w.network.clone(),
                address: w.address.clone(),
                public_key: w.public_key.clone(),
                seed_group: None,
                derivation_index: None,
                is_active,
            },
            WalletEntry::Derived(w) => WalletSummary {
                id: id.clone(),
                kind: WalletKind::Derived,
                name: w.name.clone(),
                chain_type: w.chain_type.clone(),
                network: w.network.clone(),
                address: w.address.clone(),
                public_key: w.public_key.clone(),
                seed_group: Some(w.group.clone()),
                derivation_index: Some(w.index),
                is_active,
            },
        }
    }

    fn summarize_group(&self, group: &SeedGroup) -> SeedGroupSummary {
        SeedGroupSummary {
            id: group.id.clone(),
            name: group.name.clone(),
            chain_type: group.chain_type.clone(),
            network: group.network.clone(),
            derived_count: group.derived_count,
            created_at: group.created_at,
            wallets: group
                .children
                .values()
                .filter_map(|child| {
                    self.wallets
                        .get(child)
                        .map(|entry| self.summarize(child, entry))
                })
                .collect(),
        }
    }
}

fn standalone_record(wallet: &StandaloneWallet) -> StoredRecord {
    StoredRecord::Standalone(StandaloneRecord {
        name: wallet.name.clone(),
        chain_type: wallet.chain_type.clone(),
        network: wallet.network.clone(),
        address: wallet.address.clone(),
        public_key: wallet.public_key.clone(),
        private_key: wallet.private_key.expose_secret().to_string(),
        created_at: wallet.created_at,
    })
}

fn derive_range(
    adapter: &dyn ChainAdapter,
    mnemonic: &SecretString,
    count: u32,
) -> WalletResult<Vec<(u32, KeyMaterial)>> {
    (0..count)
        .map(|index| {
            adapter
                .import_from_mnemonic(mnemonic, index)
                .map(|material| (index, material))
        })
        .collect()
}

fn delete_record(store: &RecordStore, id: &RecordId) -> WalletResult<()> {
    match store.delete(id) {
        Err(WalletError::RecordNotFound(_)) => {
            log::warn!("Record {} was already gone from disk", id);
            Ok(())
        }
        other => other,
    }
}
