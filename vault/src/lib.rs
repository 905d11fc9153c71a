// lib.rs - Core library structure for the key vault

pub mod app_state;
pub mod chain;
pub mod config_store;
pub mod crypto;
pub mod errors;
pub mod portfolio;
pub mod registry;
pub mod session;
pub mod storage;
pub mod validation;

// Re-export common types
pub use app_state::{SharedVaultContext, VaultContext};
pub use chain::{ChainAdapter, ChainAdapters, Ed25519Adapter, KeyMaterial};
pub use config_store::{BackupConfig, ConfigStore, SessionConfig, VaultConfig, WalletDefaults};
pub use crypto::{Envelope, KdfParameters};
pub use errors::{WalletError, WalletResult};
pub use portfolio::{collect_balances, AdapterBalanceSource, BalanceReport, BalanceSource};
pub use registry::{
    RehydrationReport, SeedGroupId, SeedGroupSummary, WalletId, WalletKind, WalletListing,
    WalletOptions, WalletRegistry, WalletSummary,
};
pub use session::{
    GateState, MasterCredential, SessionGate, SessionRecord, ThrottlePolicy, ThrottleState,
};
pub use storage::{RecordId, RecordKind, RecordMetadata, RecordStore, VaultPaths};
