pub mod atomic;
pub mod metadata;
pub mod paths;
pub mod records;

pub use metadata::{MetadataIndex, MetadataMap, RecordKind, RecordMetadata};
pub use paths::VaultPaths;
pub use records::{RecordId, RecordStore};
