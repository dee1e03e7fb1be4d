//! Shared types for the store reconciliation engine.
//!
//! These types are produced and consumed by both `wims-core` (the engine) and
//! `wims-cli` (the binary). They carry no I/O.

pub mod record;
pub mod source;
pub mod store_path;

// Re-exports
pub use record::{MatchResult, MatchTier, PackageRecord};
pub use source::{DEFAULT_FLAKE, PackageSource, SourceError};
pub use store_path::{
    DEFAULT_STORE_DIR, HASH_LEN, StoreDir, StorePath, StorePathError, remove_hash_prefix,
    split_name_version,
};
