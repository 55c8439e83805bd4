//! oxbow: an offline-mergeable key-value database file.
//!
//! A single self-contained SQLite file that independent replicas edit
//! offline and later merge without data loss. Every open is a write
//! session with its own author id; concurrent updates to a key from
//! different sessions survive merge as distinct versions of a
//! multi-value register, and callers - not the store - resolve
//! conflicts.

#![forbid(unsafe_code)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod core;
pub mod error;
pub mod store;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience.
pub use crate::core::{
    AuthorId, AuthorRecord, CoreError, EntryKey, Key, Need, Scope, Tombstone, Value, ValueKind,
    Version, VersionVector, Versions,
};
pub use crate::store::error::StoreError;
pub use crate::store::gate::ApplicationId;
pub use crate::store::observe::{ChangeEvent, ChangeSubscription, ReadSnapshot, ReadSubscription};
pub use crate::store::query::{Filter, Statistics};
pub use crate::store::{ApplicationCheck, OpenOptions, Store, UpgradeHook};
