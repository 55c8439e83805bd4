//! Core domain types.
//!
//! Module hierarchy follows type dependency order:
//! - time: wall-clock stamps (Layer 0)
//! - identity: AuthorId, Scope, Key, EntryKey (Layer 1)
//! - value: Value, Version, Versions (Layer 2)
//! - author: AuthorRecord (Layer 3)
//! - tombstone: Tombstone (Layer 3)
//! - vector: VersionVector (Layer 4)

pub mod author;
pub mod error;
pub mod identity;
pub mod time;
pub mod tombstone;
pub mod value;
pub mod vector;

pub use author::AuthorRecord;
pub use error::CoreError;
pub use identity::{AuthorId, EntryKey, Key, Scope};
pub use time::now_ms;
pub use tombstone::Tombstone;
pub use value::{Value, ValueKind, Version, Versions};
pub use vector::{Need, VersionVector};
