//! Tombstones.

use super::identity::{AuthorId, EntryKey, Key, Scope};

/// A promise that the entry `(scope, key, author_id, usn)` has been
/// superseded by the write `(deleting_author_id, deleting_usn)`.
///
/// Tombstones are causal evidence for merge: they travel to peers that
/// may never see the superseding entry itself. Rows are not unique -
/// different deleters may each witness the same prior entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tombstone {
    pub scope: Scope,
    pub key: Key,
    pub author_id: AuthorId,
    pub usn: u64,
    pub deleting_author_id: AuthorId,
    pub deleting_usn: u64,
}

impl Tombstone {
    pub fn entry_key(&self) -> EntryKey {
        EntryKey {
            scope: self.scope.clone(),
            key: self.key.clone(),
        }
    }
}
