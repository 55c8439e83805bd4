//! Author records.

use serde::{Deserialize, Serialize};

use super::identity::AuthorId;

/// One write session's row in the author table.
///
/// `usn` is the largest update sequence number the session has
/// produced; the set of author records forms the replica's version
/// vector. `name` is a human-readable hint and never participates in
/// equality.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRecord {
    pub id: AuthorId,
    pub name: String,
    pub usn: u64,
    pub timestamp: u64,
}

impl AuthorRecord {
    /// A fresh session record. Not persisted until the first write.
    pub fn new_session(name: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: AuthorId::generate(),
            name: name.into(),
            usn: 0,
            timestamp: now_ms,
        }
    }

    /// Allocate the next usn for a write from this session.
    pub fn next_usn(&self) -> u64 {
        self.usn.checked_add(1).expect("usn overflow")
    }
}
