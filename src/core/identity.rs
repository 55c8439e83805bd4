//! Identity atoms.
//!
//! AuthorId: one open of the database (a write session)
//! Scope / Key: the two-part record address
//! EntryKey: a (scope, key) slot

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author identifier - a 128-bit id stamped on every write produced by
/// one open of the database.
///
/// Every open draws a fresh id; the human-readable name on the author
/// record is a hint only. Equality is by id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(Uuid);

impl AuthorId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", self.0)
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scope - a string prefix logically partitioning the key space.
///
/// Any string is valid, including the empty string (the default scope).
/// Distinct scopes never interact, even under the same key string.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({:?})", self.0)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key - the record name within a scope. Any string is valid.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The address of one multi-value register: `(scope, key)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub scope: Scope,
    pub key: Key,
}

impl EntryKey {
    pub fn new(scope: impl Into<Scope>, key: impl Into<Key>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }

    /// A key in the default (empty) scope.
    pub fn unscoped(key: impl Into<Key>) -> Self {
        Self {
            scope: Scope::default(),
            key: key.into(),
        }
    }
}

impl fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryKey({:?}, {:?})", self.scope.as_str(), self.key.as_str())
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_default() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}/{}", self.scope, self.key)
        }
    }
}

impl From<&str> for EntryKey {
    fn from(key: &str) -> Self {
        EntryKey::unscoped(key)
    }
}

impl From<(&str, &str)> for EntryKey {
    fn from((scope, key): (&str, &str)) -> Self {
        EntryKey::new(scope, key)
    }
}

impl From<String> for Scope {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}
