//! Tagged values and read results.
//!
//! Value: what a writer stores at a slot
//! Version: one author's surviving write, an owned snapshot
//! Versions: the multi-value register read result

use std::fmt;

use super::error::CoreError;
use super::identity::AuthorId;

/// A tagged record value.
///
/// `Null` is a logical deletion marker: deletes are ordinary writes and
/// show up to readers as a version whose value is `Null`.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Text(String),
    Json(String),
    Blob { mime: String, bytes: Vec<u8> },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Text(_) => ValueKind::Text,
            Value::Json(_) => ValueKind::Json,
            Value::Blob { .. } => ValueKind::Blob,
        }
    }

    /// Syntactic validation, applied before any write touches storage.
    ///
    /// Only `Json` carries a constraint: the payload must parse. A
    /// string is never accepted merely because it looks JSON-ish.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Value::Json(raw) = self {
            serde_json::from_str::<serde_json::Value>(raw)
                .map(|_| ())
                .map_err(|source| CoreError::InvalidJson { source })?;
        }
        Ok(())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Text(s) => write!(f, "Text({s:?})"),
            Value::Json(s) => write!(f, "Json({s:?})"),
            Value::Blob { mime, bytes } => write!(f, "Blob({mime:?}, {} bytes)", bytes.len()),
        }
    }
}

/// The persisted discriminant of a `Value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Text,
    Json,
    Blob,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Text => "text",
            ValueKind::Json => "json",
            ValueKind::Blob => "blob",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "null" => Some(ValueKind::Null),
            "text" => Some(ValueKind::Text),
            "json" => Some(ValueKind::Json),
            "blob" => Some(ValueKind::Blob),
            _ => None,
        }
    }
}

/// One author's surviving write at a slot.
///
/// Owned and independent of the store it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub author: AuthorId,
    pub timestamp: u64,
    pub value: Value,
}

/// The read result for a `(scope, key)` slot: one version per author
/// that still holds a live entry.
///
/// Empty means "never written"; a single `Null` version means
/// "deleted"; more than one version is a conflict the caller must
/// resolve. The single-value accessors fail on conflicts rather than
/// pick a winner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Versions(Vec<Version>);

impl Versions {
    pub fn new(versions: Vec<Version>) -> Self {
        Self(versions)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Version> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Version] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Version> {
        self.0
    }

    /// The sole version, if there is exactly one.
    fn single(&self) -> Result<Option<&Version>, CoreError> {
        match self.0.len() {
            0 => Ok(None),
            1 => Ok(Some(&self.0[0])),
            n => Err(CoreError::VersionConflict { versions: n }),
        }
    }

    /// Text payload: empty or type-mismatched reads as `None`.
    pub fn text(&self) -> Result<Option<&str>, CoreError> {
        Ok(self.single()?.and_then(|v| match &v.value {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }))
    }

    /// Raw JSON payload: empty or type-mismatched reads as `None`.
    pub fn json(&self) -> Result<Option<&str>, CoreError> {
        Ok(self.single()?.and_then(|v| match &v.value {
            Value::Json(s) => Some(s.as_str()),
            _ => None,
        }))
    }

    /// Blob payload as `(mime, bytes)`: empty or type-mismatched reads
    /// as `None`.
    pub fn blob(&self) -> Result<Option<(&str, &[u8])>, CoreError> {
        Ok(self.single()?.and_then(|v| match &v.value {
            Value::Blob { mime, bytes } => Some((mime.as_str(), bytes.as_slice())),
            _ => None,
        }))
    }

    /// True iff the slot holds exactly one version and it is a
    /// deletion marker.
    pub fn is_deleted(&self) -> Result<bool, CoreError> {
        Ok(self.single()?.is_some_and(|v| v.value.is_null()))
    }
}

impl IntoIterator for Versions {
    type Item = Version;
    type IntoIter = std::vec::IntoIter<Version>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Versions {
    type Item = &'a Version;
    type IntoIter = std::slice::Iter<'a, Version>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
