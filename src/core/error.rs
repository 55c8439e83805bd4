//! Core error taxonomy.

use thiserror::Error;

/// Errors raised by the data model itself, before any storage is
/// touched.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A JSON write whose payload does not parse as JSON.
    #[error("invalid json payload: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },

    /// A single-value accessor was called on a multi-version result.
    /// The caller must resolve the conflict (read the full version
    /// list and overwrite).
    #[error("version conflict: {versions} concurrent versions")]
    VersionConflict { versions: usize },
}
