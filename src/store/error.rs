//! Store error taxonomy.
//!
//! Each error kind of the reconciliation protocol is a distinct
//! variant; there are no implicit conversions between kinds. Substrate
//! failures (SQLite, I/O) carry their sources.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::{AuthorId, CoreError};
use crate::store::gate::ApplicationId;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The file records a schema migration this build does not know.
    #[error("schema too new: unknown migration {migration:?}")]
    SchemaTooNew { migration: String },

    /// Stored application data has a newer major version than the
    /// caller expects.
    #[error("application data too new: stored {stored}, expected {expected}")]
    ApplicationDataTooNew {
        stored: ApplicationId,
        expected: ApplicationId,
    },

    /// The file was stamped by a different application.
    #[error("incompatible applications: stored {stored:?}, expected {expected:?}")]
    IncompatibleApplications { stored: String, expected: String },

    /// The merge source was stamped by an application the destination
    /// cannot reconcile with.
    #[error("merge source incompatible: stored {stored:?}, expected {expected}")]
    MergeSourceIncompatible {
        stored: Option<ApplicationId>,
        expected: ApplicationId,
    },

    /// The merge source carries older application data; upgrade it
    /// before merging.
    #[error("merge source requires upgrade: stored {stored:?}, expected {expected}")]
    MergeSourceRequiresUpgrade {
        stored: Option<ApplicationId>,
        expected: ApplicationId,
    },

    /// An author's entries outran its author record. The database is
    /// inconsistent; the recommended recovery is erase-version-history.
    #[error(
        "author table inconsistency: author {author} has entries up to usn {max_entry_usn} \
         but author record at {author_usn:?}"
    )]
    AuthorTableInconsistency {
        author: AuthorId,
        author_usn: Option<u64>,
        max_entry_usn: u64,
    },

    /// A persisted row failed to decode.
    #[error("row decode failed: {reason}")]
    RowDecode { reason: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}
