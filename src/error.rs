use thiserror::Error;

use crate::core::CoreError;
use crate::store::error::StoreError;

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; match on the inner
/// enums for the protocol's distinct error kinds.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
