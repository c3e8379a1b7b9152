use thiserror::Error;

use crate::proto::ProtoError;
use crate::store::StoreError;
use cowrite_core::CoreError;

/// Crate-level convenience error: a thin wrapper over the capability errors,
/// not a replacement for them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
