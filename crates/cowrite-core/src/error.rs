use thiserror::Error;

/// Errors produced by the core data structures.
///
/// Nothing here is fatal to a replica: an invalid index is reported to the
/// caller and a malformed operation is dropped at the decode boundary, both
/// without touching state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("index {index} out of range for document of length {len}")]
    InvalidIndex { index: usize, len: usize },

    #[error("malformed operation: {reason}")]
    MalformedOperation { reason: String },

    #[error("invalid site id {raw:?}: {reason}")]
    InvalidSiteId { raw: String, reason: String },

    #[error("invalid document id {raw:?}: {reason}")]
    InvalidDocId { raw: String, reason: String },

    #[error("snapshot rejected: {reason}")]
    SnapshotInvalid { reason: String },
}

impl CoreError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        CoreError::MalformedOperation {
            reason: reason.into(),
        }
    }
}
