//! The replicated unit of change.
//!
//! Operations are immutable, structurally comparable, and self-describing on
//! the wire: a tagged JSON object whose field names are part of the protocol.
//! The same operation encodes to the same bytes on every replica because the
//! encoder walks struct fields in declaration order.

use serde::{Deserialize, Serialize};

use super::error::CoreError;
use super::identity::SiteId;
use super::pos::PosId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Insert {
        id: PosId,
        value: char,
        timestamp: u64,
        #[serde(rename = "siteId")]
        site: SiteId,
    },
    Delete {
        id: PosId,
        timestamp: u64,
        #[serde(rename = "siteId")]
        site: SiteId,
    },
}

impl Operation {
    pub fn id(&self) -> &PosId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Operation::Insert { timestamp, .. } | Operation::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn site(&self) -> SiteId {
        match self {
            Operation::Insert { site, .. } | Operation::Delete { site, .. } => *site,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }

    /// Decode from an untyped JSON value, as received off the wire.
    /// Structural garbage (missing fields, an empty id vector, a
    /// multi-character value) is rejected as malformed.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CoreError> {
        serde_json::from_value(value.clone()).map_err(|err| CoreError::malformed(err.to_string()))
    }

    /// Canonical wire form. Deterministic: the encoder emits the tag and
    /// then the fields in declaration order, so the same operation produces
    /// the same encoding on every replica.
    pub fn to_value(&self) -> serde_json::Value {
        // Serialization of a tagged enum over validated fields cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
