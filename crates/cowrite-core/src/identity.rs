//! Identity atoms.
//!
//! SiteId: per-session replica identity, the final tie-break in character
//! ordering.
//! DocId: names a document in the persisted key/value layout.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::CoreError;

/// Site identifier - unique per replica session.
///
/// Random v4. Two live sessions colliding is vanishingly unlikely, and the
/// identifier only has to break ties between structurally identical position
/// vectors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse_str(s: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| CoreError::InvalidSiteId {
                raw: s.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Smallest possible site id; used as a range bound, never assigned.
    pub(crate) const MIN: SiteId = SiteId(Uuid::nil());

    /// Largest possible site id; used as a range bound, never assigned.
    pub(crate) const MAX: SiteId = SiteId(Uuid::max());
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteId({})", self.0)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SiteId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        SiteId::parse_str(&s)
    }
}

impl From<Uuid> for SiteId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Document identifier.
///
/// Restricted to a filesystem-safe alphabet because it is spliced into the
/// persisted keys `queue-<docId>` and `state-<docId>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocId(String);

impl DocId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(CoreError::InvalidDocId {
                raw: s,
                reason: "empty".into(),
            });
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(CoreError::InvalidDocId {
                raw: s,
                reason: "allowed characters are [A-Za-z0-9._-]".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({:?})", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DocId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        DocId::new(s)
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> String {
        id.0
    }
}
