//! Position identifiers and the midpoint allocation algebra.
//!
//! A `PosId` is a non-empty vector of unsigned integers compared
//! lexicographically; a strict prefix sorts before its extensions.
//! `allocate_between` mints an identifier strictly between two neighbours,
//! descending one level whenever the interval at the current depth is too
//! narrow for a midpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::CoreError;

/// Allocation base. Wire-protocol constant: replicas compare identifiers
/// produced by their peers, so every deployment must agree on it.
pub const BASE: u64 = 1 << 20;

/// Default upper bound for a depth where the high neighbour has no component.
const DEPTH_CEILING: u64 = 2 * BASE;

/// A positional identifier: a non-empty vector of unsigned components.
///
/// Ordering is the derived `Vec` ordering, which is exactly the lexicographic
/// order the algebra needs (first differing component decides; a strict
/// prefix is less).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub struct PosId(Vec<u64>);

impl PosId {
    pub fn new(components: Vec<u64>) -> Result<Self, CoreError> {
        if components.is_empty() {
            return Err(CoreError::malformed("position id has no components"));
        }
        Ok(Self(components))
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for PosId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PosId{:?}", self.0)
    }
}

impl TryFrom<Vec<u64>> for PosId {
    type Error = CoreError;
    fn try_from(components: Vec<u64>) -> Result<Self, Self::Error> {
        PosId::new(components)
    }
}

impl From<PosId> for Vec<u64> {
    fn from(id: PosId) -> Vec<u64> {
        id.0
    }
}

/// Mint a fresh identifier strictly between `lo` and `hi`.
///
/// `None` bounds mean "below everything" and "above everything". Callers
/// must pass `lo < hi`; the live sequence guarantees this for neighbouring
/// characters.
///
/// Depth grows by at most one level past the deeper bound: the walk emits a
/// midpoint at the first depth with room for one, and one level past both
/// bounds the interval is always `(0, 2 * BASE)`.
pub fn allocate_between(lo: Option<&PosId>, hi: Option<&PosId>) -> PosId {
    debug_assert!(
        match (lo, hi) {
            (Some(lo), Some(hi)) => lo < hi,
            _ => true,
        },
        "allocate_between requires lo < hi"
    );

    // Appending at the end of the document keeps a fixed stride so there is
    // always headroom between the new id and the next append.
    if let (Some(lo), None) = (lo, hi) {
        return PosId(vec![lo.0[0] + BASE]);
    }

    let lo_components = lo.map(|p| p.components()).unwrap_or(&[]);
    let hi_components = hi.map(|p| p.components()).unwrap_or(&[]);

    let mut prefix: Vec<u64> = Vec::new();
    // Once the prefix falls strictly below hi at some depth, hi no longer
    // constrains deeper components.
    let mut hi_binds = true;
    let mut depth = 0usize;
    loop {
        let l = lo_components.get(depth).copied().unwrap_or(0);
        let h = if hi_binds {
            hi_components.get(depth).copied().unwrap_or(DEPTH_CEILING)
        } else {
            DEPTH_CEILING
        };

        if h - l >= 2 {
            prefix.push(l + (h - l) / 2);
            return PosId(prefix);
        }

        prefix.push(l);
        if h > l {
            hi_binds = false;
        }
        depth += 1;
    }
}
