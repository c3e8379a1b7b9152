//! Per-replica document state.
//!
//! Live characters sit in a `BTreeMap` keyed by `(position, lamport, site)`;
//! the trailing pair breaks ties when two replicas concurrently mint the same
//! position vector, which keeps the order total without complicating the
//! midpoint algebra. Tombstones are keyed by the position vector alone, so a
//! delete deterministically suppresses every character minted at that vector
//! no matter the delivery order.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::clock::LamportClock;
use super::error::CoreError;
use super::identity::SiteId;
use super::op::Operation;
use super::pos::{self, PosId};

/// Total ordering key of a live character.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharKey {
    pub pos: PosId,
    pub lamport: u64,
    pub site: SiteId,
}

/// What applying a remote operation did. Purely informational; every variant
/// leaves the replica in a converged-compatible state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Insert landed in the live sequence.
    Inserted,
    /// Insert arrived after a tombstone for its vector; delete wins.
    SuppressedInsert,
    /// Exact character already present (duplicate delivery).
    DuplicateInsert,
    /// Delete removed at least one live character.
    Removed,
    /// Delete recorded pre-emptively; nothing was live at that vector yet.
    Tombstoned,
    /// Delete already known (duplicate delivery).
    RedundantDelete,
}

#[derive(Clone, Debug)]
pub struct Replica {
    site: SiteId,
    clock: LamportClock,
    live: BTreeMap<CharKey, char>,
    tombstones: HashSet<PosId>,
}

impl Replica {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            clock: LamportClock::new(),
            live: BTreeMap::new(),
            tombstones: HashSet::new(),
        }
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn lamport(&self) -> u64 {
        self.clock.time()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// The observable text: live character values in key order.
    pub fn text(&self) -> String {
        self.live.values().collect()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Insert `value` before position `index` (so `index == len` appends).
    ///
    /// Returns the operation to replicate. The freshly allocated vector lands
    /// strictly between the index's neighbours, so the local sequence position
    /// equals `index` by construction.
    pub fn local_insert(&mut self, index: usize, value: char) -> Result<Operation, CoreError> {
        let len = self.live.len();
        if index > len {
            return Err(CoreError::InvalidIndex { index, len });
        }

        let (lo, hi) = {
            let mut keys = self.live.keys();
            if index == 0 {
                (None, keys.next().map(|k| k.pos.clone()))
            } else {
                let mut keys = keys.skip(index - 1);
                let lo = keys.next().map(|k| k.pos.clone());
                let hi = keys.next().map(|k| k.pos.clone());
                (lo, hi)
            }
        };

        let timestamp = self.clock.tick();
        let id = pos::allocate_between(lo.as_ref(), hi.as_ref());
        self.live.insert(
            CharKey {
                pos: id.clone(),
                lamport: timestamp,
                site: self.site,
            },
            value,
        );
        Ok(Operation::Insert {
            id,
            value,
            timestamp,
            site: self.site,
        })
    }

    /// Delete the character at `index`. Out-of-range indices are non-fatal
    /// and yield `None`.
    pub fn local_delete(&mut self, index: usize) -> Option<Operation> {
        let key = self.live.keys().nth(index)?.clone();
        let timestamp = self.clock.tick();
        self.tombstones.insert(key.pos.clone());
        // Evict every character at this vector, like the remote path does:
        // a concurrently minted twin is doomed by the tombstone on every
        // other replica, so it must not stay live here.
        let doomed: Vec<CharKey> = self
            .live
            .range(vector_range(&key.pos))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            self.live.remove(k);
        }
        Some(Operation::Delete {
            id: key.pos,
            timestamp,
            site: self.site,
        })
    }

    /// Apply an operation received from a peer.
    ///
    /// Idempotent, and commutative over any delivered set: tombstones win
    /// over inserts regardless of arrival order, and duplicate deliveries are
    /// absorbed.
    pub fn apply_remote(&mut self, op: &Operation) -> ApplyOutcome {
        self.clock.observe(op.timestamp());
        match op {
            Operation::Insert {
                id,
                value,
                timestamp,
                site,
            } => {
                if self.tombstones.contains(id) {
                    return ApplyOutcome::SuppressedInsert;
                }
                let key = CharKey {
                    pos: id.clone(),
                    lamport: *timestamp,
                    site: *site,
                };
                if self.live.contains_key(&key) {
                    return ApplyOutcome::DuplicateInsert;
                }
                self.live.insert(key, *value);
                ApplyOutcome::Inserted
            }
            Operation::Delete { id, .. } => {
                let newly_tombstoned = self.tombstones.insert(id.clone());
                let doomed: Vec<CharKey> = self
                    .live
                    .range(vector_range(id))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &doomed {
                    self.live.remove(key);
                }
                if !doomed.is_empty() {
                    ApplyOutcome::Removed
                } else if newly_tombstoned {
                    ApplyOutcome::Tombstoned
                } else {
                    ApplyOutcome::RedundantDelete
                }
            }
        }
    }

    /// Serialisable copy of (live sequence, tombstones, lamport).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            live_seq: self
                .live
                .iter()
                .map(|(key, value)| SnapshotChar {
                    id: key.pos.clone(),
                    value: *value,
                    timestamp: key.lamport,
                    site: key.site,
                })
                .collect(),
            tombstones: {
                let mut ids: Vec<PosId> = self.tombstones.iter().cloned().collect();
                ids.sort();
                ids
            },
            lamport: self.clock.time(),
        }
    }

    /// Rebuild a replica from a persisted snapshot.
    ///
    /// The snapshot is revalidated before anything is adopted; a corrupt one
    /// is rejected so the caller can fall back to an empty replica.
    pub fn restore(site: SiteId, snapshot: Snapshot) -> Result<Self, CoreError> {
        let mut replica = Self::new(site);
        replica.clock = LamportClock::with_time(snapshot.lamport);
        replica.tombstones = snapshot.tombstones.into_iter().collect();
        for ch in snapshot.live_seq {
            let key = CharKey {
                pos: ch.id,
                lamport: ch.timestamp,
                site: ch.site,
            };
            if replica.live.insert(key, ch.value).is_some() {
                return Err(CoreError::SnapshotInvalid {
                    reason: "duplicate character key in live sequence".into(),
                });
            }
        }
        replica.check_invariants()?;
        Ok(replica)
    }

    /// Structural self-check: live keys strictly ordered and disjoint from
    /// tombstones, clock dominating every live timestamp.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        for key in self.live.keys() {
            if self.tombstones.contains(&key.pos) {
                return Err(CoreError::SnapshotInvalid {
                    reason: format!("live character {:?} is also tombstoned", key.pos),
                });
            }
            if key.lamport > self.clock.time() {
                return Err(CoreError::SnapshotInvalid {
                    reason: format!(
                        "character timestamp {} exceeds clock {}",
                        key.lamport,
                        self.clock.time()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn vector_range(id: &PosId) -> std::ops::RangeInclusive<CharKey> {
    CharKey {
        pos: id.clone(),
        lamport: 0,
        site: SiteId::MIN,
    }..=CharKey {
        pos: id.clone(),
        lamport: u64::MAX,
        site: SiteId::MAX,
    }
}

/// Persisted form of a live character; mirrors the insert wire shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChar {
    pub id: PosId,
    pub value: char,
    pub timestamp: u64,
    #[serde(rename = "siteId")]
    pub site: SiteId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "liveSeq")]
    pub live_seq: Vec<SnapshotChar>,
    pub tombstones: Vec<PosId>,
    pub lamport: u64,
}
