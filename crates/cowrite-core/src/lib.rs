//! Core data structures for cowrite.
//!
//! Module hierarchy follows type dependency order:
//! - identity: SiteId, DocId
//! - clock: LamportClock
//! - pos: PosId and the midpoint allocation algebra
//! - op: Operation (the replicated unit of change)
//! - replica: live sequence, tombstones, snapshots
//!
//! Everything in this crate is synchronous and I/O-free; the runtime crate
//! owns sockets, threads and persistence.

#![forbid(unsafe_code)]

pub mod clock;
pub mod error;
pub mod identity;
pub mod op;
pub mod pos;
pub mod replica;

pub use clock::LamportClock;
pub use error::CoreError;
pub use identity::{DocId, SiteId};
pub use op::Operation;
pub use pos::{BASE, PosId, allocate_between};
pub use replica::{ApplyOutcome, CharKey, Replica, Snapshot, SnapshotChar};
