//! cowrite runtime: the replica's durable queue, transport session and
//! document handle, plus the fan-out relay they talk to.
//!
//! The data structures themselves live in `cowrite-core`; this crate owns
//! everything that touches a clock, a socket or a disk.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod proto;
pub mod queue;
pub mod relay;
pub mod session;
pub mod store;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use client::{Document, DocumentEvent, DocumentStatus};
pub use config::{BackoffConfig, Config};
pub use cowrite_core::{
    ApplyOutcome, CoreError, DocId, LamportClock, Operation, PosId, Replica, SiteId, Snapshot,
    SnapshotChar,
};
pub use proto::WireMessage;
pub use queue::{OutboundQueue, QueueId, QueuedOperation};
pub use relay::{RelayHandle, RelayServer};
pub use session::{
    BackoffPolicy, ConnectionState, Connector, SessionEvent, SessionHandle, TcpConnector,
    Transport, TransportEvent,
};
pub use store::{FsKvStore, KvStore, MemoryKvStore, StoreError};
