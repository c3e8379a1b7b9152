//! Document handle: one document's replica, queue and session wired
//! together.
//!
//! The editor view talks only to this type: it submits index-based edits and
//! reads back text and status. Local edits apply to the replica first, then
//! go to the session (straight to the wire when connected, otherwise to the
//! durable queue). Inbound remote operations apply to the replica and never
//! touch the queue.

use std::time::Duration;

use crate::config::Config;
use crate::queue::{OutboundQueue, QueueId};
use crate::session::{
    self, BackoffPolicy, ConnectionState, Connector, SessionEvent, SessionHandle, TcpConnector,
};
use crate::store::{FsKvStore, KvStore};
use cowrite_core::{CoreError, DocId, Replica, SiteId, Snapshot};

/// What `poll` surfaced since the last call.
#[derive(Debug, PartialEq, Eq)]
pub enum DocumentEvent {
    ConnectionChanged(ConnectionState),
    /// A remote operation was applied (or absorbed) and the text may have
    /// changed.
    RemoteEdit,
    UsersChanged(u64),
    OperationSynced(QueueId),
}

/// Status badge data: connection state, pending operations, queue health.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocumentStatus {
    pub connection: ConnectionState,
    pub pending: usize,
    pub degraded: bool,
    pub users: u64,
}

pub struct Document {
    doc_id: DocId,
    replica: Replica,
    session: SessionHandle,
    state_store: Box<dyn KvStore + Send>,
    users: u64,
}

impl Document {
    /// Open a document with the stock stack: file-backed persistence under
    /// `data_dir` and a TCP connection to the configured relay.
    pub fn open(config: &Config, doc_id: DocId) -> crate::Result<Self> {
        let queue_store = FsKvStore::open(&config.data_dir)?;
        let state_store = FsKvStore::open(&config.data_dir)?;
        Ok(Self::with_parts(
            doc_id,
            Box::new(queue_store),
            Box::new(state_store),
            Box::new(TcpConnector::new(config.relay_addr.clone())),
            config.backoff.policy(),
            config.retention(),
        ))
    }

    /// Fully injected constructor; the seam tests use.
    pub fn with_parts(
        doc_id: DocId,
        queue_store: Box<dyn KvStore + Send>,
        state_store: Box<dyn KvStore + Send>,
        connector: Box<dyn Connector>,
        policy: BackoffPolicy,
        retention: Duration,
    ) -> Self {
        let site = SiteId::generate();
        let replica = load_replica(state_store.as_ref(), &doc_id, site);
        let queue = OutboundQueue::open(queue_store, &doc_id);
        let session = session::spawn(connector, queue, policy, retention);
        Self {
            doc_id,
            replica,
            session,
            state_store,
            users: 0,
        }
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn site(&self) -> SiteId {
        self.replica.site()
    }

    /// Start (or resume) connecting to the relay.
    pub fn connect(&self) {
        self.session.open();
    }

    /// Manual reconnect: resets the attempt budget.
    pub fn reconnect(&self) {
        self.session.reconnect();
    }

    pub fn insert(&mut self, index: usize, value: char) -> Result<(), CoreError> {
        let op = self.replica.local_insert(index, value)?;
        self.session.submit(op);
        Ok(())
    }

    /// Delete the character at `index`; false when out of range.
    pub fn delete(&mut self, index: usize) -> bool {
        match self.replica.local_delete(index) {
            Some(op) => {
                self.session.submit(op);
                true
            }
            None => false,
        }
    }

    pub fn text(&self) -> String {
        self.replica.text()
    }

    pub fn len(&self) -> usize {
        self.replica.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replica.is_empty()
    }

    /// Drain pending session events, applying remote operations to the
    /// replica. Call from the owner's event loop.
    pub fn poll(&mut self) -> Vec<DocumentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.session.events().try_recv() {
            match event {
                SessionEvent::StateChanged(state) => {
                    events.push(DocumentEvent::ConnectionChanged(state));
                }
                SessionEvent::RemoteOperation(op) => {
                    self.replica.apply_remote(&op);
                    events.push(DocumentEvent::RemoteEdit);
                }
                SessionEvent::UsersUpdate(count) => {
                    self.users = count;
                    events.push(DocumentEvent::UsersChanged(count));
                }
                SessionEvent::Acked { queue_id } => {
                    events.push(DocumentEvent::OperationSynced(queue_id));
                }
                SessionEvent::AckFailed { queue_id, error } => {
                    tracing::warn!(
                        "relay rejected queued operation {queue_id}: {}",
                        error.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
        events
    }

    pub fn status(&self) -> DocumentStatus {
        let session = self.session.status();
        DocumentStatus {
            connection: session.state,
            pending: session.pending,
            degraded: session.degraded,
            users: self.users,
        }
    }

    /// Persist a snapshot under `state-<docId>`. Best effort: a write
    /// failure is logged and the document keeps working from memory.
    pub fn save(&mut self) {
        let key = state_key(&self.doc_id);
        let snapshot = self.replica.snapshot();
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("snapshot for {key} not serialisable: {err}");
                return;
            }
        };
        if let Err(err) = self.state_store.put(&key, &bytes) {
            tracing::warn!("snapshot write for {key} failed: {err}");
        }
    }

    /// Save and shut the session down. The queue stays on disk for the next
    /// open.
    pub fn close(mut self) {
        self.save();
        self.session.close();
    }
}

fn state_key(doc_id: &DocId) -> String {
    format!("state-{doc_id}")
}

/// Load the persisted snapshot, falling back to an empty replica when it is
/// missing or fails revalidation.
fn load_replica(store: &(dyn KvStore + Send), doc_id: &DocId, site: SiteId) -> Replica {
    let key = state_key(doc_id);
    let bytes = match store.get(&key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Replica::new(site),
        Err(err) => {
            tracing::warn!("snapshot {key} unreadable, starting empty: {err}");
            return Replica::new(site);
        }
    };
    let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!("snapshot {key} corrupt, starting empty: {err}");
            return Replica::new(site);
        }
    };
    match Replica::restore(site, snapshot) {
        Ok(replica) => replica,
        Err(err) => {
            tracing::warn!("snapshot {key} failed revalidation, starting empty: {err}");
            Replica::new(site)
        }
    }
}
