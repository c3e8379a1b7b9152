//! Durable outbound operation queue.
//!
//! Every locally produced operation waits here until the relay acknowledges
//! it. The whole queue is persisted as one JSON array under `queue-<docId>`
//! and rewritten synchronously on every mutation, so a crash between enqueue
//! and ack loses nothing. A store that refuses writes degrades the queue to
//! best-effort memory: collaboration continues, pending edits may be lost on
//! restart, and `is_degraded` surfaces the condition.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::store::KvStore;
use cowrite_core::{DocId, Operation};

pub type QueueId = u64;

/// Retention bound for operations that will never be acknowledged because
/// every peer has abandoned the document.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    #[serde(rename = "queueId")]
    pub queue_id: QueueId,
    #[serde(rename = "enqueuedAt")]
    pub enqueued_at: u64,
    #[serde(default)]
    pub failures: u32,
    pub op: Operation,
}

pub struct OutboundQueue {
    store: Box<dyn KvStore + Send>,
    key: String,
    entries: VecDeque<QueuedOperation>,
    next_queue_id: QueueId,
    degraded: bool,
}

impl OutboundQueue {
    /// Load the persisted queue for `doc_id`, starting empty when nothing is
    /// stored. Corrupt or unreadable contents are logged and discarded
    /// rather than wedging the replica.
    pub fn open(store: Box<dyn KvStore + Send>, doc_id: &DocId) -> Self {
        let key = format!("queue-{doc_id}");
        let mut queue = Self {
            store,
            key,
            entries: VecDeque::new(),
            next_queue_id: 1,
            degraded: false,
        };

        match queue.store.get(&queue.key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<QueuedOperation>>(&bytes) {
                Ok(entries) => {
                    queue.next_queue_id = entries
                        .iter()
                        .map(|e| e.queue_id)
                        .max()
                        .map_or(1, |max| max + 1);
                    queue.entries = entries.into();
                }
                Err(err) => {
                    tracing::warn!("discarding corrupt queue {}: {err}", queue.key);
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("queue {} unreadable, starting empty: {err}", queue.key);
                queue.degraded = true;
            }
        }
        queue
    }

    /// Append an operation and persist before returning.
    pub fn enqueue(&mut self, op: Operation) -> QueueId {
        let queue_id = self.next_queue_id;
        self.next_queue_id += 1;
        self.entries.push_back(QueuedOperation {
            queue_id,
            enqueued_at: now_ms(),
            failures: 0,
            op,
        });
        self.persist();
        queue_id
    }

    /// Remove acknowledged entries and persist.
    pub fn ack(&mut self, queue_ids: &[QueueId]) {
        let before = self.entries.len();
        self.entries.retain(|e| !queue_ids.contains(&e.queue_id));
        if self.entries.len() != before {
            self.persist();
        }
    }

    /// Record a failed sync attempt for an entry; it stays queued for the
    /// next reconnect.
    pub fn note_failure(&mut self, queue_id: QueueId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.queue_id == queue_id) {
            entry.failures += 1;
            self.persist();
        }
    }

    /// Snapshot of queued entries in enqueue order.
    pub fn peek_all(&self) -> Vec<QueuedOperation> {
        self.entries.iter().cloned().collect()
    }

    /// Drop entries older than `max_age`.
    pub fn evict_stale(&mut self, max_age: Duration) {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let before = self.entries.len();
        self.entries.retain(|e| e.enqueued_at >= cutoff);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::info!("evicted {evicted} stale entries from {}", self.key);
            self.persist();
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True while the backing store is refusing writes and the queue lives
    /// only in memory.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn persist(&mut self) {
        let entries: Vec<&QueuedOperation> = self.entries.iter().collect();
        let bytes = match serde_json::to_vec(&entries) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("queue {} not serialisable: {err}", self.key);
                return;
            }
        };
        match self.store.put(&self.key, &bytes) {
            Ok(()) => {
                if self.degraded {
                    tracing::info!("queue {} persistence recovered", self.key);
                    self.degraded = false;
                }
            }
            Err(err) => {
                if !self.degraded {
                    tracing::warn!(
                        "queue {} write failed, holding operations in memory: {err}",
                        self.key
                    );
                    self.degraded = true;
                }
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
