//! Fan-out relay.
//!
//! The relay is a process-wide registry of connected participants and
//! nothing else: every well-formed operation frame from one participant is
//! written to every other open participant, sync frames are acknowledged to
//! the sender, and occupancy changes are broadcast as `users_update`. It
//! never parses an operation beyond a shallow `type` check and stores no
//! document state.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::proto::{self, WireMessage};

const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub struct RelayServer {
    listener: TcpListener,
    registry: Registry,
    shutdown: Arc<AtomicBool>,
}

impl RelayServer {
    pub fn bind(addr: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            registry: Registry::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Flag observed by the accept loop; setting it makes `run` return.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Accept participants until the shutdown flag is set.
    pub fn run(self) -> Result<(), RelayError> {
        tracing::info!("relay listening on {:?}", self.listener.local_addr()?);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.admit(stream, peer) {
                        tracing::warn!("failed to admit {peer}: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    tracing::warn!("accept error: {err}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        self.registry.close_all();
        tracing::info!("relay shut down");
        Ok(())
    }

    /// Run on a background thread; for tests and embedding.
    pub fn spawn(self) -> Result<RelayHandle, RelayError> {
        let addr = self.local_addr()?;
        let shutdown = self.shutdown_flag();
        let registry = self.registry.clone();
        let join = thread::spawn(move || {
            if let Err(err) = self.run() {
                tracing::warn!("relay exited with error: {err}");
            }
        });
        Ok(RelayHandle {
            addr,
            shutdown,
            registry,
            join,
        })
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let id = self.registry.register(writer);
        tracing::info!("participant {id} connected from {peer}");

        let registry = self.registry.clone();
        thread::spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) => registry.handle_frame(id, &line),
                    Err(err) => {
                        tracing::debug!("participant {id} read error: {err}");
                        break;
                    }
                }
            }
            registry.unregister(id);
            tracing::info!("participant {id} disconnected");
        });
        Ok(())
    }
}

pub struct RelayHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    registry: Registry,
    join: JoinHandle<()>,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn participant_count(&self) -> usize {
        self.registry.count()
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.registry.close_all();
        let _ = self.join.join();
    }
}

#[derive(Clone)]
struct Registry {
    inner: Arc<Mutex<RegistryState>>,
}

struct RegistryState {
    next_id: u64,
    participants: BTreeMap<u64, TcpStream>,
}

impl Registry {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState {
                next_id: 1,
                participants: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count(&self) -> usize {
        self.lock().participants.len()
    }

    fn register(&self, writer: TcpStream) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.participants.insert(id, writer);
        state.broadcast_users_update();
        id
    }

    fn unregister(&self, id: u64) {
        let mut state = self.lock();
        if state.participants.remove(&id).is_some() {
            state.broadcast_users_update();
        }
    }

    fn close_all(&self) {
        let mut state = self.lock();
        for stream in state.participants.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        state.participants.clear();
    }

    /// One frame from participant `id`, raw off the wire.
    fn handle_frame(&self, id: u64, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!("participant {id}: dropping unparsable frame: {err}");
                return;
            }
        };
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            tracing::debug!("participant {id}: frame without type");
            return;
        };
        if kind != "operation" {
            tracing::debug!("participant {id}: ignoring frame of type {kind:?}");
            return;
        }

        let is_sync = value.get("isSync").and_then(Value::as_bool) == Some(true);
        let operation = value.get("operation");
        let well_formed = operation.is_some_and(proto::operation_is_well_formed);

        // Only sync frames are acknowledged. The ack echoes the sender's
        // queue bookkeeping id when supplied, falling back to the embedded
        // operation's own id.
        let ack_id = value
            .get("operationId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| operation.and_then(|op| op.get("id")).map(Value::to_string));

        let mut state = self.lock();
        if well_formed {
            // The fan-out strips the sender's sync bookkeeping.
            let operation = operation.cloned().unwrap_or(Value::Null);
            let frame = proto::encode_line(&WireMessage::operation(operation));
            state.fan_out(id, &frame);
            if is_sync
                && let Some(operation_id) = ack_id
            {
                let ack = proto::encode_line(&WireMessage::OperationAck {
                    operation_id,
                    success: true,
                    error: None,
                });
                state.send_to(id, &ack);
            }
        } else {
            tracing::warn!("participant {id}: malformed operation, not fanned out");
            if is_sync
                && let Some(operation_id) = ack_id
            {
                let nack = proto::encode_line(&WireMessage::OperationAck {
                    operation_id,
                    success: false,
                    error: Some("malformed operation".into()),
                });
                state.send_to(id, &nack);
            }
        }
    }
}

impl RegistryState {
    fn broadcast_users_update(&mut self) {
        let frame = proto::encode_line(&WireMessage::UsersUpdate {
            count: self.participants.len() as u64,
        });
        self.write_each(None, &frame);
    }

    fn fan_out(&mut self, from: u64, frame: &str) {
        self.write_each(Some(from), frame);
    }

    fn send_to(&mut self, id: u64, frame: &str) {
        let Some(stream) = self.participants.get_mut(&id) else {
            return;
        };
        if let Err(err) = stream.write_all(frame.as_bytes()) {
            tracing::debug!("participant {id} write failed: {err}");
            self.participants.remove(&id);
            self.broadcast_users_update();
        }
    }

    /// Write to every open participant except `skip`, evicting dead writers.
    fn write_each(&mut self, skip: Option<u64>, frame: &str) {
        let mut dead = Vec::new();
        for (&id, stream) in self.participants.iter_mut() {
            if Some(id) == skip {
                continue;
            }
            if let Err(err) = stream.write_all(frame.as_bytes()) {
                tracing::debug!("participant {id} write failed: {err}");
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            for id in dead {
                self.participants.remove(&id);
            }
            self.broadcast_users_update();
        }
    }
}
