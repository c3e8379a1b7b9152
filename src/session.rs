//! Transport session: a reconnecting channel between a replica and the relay.
//!
//! The session runs on its own thread and owns the outbound queue; the
//! document handle talks to it through a command channel and observes
//! inbound traffic and state changes on an event channel. The network is
//! injected behind `Connector`, so tests drive the state machine with
//! in-memory transports.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use rand::Rng;

use crate::proto::{self, WireMessage};
use crate::queue::{OutboundQueue, QueueId};
use cowrite_core::Operation;

/// Pause between sends during a reconciliation pass, so a long backlog does
/// not saturate the relay.
pub const SYNC_YIELD: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic component of the delay after `attempts` consecutive
    /// failures: `min(base * 2^attempts, cap)`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u64 << attempts.min(20);
        let ms = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(ms).min(self.cap)
    }

    /// The full retry delay including uniform jitter. Jitter is mandatory:
    /// a relay restart must not see every participant reconnect in step.
    pub fn jittered(&self, attempts: u32, rng: &mut impl Rng) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        self.delay(attempts) + Duration::from_millis(rng.random_range(0..=jitter_ms))
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// One received wire line.
    Line(String),
    /// The stream is gone; `error` is None on an orderly peer close.
    Closed { error: Option<String> },
}

/// Write half of an established connection.
pub trait Transport: Send {
    fn send_line(&mut self, line: &str) -> io::Result<()>;
    fn close(&mut self);
}

/// Capability to open a connection to the relay.
pub trait Connector: Send {
    fn connect(&mut self) -> io::Result<(Box<dyn Transport>, Receiver<TransportEvent>)>;
}

/// Connects over TCP and pumps received lines from a reader thread.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> io::Result<(Box<dyn Transport>, Receiver<TransportEvent>)> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let (line_tx, line_rx) = unbounded();
        thread::spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(TransportEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = line_tx.send(TransportEvent::Closed {
                            error: Some(err.to_string()),
                        });
                        return;
                    }
                }
            }
            let _ = line_tx.send(TransportEvent::Closed { error: None });
        });
        Ok((Box::new(TcpTransport { stream }), line_rx))
    }
}

struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes())
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    RemoteOperation(Operation),
    UsersUpdate(u64),
    Acked { queue_id: QueueId },
    AckFailed { queue_id: QueueId, error: Option<String> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub pending: usize,
    pub degraded: bool,
}

enum Command {
    Open,
    Submit(Operation),
    Reconnect,
    Close,
}

pub struct SessionHandle {
    commands: Sender<Command>,
    events: Receiver<SessionEvent>,
    status: Arc<Mutex<SessionStatus>>,
    join: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Start connecting. A no-op when already engaged.
    pub fn open(&self) {
        let _ = self.commands.send(Command::Open);
    }

    /// Hand a locally produced operation to the transport. Sent immediately
    /// when connected, queued otherwise.
    pub fn submit(&self, op: Operation) {
        let _ = self.commands.send(Command::Submit(op));
    }

    /// Manual reconnect: resets the attempt counter and connects now.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn status(&self) -> SessionStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Terminal close. The queue is persisted, not drained; no event fires
    /// after this returns.
    pub fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spawn the session thread. The session takes ownership of the queue; the
/// caller keeps visibility through `status()` and the event channel.
pub fn spawn(
    connector: Box<dyn Connector>,
    queue: OutboundQueue,
    policy: BackoffPolicy,
    retention: Duration,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();
    let status = Arc::new(Mutex::new(SessionStatus {
        state: ConnectionState::Disconnected,
        pending: queue.size(),
        degraded: queue.is_degraded(),
    }));

    let runner = Runner {
        connector,
        queue,
        policy,
        retention,
        commands: cmd_rx,
        events: event_tx,
        status: Arc::clone(&status),
        state: ConnectionState::Disconnected,
        attempts: 0,
    };
    let join = thread::spawn(move || runner.run());

    SessionHandle {
        commands: cmd_tx,
        events: event_rx,
        status,
        join: Some(join),
    }
}

enum ConnectedExit {
    Close,
    TransportLost,
}

enum Pump {
    Idle,
    Close,
    Lost,
}

struct Runner {
    connector: Box<dyn Connector>,
    queue: OutboundQueue,
    policy: BackoffPolicy,
    retention: Duration,
    commands: Receiver<Command>,
    events: Sender<SessionEvent>,
    status: Arc<Mutex<SessionStatus>>,
    state: ConnectionState,
    attempts: u32,
}

impl Runner {
    fn run(mut self) {
        self.queue.evict_stale(self.retention);
        self.sync_status();

        loop {
            // Idle: Disconnected, including the terminal state after the
            // attempt budget is spent. Only commands can move us.
            let cmd = match self.commands.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            };
            match cmd {
                Command::Close => break,
                Command::Submit(op) => {
                    self.queue.enqueue(op);
                    self.sync_status();
                }
                Command::Open | Command::Reconnect => {
                    self.attempts = 0;
                    if self.engage() {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drive Connecting/Connected/Reconnecting until close (true) or the
    /// attempt budget is exhausted (false).
    fn engage(&mut self) -> bool {
        let mut rng = rand::rng();
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connector.connect() {
                Ok((mut transport, inbound)) => {
                    self.attempts = 0;
                    self.set_state(ConnectionState::Connected);
                    match self.run_connected(transport.as_mut(), &inbound) {
                        ConnectedExit::Close => return true,
                        ConnectedExit::TransportLost => {}
                    }
                }
                Err(err) => {
                    self.attempts += 1;
                    tracing::warn!("connect attempt {} failed: {err}", self.attempts);
                    if self.attempts >= self.policy.max_attempts {
                        tracing::warn!("attempt budget exhausted, going offline");
                        self.set_state(ConnectionState::Disconnected);
                        return false;
                    }
                }
            }

            let delay = self.policy.jittered(self.attempts, &mut rng);
            self.set_state(ConnectionState::Reconnecting);
            if self.wait_for_retry(delay) {
                return true;
            }
        }
    }

    /// Sleep out the backoff delay while staying responsive to commands.
    /// Returns true when close was requested.
    fn wait_for_retry(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.commands.recv_timeout(remaining) {
                Ok(Command::Close) => return true,
                Ok(Command::Submit(op)) => {
                    self.queue.enqueue(op);
                    self.sync_status();
                }
                Ok(Command::Reconnect) => {
                    self.attempts = 0;
                    return false;
                }
                Ok(Command::Open) => {}
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }

    fn run_connected(
        &mut self,
        transport: &mut dyn Transport,
        inbound: &Receiver<TransportEvent>,
    ) -> ConnectedExit {
        // Reconciliation pass: replay the queued backlog in enqueue order,
        // yielding between sends and handling traffic as it arrives. The
        // pass is abandoned with the connection; leftovers go next time.
        for entry in self.queue.peek_all() {
            match self.pump(transport, inbound, SYNC_YIELD) {
                Pump::Idle => {}
                Pump::Close => return ConnectedExit::Close,
                Pump::Lost => return ConnectedExit::TransportLost,
            }
            let frame = WireMessage::sync_operation(entry.op.to_value(), entry.queue_id);
            if let Err(err) = transport.send_line(&proto::encode_line(&frame)) {
                tracing::warn!("reconciliation send failed: {err}");
                transport.close();
                return ConnectedExit::TransportLost;
            }
        }

        loop {
            match self.pump(transport, inbound, Duration::from_millis(250)) {
                Pump::Idle => {}
                Pump::Close => return ConnectedExit::Close,
                Pump::Lost => return ConnectedExit::TransportLost,
            }
        }
    }

    /// Process commands and inbound traffic for up to `wait`.
    fn pump(
        &mut self,
        transport: &mut dyn Transport,
        inbound: &Receiver<TransportEvent>,
        wait: Duration,
    ) -> Pump {
        let deadline = Instant::now() + wait;
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(Command::Close) => {
                        transport.close();
                        return Pump::Close;
                    }
                    Ok(Command::Submit(op)) => {
                        let frame = WireMessage::operation(op.to_value());
                        if let Err(err) = transport.send_line(&proto::encode_line(&frame)) {
                            tracing::warn!("send failed, queueing operation: {err}");
                            self.queue.enqueue(op);
                            self.sync_status();
                            transport.close();
                            return Pump::Lost;
                        }
                    }
                    Ok(Command::Open | Command::Reconnect) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        transport.close();
                        return Pump::Close;
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match inbound.recv_timeout(remaining) {
                Ok(TransportEvent::Line(line)) => self.handle_line(&line),
                Ok(TransportEvent::Closed { error }) => {
                    if let Some(err) = error {
                        tracing::warn!("transport closed: {err}");
                    }
                    return Pump::Lost;
                }
                Err(RecvTimeoutError::Timeout) => return Pump::Idle,
                Err(RecvTimeoutError::Disconnected) => return Pump::Lost,
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let message = match proto::decode_line(line) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("dropping unparsable frame: {err}");
                return;
            }
        };
        match message {
            WireMessage::Operation { operation, .. } => match Operation::from_value(&operation) {
                Ok(op) => {
                    let _ = self.events.send(SessionEvent::RemoteOperation(op));
                }
                Err(err) => tracing::warn!("dropping malformed operation: {err}"),
            },
            WireMessage::UsersUpdate { count } => {
                let _ = self.events.send(SessionEvent::UsersUpdate(count));
            }
            WireMessage::OperationAck {
                operation_id,
                success,
                error,
            } => {
                let Ok(queue_id) = operation_id.parse::<QueueId>() else {
                    tracing::warn!("ack with unknown operation id {operation_id:?}");
                    return;
                };
                if success {
                    self.queue.ack(&[queue_id]);
                    let _ = self.events.send(SessionEvent::Acked { queue_id });
                } else {
                    self.queue.note_failure(queue_id);
                    let _ = self.events.send(SessionEvent::AckFailed { queue_id, error });
                }
                self.sync_status();
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        tracing::debug!("session state: {state:?}");
        self.sync_status();
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    fn sync_status(&mut self) {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        status.state = self.state;
        status.pending = self.queue.size();
        status.degraded = self.queue.is_degraded();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use cowrite_core::{DocId, PosId, SiteId};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn op(n: u64) -> Operation {
        Operation::Insert {
            id: PosId::new(vec![n]).unwrap(),
            value: 'x',
            timestamp: n,
            site: SiteId::generate(),
        }
    }

    fn empty_queue() -> OutboundQueue {
        OutboundQueue::open(Box::new(MemoryKvStore::new()), &DocId::new("doc").unwrap())
    }

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            jitter: Duration::from_millis(1),
            max_attempts: 10,
        }
    }

    #[test]
    fn backoff_delays_are_nondecreasing_and_capped() {
        let policy = BackoffPolicy::default();
        let mut last = Duration::ZERO;
        for attempts in 0..16 {
            let delay = policy.delay(attempts);
            assert!(delay >= last);
            assert!(delay <= policy.cap);
            last = delay;
        }
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(10), policy.cap);
    }

    #[test]
    fn jitter_stays_within_one_second() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempts in 0..12 {
            let delay = policy.jittered(attempts, &mut rng);
            assert!(delay >= policy.delay(attempts));
            assert!(delay <= policy.cap + policy.jitter);
        }
    }

    /// Connector that always fails, counting attempts.
    struct FailingConnector {
        attempts: Arc<AtomicU32>,
    }

    impl Connector for FailingConnector {
        fn connect(&mut self) -> io::Result<(Box<dyn Transport>, Receiver<TransportEvent>)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    #[test]
    fn attempt_budget_lands_in_terminal_disconnected() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = FailingConnector {
            attempts: Arc::clone(&attempts),
        };
        let mut handle = spawn(
            Box::new(connector),
            empty_queue(),
            fast_policy(),
            Duration::from_secs(60),
        );
        handle.open();

        // Wait until the machine settles back into Disconnected.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match handle.events().recv_timeout(Duration::from_secs(1)) {
                Ok(SessionEvent::StateChanged(ConnectionState::Disconnected)) => break,
                Ok(_) => {}
                Err(_) => panic!("no terminal disconnect"),
            }
            assert!(Instant::now() < deadline, "no terminal disconnect in time");
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        assert_eq!(handle.status().state, ConnectionState::Disconnected);

        // Operations submitted while offline are queued, not lost.
        handle.submit(op(1));
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.status().pending == 0 {
            assert!(Instant::now() < deadline, "submit not queued");
            thread::sleep(Duration::from_millis(5));
        }
        handle.close();
    }

    /// Connector handing out an in-memory transport pair.
    struct PipeConnector {
        sent: Arc<Mutex<Vec<String>>>,
        inbound_tx: Arc<Mutex<Option<Sender<TransportEvent>>>>,
    }

    struct PipeTransport {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for PipeTransport {
        fn send_line(&mut self, line: &str) -> io::Result<()> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }
        fn close(&mut self) {}
    }

    impl Connector for PipeConnector {
        fn connect(&mut self) -> io::Result<(Box<dyn Transport>, Receiver<TransportEvent>)> {
            let (tx, rx) = unbounded();
            *self.inbound_tx.lock().unwrap() = Some(tx);
            Ok((
                Box::new(PipeTransport {
                    sent: Arc::clone(&self.sent),
                }),
                rx,
            ))
        }
    }

    #[test]
    fn reconciliation_replays_backlog_and_drains_on_ack() {
        let mut queue = empty_queue();
        let first = queue.enqueue(op(1));
        let second = queue.enqueue(op(2));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let inbound_tx = Arc::new(Mutex::new(None));
        let connector = PipeConnector {
            sent: Arc::clone(&sent),
            inbound_tx: Arc::clone(&inbound_tx),
        };
        let mut handle = spawn(
            Box::new(connector),
            queue,
            fast_policy(),
            Duration::from_secs(60),
        );
        handle.open();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sent.lock().unwrap().len() < 2 {
            assert!(Instant::now() < deadline, "backlog not replayed");
            thread::sleep(Duration::from_millis(5));
        }
        {
            let sent = sent.lock().unwrap();
            assert!(sent[0].contains(r#""isSync":true"#));
            assert!(sent[0].contains(&format!(r#""operationId":"{first}""#)));
            assert!(sent[1].contains(&format!(r#""operationId":"{second}""#)));
        }

        // Ack both; the queue must drain.
        let tx = inbound_tx.lock().unwrap().clone().unwrap();
        for queue_id in [first, second] {
            let ack = WireMessage::OperationAck {
                operation_id: queue_id.to_string(),
                success: true,
                error: None,
            };
            tx.send(TransportEvent::Line(
                proto::encode_line(&ack).trim_end().to_string(),
            ))
            .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.status().pending > 0 {
            assert!(Instant::now() < deadline, "acks not applied");
            thread::sleep(Duration::from_millis(5));
        }

        // A live submit goes straight to the wire, not the queue.
        handle.submit(op(3));
        let deadline = Instant::now() + Duration::from_secs(5);
        while sent.lock().unwrap().len() < 3 {
            assert!(Instant::now() < deadline, "live submit not sent");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!sent.lock().unwrap()[2].contains("isSync"));
        assert_eq!(handle.status().pending, 0);
        handle.close();
    }

    #[test]
    fn failed_ack_keeps_entry_with_failure_count() {
        let mut queue = empty_queue();
        let only = queue.enqueue(op(1));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let inbound_tx = Arc::new(Mutex::new(None));
        let connector = PipeConnector {
            sent: Arc::clone(&sent),
            inbound_tx: Arc::clone(&inbound_tx),
        };
        let mut handle = spawn(
            Box::new(connector),
            queue,
            fast_policy(),
            Duration::from_secs(60),
        );
        handle.open();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sent.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "backlog not replayed");
            thread::sleep(Duration::from_millis(5));
        }
        let tx = inbound_tx.lock().unwrap().clone().unwrap();
        let nack = WireMessage::OperationAck {
            operation_id: only.to_string(),
            success: false,
            error: Some("malformed".into()),
        };
        tx.send(TransportEvent::Line(
            proto::encode_line(&nack).trim_end().to_string(),
        ))
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match handle.events().recv_timeout(Duration::from_secs(1)) {
                Ok(SessionEvent::AckFailed { queue_id, .. }) => {
                    assert_eq!(queue_id, only);
                    break;
                }
                Ok(_) => {}
                Err(_) => panic!("no ack-failed event"),
            }
            assert!(Instant::now() < deadline);
        }
        assert_eq!(handle.status().pending, 1);
        handle.close();
    }
}
