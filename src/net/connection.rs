use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering::*},
        Mutex, OnceLock, PoisonError,
    },
};

use chrono::Utc;
use tokio::{net::TcpStream, sync::Notify};
use tracing::{trace, warn};

use super::{
    error::Error,
    wire::{Frame, FrameDecoder, Message},
    NodeId,
};

pub type ConnectionId = u64;

/// Bytes taken off the socket per `try_read`.
const READ_CHUNK: usize = 16 * 1024;

/// Reads per readiness event. Anything left stays readable and is picked up
/// on the next turn of the reactor, so one busy peer can't starve the rest.
const MAX_READS_PER_TURN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Only handshake messages are accepted.
    PendingAuth,
    Ready,
    /// Terminal. Nothing more is processed on the connection.
    AuthFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Request counters for one connection. `active` is decremented when the
/// [`InFlight`] guard drops, so a failing or panicking handler still gives
/// its slot back.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    active: AtomicU64,
    total: AtomicU64,
    successful: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active: u64,
    pub total: u64,
    pub successful: u64,
}

pub struct InFlight<'a> {
    metrics: &'a ConnectionMetrics,
}

impl InFlight<'_> {
    pub fn succeed(self) {
        self.metrics.successful.fetch_add(1, Relaxed);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Relaxed);
    }
}

impl ConnectionMetrics {
    pub fn begin(&self) -> InFlight<'_> {
        self.active.fetch_add(1, Relaxed);
        self.total.fetch_add(1, Relaxed);
        InFlight { metrics: self }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active: self.active.load(Relaxed),
            total: self.total.load(Relaxed),
            successful: self.successful.load(Relaxed),
        }
    }
}

/// An outbound message waiting for the socket. Ordered by message id, then
/// by enqueue order so equal ids keep FIFO order.
struct Queued {
    message_id: u64,
    seq: u64,
    message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.message_id, self.seq).cmp(&(other.message_id, other.seq))
    }
}

/// The message currently being written, which may have been partially
/// flushed by an earlier `try_write`.
struct PartialWrite {
    bytes: Vec<u8>,
    offset: usize,
    message: Message,
}

#[derive(Default)]
struct Outbound {
    queue: BinaryHeap<Reverse<Queued>>,
    seq: u64,
    pending: Option<PartialWrite>,
}

impl Outbound {
    fn len(&self) -> usize {
        self.queue.len() + usize::from(self.pending.is_some())
    }
}

/// Messages taken off the socket by one call to [`Connection::read`].
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub messages: Vec<Message>,
    /// The peer closed its end.
    pub eof: bool,
}

#[derive(Clone, Debug)]
pub struct ConnectionStatus {
    pub id: ConnectionId,
    pub peer: Option<NodeId>,
    pub state: ConnectionState,
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    pub reactor: usize,
    pub queued: usize,
    pub idle_ms: i64,
    pub paused_by_peer: bool,
    pub metrics: MetricsSnapshot,
}

/// One peer link. Owned by a connector and driven by exactly one reactor for
/// its whole life; the reactor calls [`Connection::read`] and
/// [`Connection::write`] when the socket is ready and hands the results to
/// the worker pools.
pub struct Connection {
    id: ConnectionId,
    direction: Direction,
    remote_addr: SocketAddr,
    port: u16,
    reactor: usize,
    stream: TcpStream,
    state: Mutex<ConnectionState>,
    peer_node: OnceLock<NodeId>,
    decoder: Mutex<FrameDecoder>,
    outbound: Mutex<Outbound>,
    wake: Notify,
    idle_since: AtomicI64,
    metrics: ConnectionMetrics,
    paused_by_peer: AtomicBool,
    backpressure_initiated: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        direction: Direction,
        stream: TcpStream,
        port: u16,
        reactor: usize,
        max_payload: usize,
    ) -> Result<Self, Error> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            id,
            direction,
            remote_addr,
            port,
            reactor,
            stream,
            state: Mutex::new(ConnectionState::PendingAuth),
            peer_node: OnceLock::new(),
            decoder: Mutex::new(FrameDecoder::new(max_payload)),
            outbound: Mutex::new(Outbound::default()),
            wake: Notify::new(),
            idle_since: AtomicI64::new(Utc::now().timestamp_millis()),
            metrics: ConnectionMetrics::default(),
            paused_by_peer: AtomicBool::new(false),
            backpressure_initiated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn reactor(&self) -> usize {
        self.reactor
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// PENDING_AUTH -> READY. Returns false if the connection had already
    /// left PENDING_AUTH.
    pub fn set_ready(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ConnectionState::PendingAuth {
            return false;
        }
        *state = ConnectionState::Ready;
        true
    }

    pub fn fail_auth(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::AuthFailed;
    }

    pub fn peer_node(&self) -> Option<NodeId> {
        self.peer_node.get().copied()
    }

    /// Records which node is on the other end. The node can't change once
    /// set; returns false if a different node was already recorded.
    pub fn set_peer_node(&self, node: NodeId) -> bool {
        *self.peer_node.get_or_init(|| node) == node
    }

    fn touch(&self) {
        self.idle_since.store(Utc::now().timestamp_millis(), Relaxed);
    }

    pub fn idle_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.idle_since.load(Relaxed)
    }

    /// Queues a message for the reactor to write. Lower message ids are
    /// written first.
    pub fn enqueue(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut out = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            out.seq += 1;
            let seq = out.seq;
            out.queue.push(Reverse(Queued {
                message_id: message.message_id(),
                seq,
                message,
            }));
        }
        self.wake.notify_one();
        true
    }

    /// Empties the outbound queue in write order without touching the
    /// socket.
    #[cfg(test)]
    pub(crate) fn take_queued(&self) -> Vec<Message> {
        let mut out = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let mut taken: Vec<_> = out.pending.take().map(|p| p.message).into_iter().collect();
        while let Some(Reverse(queued)) = out.queue.pop() {
            taken.push(queued.message);
        }
        taken
    }

    pub fn queued(&self) -> usize {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn wants_write(&self) -> bool {
        self.queued() > 0
    }

    /// Resolves when a message has been queued or the connection closed.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    /// Drains whatever the socket has without blocking and decodes complete
    /// frames. Undecodable frames are dropped; a frame that can't be skipped
    /// is an error and the connection should be closed.
    pub fn read(&self) -> Result<ReadOutcome, Error> {
        let mut outcome = ReadOutcome::default();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut decoder = self.decoder.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..MAX_READS_PER_TURN {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => decoder.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        while let Some(frame) = decoder.next_frame()? {
            match frame {
                Frame::Message(message) => outcome.messages.push(message),
                Frame::Rejected(e) => {
                    warn!(conn = self.id, "Received bad frame: {}. Ignoring.", e)
                }
            }
        }
        if !outcome.messages.is_empty() {
            self.touch();
        }
        Ok(outcome)
    }

    /// Writes queued messages until the socket would block. Returns the
    /// messages that were completely flushed, in the order they were written.
    pub fn write(&self) -> Result<Vec<Message>, Error> {
        let mut flushed = Vec::new();
        let mut out = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if out.pending.is_none() {
                match out.queue.pop() {
                    Some(Reverse(queued)) => {
                        out.pending = Some(PartialWrite {
                            bytes: queued.message.encode(),
                            offset: 0,
                            message: queued.message,
                        })
                    }
                    None => break,
                }
            }
            let Some(pending) = out.pending.as_mut() else {
                break;
            };
            match self.stream.try_write(&pending.bytes[pending.offset..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    pending.offset += n;
                    if pending.offset == pending.bytes.len() {
                        if let Some(done) = out.pending.take() {
                            trace!(conn = self.id, "flushed {}", done.message);
                            flushed.push(done.message);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if !flushed.is_empty() {
            self.touch();
        }
        Ok(flushed)
    }

    /// The peer asked us to hold events.
    pub fn pause_outbound(&self) {
        self.paused_by_peer.store(true, SeqCst);
    }

    pub fn resume_outbound(&self) {
        self.paused_by_peer.store(false, SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused_by_peer.load(SeqCst)
    }

    /// Flags that we've asked the peer to pause. Only the first caller since
    /// the flag was last cleared gets true, so PAUSE is sent once.
    pub fn try_initiate_backpressure(&self) -> bool {
        self.backpressure_initiated
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok()
    }

    /// Clears the flag, returning whether it was set.
    pub fn clear_backpressure(&self) -> bool {
        self.backpressure_initiated.swap(false, SeqCst)
    }

    pub fn backpressure_initiated(&self) -> bool {
        self.backpressure_initiated.load(SeqCst)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, SeqCst) {
            trace!(conn = self.id, "closing");
        }
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id,
            peer: self.peer_node(),
            state: self.state(),
            direction: self.direction,
            remote_addr: self.remote_addr,
            reactor: self.reactor,
            queued: self.queued(),
            idle_ms: self.idle_ms(),
            paused_by_peer: self.is_paused(),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_node() {
            Some(node) => write!(f, "#{} node {} ({})", self.id, node, self.remote_addr),
            None => write!(f, "#{} ({})", self.id, self.remote_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::MessageType;
    use tokio::{io::Interest, net::TcpListener};

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = Connection::new(1, Direction::Outbound, client.unwrap(), addr.port(), 0, 1024)
            .unwrap();
        let server =
            Connection::new(2, Direction::Inbound, accepted.unwrap().0, addr.port(), 0, 1024)
                .unwrap();
        (client, server)
    }

    fn event(id: u64) -> Message {
        Message::builder()
            .msg_type(MessageType::PublishEvent)
            .source_node(12)
            .message_id(id)
            .payload(id.to_le_bytes())
            .build()
            .unwrap()
    }

    async fn read_n(conn: &Connection, n: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        while messages.len() < n {
            conn.stream().ready(Interest::READABLE).await.unwrap();
            let outcome = conn.read().unwrap();
            assert!(!outcome.eof);
            messages.extend(outcome.messages);
        }
        messages
    }

    #[tokio::test]
    async fn test_outbound_drains_oldest_first() {
        let (client, server) = pair().await;
        for id in [30, 10, 20, 10] {
            assert!(client.enqueue(event(id)));
        }
        assert_eq!(client.queued(), 4);

        let mut flushed = Vec::new();
        while client.wants_write() {
            client.stream().ready(Interest::WRITABLE).await.unwrap();
            flushed.extend(client.write().unwrap());
        }
        let ids: Vec<_> = flushed.iter().map(Message::message_id).collect();
        assert_eq!(ids, vec![10, 10, 20, 30]);

        let received = read_n(&server, 4).await;
        let ids: Vec<_> = received.iter().map(Message::message_id).collect();
        assert_eq!(ids, vec![10, 10, 20, 30]);
        assert_eq!(received[3], event(30));
    }

    #[tokio::test]
    async fn test_bad_frame_is_skipped() {
        let (client, server) = pair().await;
        let mut bad = event(1).encode();
        bad[0] = 0x55;
        let mut bytes = bad;
        bytes.extend(event(2).encode());
        client.stream().writable().await.unwrap();
        client.stream().try_write(&bytes).unwrap();

        let received = read_n(&server, 1).await;
        assert_eq!(received, vec![event(2)]);
    }

    #[tokio::test]
    async fn test_state_machine() {
        let (conn, _other) = pair().await;
        assert_eq!(conn.state(), ConnectionState::PendingAuth);
        assert!(conn.set_ready());
        assert!(!conn.set_ready());
        conn.fail_auth();
        assert_eq!(conn.state(), ConnectionState::AuthFailed);
        assert!(!conn.set_ready());

        assert!(conn.set_peer_node(7));
        assert!(conn.set_peer_node(7));
        assert!(!conn.set_peer_node(8));
        assert_eq!(conn.peer_node(), Some(7));

        conn.close();
        assert!(!conn.enqueue(event(1)));
    }

    #[tokio::test]
    async fn test_backpressure_flag_fires_once() {
        let (conn, _other) = pair().await;
        assert!(conn.try_initiate_backpressure());
        assert!(!conn.try_initiate_backpressure());
        assert!(conn.clear_backpressure());
        assert!(!conn.clear_backpressure());
        assert!(conn.try_initiate_backpressure());
    }

    #[tokio::test]
    async fn test_metrics_release_active_on_failure() {
        let (conn, _other) = pair().await;
        conn.metrics().begin().succeed();
        drop(conn.metrics().begin());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _in_flight = conn.metrics().begin();
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(
            conn.metrics().snapshot(),
            MetricsSnapshot {
                active: 0,
                total: 3,
                successful: 1
            }
        );
    }
}
