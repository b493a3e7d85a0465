use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio::{
    io::Interest,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tracing::{debug, debug_span, error, trace, warn, Instrument};

use super::{
    connection::{Connection, Direction},
    error::Error,
    wire::Message,
};

/// Whoever owns the sockets a reactor drives. The reactor only moves bytes;
/// everything it reads or flushes is handed back through this trait.
pub trait IoHandler: Send + Sync {
    /// A listener registered with [`Reactor::listen`] accepted a socket.
    fn accept_connection(self: Arc<Self>, stream: std::net::TcpStream, remote: SocketAddr);

    /// Wraps a socket that was just registered on reactor `reactor`.
    fn attach(
        &self,
        stream: TcpStream,
        direction: Direction,
        reactor: usize,
    ) -> Result<Arc<Connection>, Error>;

    /// Messages were decoded from the connection.
    fn on_readable(&self, conn: &Arc<Connection>, messages: Vec<Message>);

    /// Messages were completely written to the connection.
    fn on_writable(&self, conn: &Arc<Connection>, messages: Vec<Message>);

    /// The connection is closed and no longer driven.
    fn release(&self, conn: &Arc<Connection>);

    /// A socket registered on `reactor` could not be attached and was
    /// dropped.
    fn abandon(&self, reactor: usize, direction: Direction);
}

/// How busy a reactor is. Ordered so the least loaded reactor is the
/// smallest: fewest active registrations, then fewest served over its life,
/// then lowest id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReactorLoad {
    pub active_keys: usize,
    pub total_keys_served: u64,
    pub id: usize,
}

/// Min-heap of reactor loads.
pub struct ReactorLoads {
    heap: Mutex<BinaryHeap<Reverse<ReactorLoad>>>,
}

impl ReactorLoads {
    pub fn new(count: usize) -> Self {
        Self {
            heap: Mutex::new(
                (0..count)
                    .map(|id| {
                        Reverse(ReactorLoad {
                            active_keys: 0,
                            total_keys_served: 0,
                            id,
                        })
                    })
                    .collect(),
            ),
        }
    }

    /// Picks the least loaded reactor and counts a registration against it.
    /// The pop, update and push happen under one lock, so two concurrent
    /// elections never both see the same reactor as least loaded.
    pub fn elect(&self) -> Option<usize> {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let Reverse(mut load) = heap.pop()?;
        load.active_keys += 1;
        load.total_keys_served += 1;
        heap.push(Reverse(load));
        Some(load.id)
    }

    pub fn release(&self, id: usize) {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let loads = std::mem::take(&mut *heap).into_vec();
        *heap = loads
            .into_iter()
            .map(|Reverse(mut load)| {
                if load.id == id {
                    load.active_keys = load.active_keys.saturating_sub(1);
                }
                Reverse(load)
            })
            .collect();
    }

    /// Current loads ordered by reactor id.
    pub fn snapshot(&self) -> Vec<ReactorLoad> {
        let mut loads: Vec<_> = self
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|Reverse(load)| *load)
            .collect();
        loads.sort_by_key(|load| load.id);
        loads
    }
}

enum Command {
    Listen {
        listener: std::net::TcpListener,
        handler: Arc<dyn IoHandler>,
    },
    Register {
        stream: std::net::TcpStream,
        direction: Direction,
        handler: Arc<dyn IoHandler>,
    },
    Shutdown,
}

/// A dedicated thread running a single threaded runtime. Every socket
/// registered with a reactor is driven by it until the socket closes.
pub struct Reactor {
    id: usize,
    tx: mpsc::UnboundedSender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn spawn(id: usize, backoff: Duration) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name(format!("reactor-{}", id))
            .spawn(move || {
                let span = debug_span!("reactor", id);
                runtime.block_on(
                    async move {
                        debug!("reactor started");
                        while let Some(command) = rx.recv().await {
                            match command {
                                Command::Listen { listener, handler } => {
                                    match TcpListener::from_std(listener) {
                                        Ok(listener) => {
                                            tokio::spawn(
                                                accept_loop(listener, handler, backoff)
                                                    .in_current_span(),
                                            );
                                        }
                                        Err(e) => {
                                            error!("failed to register listener: {}", e)
                                        }
                                    }
                                }
                                Command::Register {
                                    stream,
                                    direction,
                                    handler,
                                } => {
                                    let attached = TcpStream::from_std(stream)
                                        .map_err(Error::from)
                                        .and_then(|stream| handler.attach(stream, direction, id));
                                    match attached {
                                        Ok(conn) => {
                                            let span = debug_span!("conn", id = conn.id());
                                            tokio::spawn(drive(conn, handler).instrument(span));
                                        }
                                        Err(e) => {
                                            warn!(
                                                "Failed to attach {:?} socket: {}. Ignoring.",
                                                direction, e
                                            );
                                            handler.abandon(id, direction);
                                        }
                                    }
                                }
                                Command::Shutdown => break,
                            }
                        }
                        debug!("reactor stopped");
                    }
                    .instrument(span),
                );
            })?;
        Ok(Self {
            id,
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.tx
            .send(command)
            .map_err(|_| Error::ReactorCluster(format!("reactor {} is not running", self.id)))
    }

    /// Starts accepting on `listener`. Accepted sockets are passed to
    /// [`IoHandler::accept_connection`].
    pub fn listen(
        &self,
        listener: std::net::TcpListener,
        handler: Arc<dyn IoHandler>,
    ) -> Result<(), Error> {
        listener.set_nonblocking(true)?;
        self.send(Command::Listen { listener, handler })
    }

    /// Moves a socket onto this reactor.
    pub fn register(
        &self,
        stream: std::net::TcpStream,
        direction: Direction,
        handler: Arc<dyn IoHandler>,
    ) -> Result<(), Error> {
        stream.set_nonblocking(true)?;
        self.send(Command::Register {
            stream,
            direction,
            handler,
        })
    }

    /// Stops the loop and waits for the thread. Sockets still registered are
    /// dropped with the runtime.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(id = self.id, "reactor thread panicked");
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn IoHandler>, backoff: Duration) {
    let local = listener.local_addr().ok();
    debug!(?local, "accepting");
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => match stream.into_std() {
                Ok(stream) => {
                    trace!(%remote, "accepted");
                    handler.clone().accept_connection(stream, remote);
                }
                Err(e) => warn!("Failed to detach socket from {}: {}. Ignoring.", remote, e),
            },
            Err(e) => {
                error!("accept failed: {}. Retrying in {:?}.", e, backoff);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Waits for the socket to become ready and moves bytes. Only asks for write
/// readiness while something is queued; a newly queued message wakes the
/// loop so it can start waiting for it.
async fn drive(conn: Arc<Connection>, handler: Arc<dyn IoHandler>) {
    loop {
        if conn.is_closed() {
            break;
        }
        let interest = if conn.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ready = select! {
            ready = conn.stream().ready(interest) => ready,
            _ = conn.notified() => continue,
        };
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                debug!("socket error: {}", e);
                break;
            }
        };

        if ready.is_readable() {
            match conn.read() {
                Ok(outcome) => {
                    if !outcome.messages.is_empty() {
                        handler.on_readable(&conn, outcome.messages);
                    }
                    if outcome.eof {
                        debug!("peer closed the connection");
                        break;
                    }
                }
                Err(e) => {
                    warn!("read failed: {}. Closing.", e);
                    break;
                }
            }
        }
        if ready.is_writable() {
            match conn.write() {
                Ok(flushed) if !flushed.is_empty() => handler.on_writable(&conn, flushed),
                Ok(_) => {}
                Err(e) => {
                    warn!("write failed: {}. Closing.", e);
                    break;
                }
            }
        }
    }
    conn.close();
    handler.release(&conn);
}

/// The fixed set of reactors, created once at startup.
pub struct ReactorCluster {
    reactors: Vec<Reactor>,
    loads: ReactorLoads,
}

impl ReactorCluster {
    pub fn new(count: usize, backoff: Duration) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::ReactorCluster("at least one reactor is required".into()));
        }
        let reactors = (0..count)
            .map(|id| Reactor::spawn(id, backoff))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count, "reactor cluster started");
        Ok(Self {
            reactors,
            loads: ReactorLoads::new(count),
        })
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// The least loaded reactor. The caller must [`ReactorCluster::release`]
    /// it once the registration ends.
    pub fn elect(&self) -> Result<&Reactor, Error> {
        self.loads
            .elect()
            .and_then(|id| self.reactors.get(id))
            .ok_or_else(|| Error::ReactorCluster("no reactors".into()))
    }

    pub fn release(&self, id: usize) {
        self.loads.release(id);
    }

    pub fn loads(&self) -> Vec<ReactorLoad> {
        self.loads.snapshot()
    }

    pub fn shutdown(&self) {
        for reactor in &self.reactors {
            reactor.shutdown();
        }
        debug!("reactor cluster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::MessageType;
    use std::{
        io::Write,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
            mpsc as std_mpsc,
        },
    };

    #[test]
    fn test_least_active_reactor_is_elected() {
        let loads = ReactorLoads::new(3);
        assert_eq!(loads.elect(), Some(0));
        assert_eq!(loads.elect(), Some(1));
        assert_eq!(loads.elect(), Some(2));
        loads.release(1);
        assert_eq!(loads.elect(), Some(1));
        assert!(loads.snapshot().iter().all(|load| load.active_keys == 1));
    }

    #[test]
    fn test_ties_go_to_fewest_served() {
        let loads = ReactorLoads::new(2);
        assert_eq!(loads.elect(), Some(0));
        assert_eq!(loads.elect(), Some(1));
        assert_eq!(loads.elect(), Some(0));
        loads.release(0);
        loads.release(0);
        // fewer active wins even though 0 has served more
        assert_eq!(loads.elect(), Some(0));
        loads.release(0);
        loads.release(1);
        // both idle; 1 has served fewer
        assert_eq!(loads.elect(), Some(1));
        let snapshot = loads.snapshot();
        assert_eq!(snapshot[0].total_keys_served, 3);
        assert_eq!(snapshot[1].total_keys_served, 2);
        assert_eq!(snapshot[1].active_keys, 1);
    }

    #[test]
    fn test_concurrent_elections_spread_evenly() {
        let loads = Arc::new(ReactorLoads::new(4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let loads = loads.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        loads.elect();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(loads.snapshot().iter().all(|load| load.active_keys == 50));
    }

    #[test]
    fn test_empty_cluster_is_rejected() {
        assert!(matches!(
            ReactorCluster::new(0, Duration::from_secs(1)),
            Err(Error::ReactorCluster(_))
        ));
    }

    struct Recording {
        cluster: Arc<ReactorCluster>,
        next_id: AtomicU64,
        received: Mutex<std_mpsc::Sender<Message>>,
        released: AtomicUsize,
    }

    impl IoHandler for Recording {
        fn accept_connection(self: Arc<Self>, stream: std::net::TcpStream, _remote: SocketAddr) {
            let reactor = self.cluster.elect().unwrap();
            reactor.register(stream, Direction::Inbound, self.clone()).unwrap();
        }

        fn attach(
            &self,
            stream: TcpStream,
            direction: Direction,
            reactor: usize,
        ) -> Result<Arc<Connection>, Error> {
            let id = self.next_id.fetch_add(1, SeqCst);
            Ok(Arc::new(Connection::new(id, direction, stream, 0, reactor, 1024)?))
        }

        fn on_readable(&self, _conn: &Arc<Connection>, messages: Vec<Message>) {
            for message in messages {
                self.received.lock().unwrap().send(message).unwrap();
            }
        }

        fn on_writable(&self, _conn: &Arc<Connection>, _messages: Vec<Message>) {}

        fn release(&self, conn: &Arc<Connection>) {
            self.cluster.release(conn.reactor());
            self.released.fetch_add(1, SeqCst);
        }

        fn abandon(&self, reactor: usize, _direction: Direction) {
            self.cluster.release(reactor);
        }
    }

    #[test]
    fn test_reactor_accepts_and_reads() {
        let cluster = Arc::new(ReactorCluster::new(2, Duration::from_millis(10)).unwrap());
        let (tx, rx) = std_mpsc::channel();
        let handler = Arc::new(Recording {
            cluster: cluster.clone(),
            next_id: AtomicU64::new(1),
            received: Mutex::new(tx),
            released: AtomicUsize::new(0),
        });
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        cluster.elect().unwrap().listen(listener, handler.clone()).unwrap();

        let message = Message::builder()
            .msg_type(MessageType::Subscribe)
            .event_type(3)
            .uid_str("5-77")
            .build()
            .unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(&message.encode()).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, message);
        // listener on one reactor, the connection on the other
        assert!(cluster.loads().iter().all(|load| load.active_keys == 1));

        drop(client);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.released.load(SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "connection never released");
            thread::sleep(Duration::from_millis(5));
        }
        cluster.shutdown();
    }
}
