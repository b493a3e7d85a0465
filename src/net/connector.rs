use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::*},
        Arc, Mutex, PoisonError, RwLock, Weak,
    },
    time::Duration,
};

use chrono::Utc;
use hashbrown::HashMap;
use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

use super::{
    connection::{Connection, ConnectionId, ConnectionStatus, Direction},
    dispatch::{self, Job, ReaderDispatch, WriterDispatch},
    error::Error,
    handshake,
    reactor::{IoHandler, ReactorCluster, ReactorLoad},
    wire::{Message, MessageType, MessageUid},
    worker::{PoolStatus, Submission, WorkerKind, WorkerPool},
    EventType, NodeId, MAX_MESSAGE_ID,
};
use crate::{
    config::{Config, ConnectorConfig, DeliveryConfig, Role},
    proof::{
        book::ProofBook,
        ledger::MasterMessageLedger,
        store::{DocumentStore, FileStore, MemoryStore},
        DeliveryState, DocumentKey, PartitionKey, ProofDocument, ProofKind,
    },
};

/// An event handed to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveredEvent {
    pub uid: MessageUid,
    pub event_type: EventType,
    pub originating_port: u16,
    pub payload: Vec<u8>,
}

impl From<&Message> for DeliveredEvent {
    fn from(message: &Message) -> Self {
        Self {
            uid: message.uid(),
            event_type: message.event_type(),
            originating_port: message.originating_port(),
            payload: message.payload().to_vec(),
        }
    }
}

/// Events held for nodes that asked us to pause. Keyed so a message held
/// twice is only sent once, and drained oldest first.
#[derive(Default)]
pub struct QueuedMessages {
    held: Mutex<HashMap<NodeId, BTreeMap<(u64, NodeId, u8), Message>>>,
}

impl QueuedMessages {
    /// Holds `message` if `paused` still answers true once the lock is
    /// taken, otherwise hands it back. A drain running concurrently either
    /// sees the held message or has already lifted the pause.
    pub fn hold_if(
        &self,
        node: NodeId,
        message: Message,
        paused: impl FnOnce() -> bool,
    ) -> Option<Message> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !paused() {
            return Some(message);
        }
        let key = (message.message_id(), message.source_node(), message.msg_type().byte());
        held.entry(node).or_default().insert(key, message);
        None
    }

    pub fn drain(&self, node: NodeId) -> Vec<Message> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node)
            .map(|held| held.into_values().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which nodes want which event types.
#[derive(Default)]
pub struct Subscriptions {
    by_event: RwLock<HashMap<EventType, BTreeSet<NodeId>>>,
}

impl Subscriptions {
    /// Returns true if the node wasn't subscribed yet.
    pub fn subscribe(&self, node: NodeId, event_type: EventType) -> bool {
        self.by_event
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .insert(node)
    }

    pub fn subscribers(&self, event_type: EventType) -> Vec<NodeId> {
        self.by_event
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_event
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a connector's handlers share: its connections, proofs, ledgers
/// and routing tables.
pub struct ConnectorState {
    pub name: String,
    pub port: u16,
    pub node_id: NodeId,
    pub role: Role,
    delivery: DeliveryConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    nodes: RwLock<HashMap<NodeId, ConnectionId>>,
    proofs: ProofBook,
    incoming: MasterMessageLedger,
    outgoing: MasterMessageLedger,
    queued: QueuedMessages,
    subscriptions: Subscriptions,
    local_subscriptions: RwLock<BTreeSet<EventType>>,
    next_message_id: AtomicU64,
    next_connection_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<DeliveredEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveredEvent>>>,
    runtime: Handle,
}

impl ConnectorState {
    pub fn new(
        config: &Config,
        connector: &ConnectorConfig,
        proofs: ProofBook,
        runtime: Handle,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            name: connector.name.clone(),
            port: connector.port,
            node_id: config.node.id,
            role: config.node.role,
            delivery: config.delivery.clone(),
            connections: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            proofs,
            incoming: MasterMessageLedger::new(),
            outgoing: MasterMessageLedger::new(),
            queued: QueuedMessages::default(),
            subscriptions: Subscriptions::default(),
            local_subscriptions: RwLock::new(BTreeSet::new()),
            // seeded from the clock so ids don't repeat after a restart
            next_message_id: AtomicU64::new(Utc::now().timestamp_millis() as u64 & MAX_MESSAGE_ID),
            next_connection_id: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            runtime,
        }
    }

    pub fn proofs(&self) -> &ProofBook {
        &self.proofs
    }

    /// Ids of messages received, for dropping duplicates.
    pub fn incoming(&self) -> &MasterMessageLedger {
        &self.incoming
    }

    /// Ids of messages this connector is delivering.
    pub fn outgoing(&self) -> &MasterMessageLedger {
        &self.outgoing
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn queued(&self) -> &QueuedMessages {
        &self.queued
    }

    fn allocate_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, SeqCst) & MAX_MESSAGE_ID
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<_> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        conns.sort_by_key(|conn| conn.id());
        conns
    }

    fn add_connection(&self, conn: Arc<Connection>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), conn);
    }

    fn remove_connection(&self, conn: &Connection) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn.id());
        if let Some(node) = conn.peer_node() {
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            if nodes.get(&node) == Some(&conn.id()) {
                nodes.remove(&node);
            }
        }
    }

    /// Routes messages for `node` over `conn` from now on.
    pub fn register_node(&self, node: NodeId, conn: &Connection) {
        let previous = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, conn.id());
        match previous {
            Some(previous) if previous != conn.id() => {
                info!(node, conn = conn.id(), previous, "node reconnected")
            }
            _ => debug!(node, conn = conn.id(), "node registered"),
        }
    }

    /// The ready connection to `node`.
    pub fn node_connection(&self, node: NodeId) -> Option<Arc<Connection>> {
        let id = *self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)?;
        self.connection(id).filter(|conn| conn.is_ready())
    }

    /// The ready connection to the cerebrum, on a synapse.
    pub fn upstream(&self) -> Option<Arc<Connection>> {
        self.connections()
            .into_iter()
            .find(|conn| conn.direction() == Direction::Outbound && conn.is_ready())
    }

    pub fn ready_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        nodes.sort_unstable();
        nodes
    }

    /// Queues a message on `conn`. Events for a peer that asked us to pause
    /// are held until it resumes; control messages always go out.
    pub fn transmit(&self, conn: &Connection, mut message: Message) -> bool {
        if message.msg_type().is_event() && conn.is_paused() {
            if let Some(node) = conn.peer_node() {
                let uid = message.uid();
                match self.queued.hold_if(node, message, || conn.is_paused()) {
                    None => {
                        trace!(node, %uid, "peer paused, holding event");
                        return true;
                    }
                    Some(resumed) => message = resumed,
                }
            }
        }
        conn.enqueue(message)
    }

    pub fn send_to_node(&self, node: NodeId, message: Message) -> Result<(), Error> {
        let conn = self.node_connection(node).ok_or(Error::UnknownNode(node))?;
        if self.transmit(&conn, message) {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// The node lifted its pause: send everything held for it, oldest first.
    pub fn resume_transmission(&self, node: NodeId) {
        let conn = self.node_connection(node);
        if let Some(conn) = &conn {
            conn.resume_outbound();
        }
        let held = self.queued.drain(node);
        if held.is_empty() {
            return;
        }
        debug!(node, count = held.len(), "resuming transmission");
        match conn {
            Some(conn) => {
                for message in held {
                    self.transmit(&conn, message);
                }
            }
            // proofs are still in flight; redelivery picks them up once the
            // node is back
            None => debug!(node, "node went away while paused"),
        }
    }

    pub(crate) fn deliver(&self, event: DeliveredEvent) {
        trace!(uid = %event.uid, event_type = event.event_type, "delivering event");
        if self.events_tx.send(event).is_err() {
            debug!("no one is listening for events");
        }
    }

    /// The application's end of the event channel. Can only be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeliveredEvent>> {
        self.events_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Publishes an event. The proof is written before anything is sent, so
    /// the event is delivered even if the node dies right after this returns.
    /// Blocks on the proof store.
    pub fn publish(&self, event_type: EventType, payload: Vec<u8>) -> Result<MessageUid, Error> {
        let uid = MessageUid::new(self.node_id, self.allocate_message_id())?;
        let message = Message::builder()
            .msg_type(MessageType::PublishEvent)
            .event_type(event_type)
            .uid(uid)
            .originating_port(self.port)
            .payload(payload)
            .build()?;
        self.outgoing.record(self.node_id, event_type, uid.message_id);
        match self.role {
            Role::Synapse => {
                let doc = ProofDocument::builder()
                    .kind(ProofKind::Publish)
                    .port(self.port)
                    .producer(self.node_id)
                    .event_type(event_type)
                    .message_id(uid.message_id)
                    .state(DeliveryState::Written.into())
                    .payload(message.payload().to_vec())
                    .build();
                self.proofs.create(doc)?;
                match self.upstream() {
                    Some(conn) => {
                        self.transmit(&conn, message);
                    }
                    None => debug!(%uid, "not connected, publish held for redelivery"),
                }
            }
            Role::Cerebrum => {
                self.incoming.record(self.node_id, event_type, uid.message_id);
                self.fan_out(&message)?;
            }
        }
        Ok(uid)
    }

    /// Relays a published event to each subscriber other than its producer,
    /// then hands it to the application if it subscribed here. A relay proof
    /// is written per subscriber first; an event that already has one for a
    /// subscriber isn't relayed to it again. Returns how many relays were
    /// started.
    pub fn fan_out(&self, message: &Message) -> Result<usize, Error> {
        let producer = message.source_node();
        let relay = Message::builder()
            .msg_type(MessageType::RelayEvent)
            .event_type(message.event_type())
            .uid(message.uid())
            .originating_port(message.originating_port())
            .payload(message.payload())
            .build()?;
        let mut started = 0;
        for node in self.subscriptions.subscribers(message.event_type()) {
            if node == producer || node == self.node_id {
                continue;
            }
            let doc = ProofDocument::builder()
                .kind(ProofKind::Relay)
                .port(self.port)
                .producer(producer)
                .consumer(Some(node))
                .event_type(message.event_type())
                .message_id(message.message_id())
                .state(DeliveryState::Written.into())
                .payload(message.payload().to_vec())
                .build();
            if !self.proofs.create_if_absent(doc)? {
                continue;
            }
            self.outgoing.record(producer, message.event_type(), message.message_id());
            started += 1;
            match self.send_to_node(node, relay.clone()) {
                Ok(()) => {}
                Err(Error::UnknownNode(_)) | Err(Error::ConnectionClosed) => {
                    debug!(node, uid = %message.uid(), "subscriber offline, relay held for redelivery")
                }
                Err(e) => return Err(e),
            }
        }
        if producer != self.node_id && self.is_locally_subscribed(message.event_type()) {
            self.deliver(DeliveredEvent::from(message));
        }
        Ok(started)
    }

    fn is_locally_subscribed(&self, event_type: EventType) -> bool {
        self.local_subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&event_type)
    }

    /// Asks for events of `event_type`. On a synapse the subscription is sent
    /// upstream now if connected and again after every handshake. On the
    /// cerebrum the events are delivered locally.
    pub fn subscribe(&self, event_type: EventType) -> Result<(), Error> {
        let added = self
            .local_subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type);
        if added && self.role == Role::Synapse {
            if let Some(conn) = self.upstream() {
                self.transmit(&conn, self.subscribe_message(event_type)?);
            }
        }
        Ok(())
    }

    fn subscribe_message(&self, event_type: EventType) -> Result<Message, Error> {
        Message::builder()
            .msg_type(MessageType::Subscribe)
            .event_type(event_type)
            .source_node(self.node_id)
            .originating_port(self.port)
            .build()
    }

    /// A connection finished its handshake.
    pub fn on_ready(&self, conn: &Arc<Connection>) -> Result<(), Error> {
        if self.role == Role::Synapse {
            let event_types: Vec<_> = self
                .local_subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .collect();
            for event_type in event_types {
                self.transmit(conn, self.subscribe_message(event_type)?);
            }
        }
        let peer = conn.peer_node().ok_or(Error::NotAuthenticated)?;
        let resent = self.redeliver(Some(peer), false)?;
        if resent > 0 {
            info!(node = peer, resent, "redelivered in-flight messages");
        }
        Ok(())
    }

    /// Retransmits in-flight deliveries: the event itself for proofs still at
    /// WRITTEN, THREE_WAY_ACK for ones that were acknowledged. With `node`
    /// only deliveries to that node are considered; with `stale_only` only
    /// proofs untouched for a full redelivery interval. Returns how many
    /// messages were queued.
    pub fn redeliver(&self, node: Option<NodeId>, stale_only: bool) -> Result<usize, Error> {
        let kind = match self.role {
            Role::Synapse => ProofKind::Publish,
            Role::Cerebrum => ProofKind::Relay,
        };
        let cutoff = Utc::now().timestamp_micros()
            - i64::try_from(self.delivery.redelivery().as_micros()).unwrap_or(i64::MAX);
        let upstream = self.upstream();
        let docs = self.proofs.in_flight(|doc| {
            doc.kind == kind
                && doc.port == self.port
                && (!stale_only || doc.updated_at <= cutoff)
                && (node.is_none() || kind == ProofKind::Publish || doc.consumer == node)
        });
        let mut resent = 0;
        for doc in docs {
            let conn = match kind {
                ProofKind::Publish => upstream.clone(),
                _ => doc.consumer.and_then(|consumer| self.node_connection(consumer)),
            };
            let Some(conn) = conn else {
                continue;
            };
            let msg_type = match doc.delivery_state() {
                Some(DeliveryState::Written) => match kind {
                    ProofKind::Publish => MessageType::PublishEvent,
                    _ => MessageType::RelayEvent,
                },
                Some(DeliveryState::AckReceived) | Some(DeliveryState::ThreeWayAckSent) => {
                    MessageType::ThreeWayAck
                }
                _ => continue,
            };
            let mut builder = Message::builder()
                .msg_type(msg_type)
                .event_type(doc.event_type)
                .uid(doc.uid())
                .originating_port(self.port);
            if msg_type.is_event() {
                builder = builder.payload(doc.payload.clone());
            }
            trace!(key = %doc.key(), ?msg_type, attempts = doc.attempts, "redelivering");
            if self.transmit(&conn, builder.build()?) {
                resent += 1;
            }
        }
        Ok(resent)
    }

    /// Deletes a completed handshake's proof once the grace period is over.
    pub fn schedule_auth_cleanup(self: &Arc<Self>, key: DocumentKey) {
        let state = self.clone();
        let grace = self.delivery.auth_grace();
        self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let removed = tokio::task::spawn_blocking(move || state.proofs.remove(&key)).await;
            match removed {
                Ok(Ok(_)) => trace!("authentication proof removed"),
                Ok(Err(e)) => warn!("failed to remove authentication proof: {}", e),
                Err(e) => error!("authentication cleanup panicked: {}", e),
            }
        });
    }

    /// Warms the cache from the store after a restart: every publish and relay
    /// proof short of DONE is cached and its id replayed into the ledgers,
    /// and leftover handshakes are purged. Returns how many proofs were
    /// restored.
    pub fn rebuild_cache(&self) -> Result<usize, Error> {
        let mut restored = 0;
        let mut last_id = None;
        for kind in [ProofKind::Publish, ProofKind::Relay] {
            let docs = self.proofs.rebuild(&PartitionKey {
                kind,
                port: self.port,
            })?;
            for doc in &docs {
                self.outgoing.record(doc.producer, doc.event_type, doc.message_id);
                if kind == ProofKind::Relay {
                    self.incoming.record(doc.producer, doc.event_type, doc.message_id);
                }
                if doc.producer == self.node_id {
                    last_id = last_id.max(Some(doc.message_id));
                }
            }
            restored += docs.len();
        }
        if let Some(last_id) = last_id {
            self.next_message_id.fetch_max(last_id + 1, SeqCst);
        }
        let purged = self.proofs.purge(&PartitionKey {
            kind: ProofKind::Authentication,
            port: self.port,
        })?;
        info!(port = self.port, restored, purged, "rebuilt proof cache");
        Ok(restored)
    }
}

/// A snapshot of a connector for operators.
#[derive(Clone, Debug)]
pub struct ConnectorStatus {
    pub name: String,
    pub port: u16,
    pub role: Role,
    pub local_addr: Option<SocketAddr>,
    pub connections: Vec<ConnectionStatus>,
    pub readers: PoolStatus,
    pub writers: PoolStatus,
    pub in_flight: usize,
    pub held: usize,
    pub subscriptions: usize,
}

/// One endpoint: a listening port (or an upstream it dials), the
/// connections on it and the pools that handle their messages.
pub struct Connector {
    me: Weak<Connector>,
    state: Arc<ConnectorState>,
    config: ConnectorConfig,
    readers: WorkerPool<Job>,
    writers: WorkerPool<Job>,
    reactors: Arc<ReactorCluster>,
    pressure_check: Duration,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Connector {
    pub fn new(
        config: &Config,
        connector: &ConnectorConfig,
        store: Arc<dyn DocumentStore>,
        reactors: Arc<ReactorCluster>,
        runtime: Handle,
    ) -> Result<Arc<Self>, Error> {
        let proofs = ProofBook::new(store, config.store.retry_policy());
        let state = Arc::new(ConnectorState::new(config, connector, proofs, runtime));
        let receptors = dispatch::receptors(config.node.role, config.auth.credential_key())?;
        let affectors = dispatch::affectors(config.node.role);
        let readers = WorkerPool::new(
            WorkerKind::Reader,
            connector.port,
            config.workers.readers,
            config.workers.queue_capacity,
            Arc::new(ReaderDispatch::new(state.clone(), receptors)),
        )?;
        let writers = WorkerPool::new(
            WorkerKind::Writer,
            connector.port,
            config.workers.writers,
            config.workers.queue_capacity,
            Arc::new(WriterDispatch::new(state.clone(), affectors)),
        )?;
        Ok(Self::assemble(
            state,
            connector,
            readers,
            writers,
            reactors,
            config.workers.pressure_check(),
        ))
    }

    fn assemble(
        state: Arc<ConnectorState>,
        connector: &ConnectorConfig,
        readers: WorkerPool<Job>,
        writers: WorkerPool<Job>,
        reactors: Arc<ReactorCluster>,
        pressure_check: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state,
            config: connector.clone(),
            readers,
            writers,
            reactors,
            pressure_check,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &Arc<ConnectorState> {
        &self.state
    }

    pub fn port(&self) -> u16 {
        self.state.port
    }

    /// Where the listener is bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<DeliveredEvent>> {
        self.state.take_events()
    }

    pub fn publish(&self, event_type: EventType, payload: impl Into<Vec<u8>>) -> Result<MessageUid, Error> {
        self.state.publish(event_type, payload.into())
    }

    pub fn subscribe(&self, event_type: EventType) -> Result<(), Error> {
        self.state.subscribe(event_type)
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = self.state.runtime.spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Starts listening (if configured), dials the upstream (if configured)
    /// and starts the pressure monitor and the redelivery sweep.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let span = debug_span!("connector", port = self.state.port);
        let _guard = span.enter();
        if self.config.listen {
            let listener = std::net::TcpListener::bind((self.config.bind, self.config.port))?;
            let addr = listener.local_addr()?;
            *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
            let reactor = self.reactors.elect()?;
            if let Err(e) = reactor.listen(listener, self.clone()) {
                self.reactors.release(reactor.id());
                return Err(e);
            }
            info!(name = %self.state.name, %addr, role = ?self.state.role, "listening");
        }
        if let Some(upstream) = self.config.upstream {
            let me = self.clone();
            self.spawn_task(async move { me.dial(upstream).await }.in_current_span());
        }

        let me = self.me.clone();
        let interval = self.pressure_check;
        self.spawn_task(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let Some(connector) = me.upgrade() else {
                        break;
                    };
                    connector.relieve_pressure();
                }
            }
            .in_current_span(),
        );

        let state = self.state.clone();
        let interval = self.state.delivery.redelivery();
        self.spawn_task(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let state = state.clone();
                    match tokio::task::spawn_blocking(move || state.redeliver(None, true)).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(resent)) => debug!(resent, "redelivery sweep"),
                        Ok(Err(e)) => warn!("redelivery sweep failed: {}", e),
                        Err(e) => error!("redelivery sweep panicked: {}", e),
                    }
                }
            }
            .in_current_span(),
        );
        Ok(())
    }

    /// Dials `addr` and hands the socket to a reactor. The handshake starts
    /// as soon as the reactor attaches it.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<(), Error> {
        let stream = tokio::net::TcpStream::connect(addr).await?.into_std()?;
        let reactor = self.reactors.elect()?;
        if let Err(e) = reactor.register(stream, Direction::Outbound, self.clone()) {
            self.reactors.release(reactor.id());
            return Err(e);
        }
        debug!(%addr, reactor = reactor.id(), "connected");
        Ok(())
    }

    /// Keeps dialing `addr` until a connection is made.
    async fn dial(self: Arc<Self>, addr: SocketAddr) {
        let delay = self.state.delivery.reconnect();
        while !self.shutting_down.load(SeqCst) {
            match self.connect(addr).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(%addr, "failed to connect: {}. Retrying in {:?}.", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn schedule_reconnect(&self) {
        let Some(addr) = self.config.upstream else {
            return;
        };
        if self.shutting_down.load(SeqCst) {
            return;
        }
        let me = self.me.clone();
        let delay = self.state.delivery.reconnect();
        info!(%addr, "upstream lost, reconnecting in {:?}", delay);
        self.state.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(connector) = me.upgrade() {
                connector.dial(addr).await;
            }
        });
    }

    /// Asks the peer on `conn` to stop sending events. Sent once until the
    /// pressure monitor sends RESUME_TRANSMISSION.
    pub fn signal_pause_transmission(&self, conn: &Connection) {
        if !conn.try_initiate_backpressure() {
            return;
        }
        warn!(conn = conn.id(), peer = ?conn.peer_node(), "pausing peer");
        match self.control_message(MessageType::PauseTransmission) {
            Ok(pause) => {
                conn.enqueue(pause);
            }
            Err(e) => error!("failed to build PAUSE_TRANSMISSION: {}", e),
        }
    }

    fn control_message(&self, msg_type: MessageType) -> Result<Message, Error> {
        Message::builder()
            .msg_type(msg_type)
            .source_node(self.state.node_id)
            .originating_port(self.state.port)
            .build()
    }

    /// Retries rejected jobs and, once both pools have drained, ends the
    /// backpressure episode by resuming every peer we paused.
    pub fn relieve_pressure(&self) {
        let retried = self.readers.retry_rejected() + self.writers.retry_rejected();
        if retried > 0 {
            trace!(retried, "retried rejected jobs");
        }
        if !(self.readers.is_relieved() && self.writers.is_relieved()) {
            return;
        }
        self.readers.clear_backpressure();
        self.writers.clear_backpressure();
        for conn in self.state.connections() {
            if !conn.clear_backpressure() {
                continue;
            }
            info!(conn = conn.id(), peer = ?conn.peer_node(), "resuming peer");
            match self.control_message(MessageType::ResumeTransmission) {
                Ok(resume) => {
                    conn.enqueue(resume);
                }
                Err(e) => error!("failed to build RESUME_TRANSMISSION: {}", e),
            }
        }
    }

    fn submit(&self, pool: &WorkerPool<Job>, conn: &Arc<Connection>, messages: Vec<Message>) {
        for message in messages {
            let job = Job {
                message,
                connection: conn.clone(),
            };
            match pool.submit(job) {
                Submission::Accepted => {}
                Submission::Rejected { .. } => self.signal_pause_transmission(conn),
                Submission::Closed => {
                    debug!(kind = %pool.kind(), "pool closed, dropping job");
                    return;
                }
            }
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            name: self.state.name.clone(),
            port: self.state.port,
            role: self.state.role,
            local_addr: self.local_addr(),
            connections: self
                .state
                .connections()
                .iter()
                .map(|conn| conn.status())
                .collect(),
            readers: self.readers.status(),
            writers: self.writers.status(),
            in_flight: self
                .state
                .proofs
                .in_flight(|doc| doc.kind != ProofKind::Authentication)
                .len(),
            held: self.state.queued.len(),
            subscriptions: self.state.subscriptions.len(),
        }
    }

    /// Stops background tasks, closes every connection and drains the pools.
    /// Blocks until the workers are done.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, SeqCst) {
            return;
        }
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        for conn in self.state.connections() {
            conn.close();
        }
        self.readers.shutdown();
        self.writers.shutdown();
        info!(port = self.state.port, "connector stopped");
    }
}

impl IoHandler for Connector {
    fn accept_connection(self: Arc<Self>, stream: std::net::TcpStream, remote: SocketAddr) {
        if self.shutting_down.load(SeqCst) {
            return;
        }
        let reactor = match self.reactors.elect() {
            Ok(reactor) => reactor,
            Err(e) => {
                error!(%remote, "Can't assign a reactor: {}. Ignoring.", e);
                return;
            }
        };
        let id = reactor.id();
        if let Err(e) = reactor.register(stream, Direction::Inbound, self.clone()) {
            warn!(%remote, "Failed to register socket: {}. Ignoring.", e);
            self.reactors.release(id);
        }
    }

    fn attach(
        &self,
        stream: tokio::net::TcpStream,
        direction: Direction,
        reactor: usize,
    ) -> Result<Arc<Connection>, Error> {
        let id = self.state.next_connection_id.fetch_add(1, SeqCst);
        let conn = Arc::new(Connection::new(
            id,
            direction,
            stream,
            self.state.port,
            reactor,
            self.config.max_payload,
        )?);
        self.state.add_connection(conn.clone());
        info!(conn = id, remote = %conn.remote_addr(), ?direction, reactor, "connection opened");
        if direction == Direction::Outbound {
            if let Err(e) = handshake::begin(&self.state, &conn) {
                self.state.remove_connection(&conn);
                return Err(e);
            }
        }
        Ok(conn)
    }

    fn on_readable(&self, conn: &Arc<Connection>, messages: Vec<Message>) {
        self.submit(&self.readers, conn, messages);
    }

    fn on_writable(&self, conn: &Arc<Connection>, messages: Vec<Message>) {
        self.submit(&self.writers, conn, messages);
    }

    fn release(&self, conn: &Arc<Connection>) {
        self.state.remove_connection(conn);
        self.reactors.release(conn.reactor());
        info!(conn = conn.id(), peer = ?conn.peer_node(), "connection closed");
        if conn.direction() == Direction::Outbound {
            self.schedule_reconnect();
        }
    }

    fn abandon(&self, reactor: usize, direction: Direction) {
        self.reactors.release(reactor);
        if direction == Direction::Outbound {
            self.schedule_reconnect();
        }
    }
}

/// Every connector in the process, by port, and the reactors they share.
pub struct ConnectorCluster {
    connectors: BTreeMap<u16, Arc<Connector>>,
    reactors: Arc<ReactorCluster>,
}

impl ConnectorCluster {
    pub fn new(config: &Config, runtime: Handle) -> Result<Self, Error> {
        let reactors = Arc::new(ReactorCluster::new(
            config.reactors.count(),
            config.reactors.backoff(),
        )?);
        let store: Arc<dyn DocumentStore> = match &config.store.path {
            Some(path) => Arc::new(FileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        let mut connectors = BTreeMap::new();
        for connector in &config.connectors {
            let built = Connector::new(
                config,
                connector,
                store.clone(),
                reactors.clone(),
                runtime.clone(),
            )?;
            connectors.insert(connector.port, built);
        }
        Ok(Self {
            connectors,
            reactors,
        })
    }

    pub fn get(&self, port: u16) -> Option<&Arc<Connector>> {
        self.connectors.get(&port)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Arc<Connector>> {
        self.connectors.values()
    }

    pub fn reactor_loads(&self) -> Vec<ReactorLoad> {
        self.reactors.loads()
    }

    /// Rebuilds every connector's cache from the store, then starts it.
    pub async fn start(&self) -> Result<(), Error> {
        for connector in self.connectors.values() {
            let state = connector.state().clone();
            tokio::task::spawn_blocking(move || state.rebuild_cache())
                .await
                .map_err(|e| Error::ReactorCluster(format!("cache rebuild panicked: {}", e)))??;
            connector.start()?;
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<ConnectorStatus> {
        self.connectors.values().map(|c| c.status()).collect()
    }

    pub async fn shutdown(&self) {
        for connector in self.connectors.values() {
            let connector = connector.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || connector.shutdown()).await {
                error!("connector shutdown panicked: {}", e);
            }
        }
        let reactors = self.reactors.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || reactors.shutdown()).await {
            error!("reactor shutdown panicked: {}", e);
        }
    }
}
