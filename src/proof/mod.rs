//! Delivery proofs are the persisted half of the exactly-once guarantee. A
//! proof is written before a message leaves the node and is walked up a
//! ladder of states as the peer confirms it. States only ever increase, so
//! replaying an acknowledgement is harmless, and anything still below the
//! terminal state after a restart is redelivered.

use std::fmt;

use chrono::Utc;
use rkyv::{Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::net::{wire::MessageUid, EventType, NodeId};

pub mod book;
pub mod cache;
pub mod ledger;
pub mod store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
#[repr(u8)]
pub enum ProofKind {
    /// Kept by the node that published an event.
    Publish,
    /// Kept by the cerebrum for each subscriber it forwards an event to.
    Relay,
    /// Kept by both ends while a connection authenticates.
    Authentication,
}

impl ProofKind {
    /// The state at which a document is complete and no longer stored. Auth
    /// proofs have none, they are deleted on a timer instead.
    pub fn terminal_state(&self) -> Option<u8> {
        match self {
            ProofKind::Publish | ProofKind::Relay => Some(DeliveryState::Done.into()),
            ProofKind::Authentication => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProofKind::Publish => "publish",
            ProofKind::Relay => "relay",
            ProofKind::Authentication => "authentication",
        }
    }
}

impl fmt::Display for ProofKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The publish and relay ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeliveryState {
    /// Persisted, transmission pending or in progress.
    Written = 1,
    /// The consumer acknowledged it.
    AckReceived = 2,
    /// We told the consumer we've seen the ack.
    ThreeWayAckSent = 3,
    Done = 4,
}

impl From<DeliveryState> for u8 {
    fn from(state: DeliveryState) -> Self {
        state as u8
    }
}

impl DeliveryState {
    pub fn from_u8(state: u8) -> Option<Self> {
        Some(match state {
            1 => DeliveryState::Written,
            2 => DeliveryState::AckReceived,
            3 => DeliveryState::ThreeWayAckSent,
            4 => DeliveryState::Done,
            _ => return None,
        })
    }
}

/// The authentication handshake ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AuthState {
    Startup = 1,
    Credentials = 2,
    ReadyConfirmed = 3,
}

impl From<AuthState> for u8 {
    fn from(state: AuthState) -> Self {
        state as u8
    }
}

/// When a document reached a state, in microseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct StateStamp {
    pub state: u8,
    pub at: i64,
}

/// A persisted delivery proof. The same shape serves all three kinds; which
/// state ladder `state` follows depends on `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, TypedBuilder)]
#[archive(check_bytes)]
pub struct ProofDocument {
    pub kind: ProofKind,
    /// Port of the connector that owns the document.
    pub port: u16,
    /// Node that created the message (or initiated the handshake).
    pub producer: NodeId,
    /// Node the message is being delivered to, when it's tracked per
    /// consumer.
    #[builder(default)]
    pub consumer: Option<NodeId>,
    #[builder(default)]
    pub event_type: EventType,
    pub message_id: u64,
    pub state: u8,
    /// Times the message has been handed to the socket.
    #[builder(default)]
    pub attempts: u32,
    /// The event itself for publish and relay proofs, the challenge for auth
    /// proofs.
    #[builder(default)]
    pub payload: Vec<u8>,
    #[builder(default = Utc::now().timestamp_micros())]
    pub created_at: i64,
    #[builder(default = Utc::now().timestamp_micros())]
    pub updated_at: i64,
    #[builder(default)]
    pub timeline: Vec<StateStamp>,
}

impl ProofDocument {
    pub fn uid(&self) -> MessageUid {
        MessageUid {
            source_node: self.producer,
            message_id: self.message_id,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            kind: self.kind,
            port: self.port,
            consumer: self.consumer,
            uid: self.uid(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind
            .terminal_state()
            .map_or(false, |terminal| self.state >= terminal)
    }

    pub fn delivery_state(&self) -> Option<DeliveryState> {
        match self.kind {
            ProofKind::Authentication => None,
            _ => DeliveryState::from_u8(self.state),
        }
    }

    /// Moves the document to `state` if that's further along the ladder.
    /// Returns false and leaves the document untouched otherwise.
    pub fn advance(&mut self, state: impl Into<u8>) -> bool {
        let state = state.into();
        if state <= self.state {
            return false;
        }
        let now = Utc::now().timestamp_micros();
        self.state = state;
        self.updated_at = now;
        self.timeline.push(StateStamp { state, at: now });
        true
    }

    /// Records another transmission of the message.
    pub fn stamp_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = Utc::now().timestamp_micros();
    }
}

/// Identifies a document: which connector owns it, who it's being delivered
/// to, and the message it tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub kind: ProofKind,
    pub port: u16,
    pub consumer: Option<NodeId>,
    pub uid: MessageUid,
}

impl DocumentKey {
    pub fn publish(port: u16, uid: MessageUid) -> Self {
        Self {
            kind: ProofKind::Publish,
            port,
            consumer: None,
            uid,
        }
    }

    pub fn relay(port: u16, consumer: NodeId, uid: MessageUid) -> Self {
        Self {
            kind: ProofKind::Relay,
            port,
            consumer: Some(consumer),
            uid,
        }
    }

    /// Both ends key a handshake by the synapse that initiated it.
    pub fn authentication(port: u16, initiator: NodeId, uid: MessageUid) -> Self {
        Self {
            kind: ProofKind::Authentication,
            port,
            consumer: Some(initiator),
            uid,
        }
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey {
            kind: self.kind,
            port: self.port,
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.consumer {
            Some(consumer) => write!(f, "{}:{}>{}/{}", self.kind, self.port, consumer, self.uid),
            None => write!(f, "{}:{}/{}", self.kind, self.port, self.uid),
        }
    }
}

/// Documents are partitioned by kind and owning port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub kind: ProofKind,
    pub port: u16,
}
