pub mod config;
pub mod hex;
pub mod net;
pub mod proof;

pub use config::{Config, ConfigError, Role};
pub use net::{
    connector::{Connector, ConnectorCluster, DeliveredEvent},
    error::Error,
    wire::{Message, MessageType, MessageUid},
    EventType, NodeId,
};

// A cerebrum is the hub of the network. Synapses keep one connection to it,
// publish events over that connection and receive the events they subscribed
// to back over it. Every hop of every event is tracked by a proof document
// that is written before the message leaves the node, so a crash at any point
// ends with the event delivered exactly once after both ends come back.
//
// I/O and message handling are kept apart. Reactor threads only move bytes
// between sockets and connection buffers. Decoded messages are handed to
// reader pools and flushed ones to writer pools, and a saturated pool tells
// the peer to stop sending until it has caught up.
