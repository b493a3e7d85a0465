pub mod connection;
pub mod connector;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod reactor;
#[cfg(test)]
pub(crate) mod testing;
pub mod wire;
pub mod worker;

/// Stable numeric id of a node on the network.
pub type NodeId = u16;

/// Application defined event type carried in every message header.
pub type EventType = u8;

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 24;

/// Message ids are 48 bits on the wire.
pub const MAX_MESSAGE_ID: u64 = (1 << 48) - 1;

pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

pub const CEREBRUM_PORT: u16 = 597; // "CEREBRUM" in ascii, summed
