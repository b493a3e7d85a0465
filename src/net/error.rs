use std::io;

use thiserror::Error;

use super::{wire::MessageType, NodeId};
use crate::proof::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// Fewer than a full header was available, or the header declares a
    /// payload the stream can't carry.
    #[error("malformed header ({available} bytes available)")]
    MalformedHeader { available: usize },
    #[error("invalid message type {0:#04x}")]
    InvalidMessageType(u8),
    #[error("could not instantiate handler for {message_type:?}: {reason}")]
    HandlerInstantiation {
        message_type: MessageType,
        reason: String,
    },
    #[error("invalid message uid {0:?}")]
    InvalidMessageUid(String),
    #[error("authentication with node {node} failed: {reason}")]
    AuthenticationFailed { node: NodeId, reason: &'static str },
    #[error("connection has not completed authentication")]
    NotAuthenticated,
    #[error("no ready connection to node {0}")]
    UnknownNode(NodeId),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("reactor cluster: {0}")]
    ReactorCluster(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
