//! Fixtures shared by the handler and connector tests.

use std::sync::Arc;

use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
};

use super::{
    connection::{Connection, Direction},
    connector::ConnectorState,
    wire::{Message, MessageType},
    NodeId,
};
use crate::{
    config::{Config, ConnectorConfig, Role},
    proof::{
        book::ProofBook,
        store::{DocumentStore, MemoryStore, RetryPolicy},
    },
};

pub const PORT: u16 = 4100;

/// A dialed connection (id 1) and the accepted end of it (id 2).
pub async fn pair() -> (Arc<Connection>, Arc<Connection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = Connection::new(1, Direction::Outbound, client.unwrap(), PORT, 0, 1024).unwrap();
    let server = Connection::new(2, Direction::Inbound, accepted.unwrap().0, PORT, 0, 1024).unwrap();
    (Arc::new(client), Arc::new(server))
}

pub fn config(role: Role, node: NodeId) -> Config {
    let mut config = Config::from_yaml("auth: {shared_secret: hunter2}").unwrap();
    config.node.id = node;
    config.node.role = role;
    config
}

/// Connector state over an in-memory store. Needs a runtime.
pub fn state(role: Role, node: NodeId) -> Arc<ConnectorState> {
    state_with_store(role, node, Arc::new(MemoryStore::new()))
}

pub fn state_with_store(
    role: Role,
    node: NodeId,
    store: Arc<dyn DocumentStore>,
) -> Arc<ConnectorState> {
    let config = config(role, node);
    let connector = ConnectorConfig {
        port: PORT,
        ..ConnectorConfig::default()
    };
    let proofs = ProofBook::new(store, RetryPolicy::default());
    Arc::new(ConnectorState::new(&config, &connector, proofs, Handle::current()))
}

pub fn types(messages: &[Message]) -> Vec<MessageType> {
    messages.iter().map(Message::msg_type).collect()
}
