//! The authentication handshake.
//!
//! ```text
//! synapse                                cerebrum
//!    | -- STARTUP ---------------------------> |  proof at STARTUP, challenge
//!    | <--------------------------- STARTUP -- |  (carries the challenge)
//!    | -- CREDENTIALS -----------------------> |  MAC checked, proof at CREDENTIALS
//!    | <-------------------- READY_CONFIRMED -- |  proof at READYCONFIRMED
//! ```
//!
//! Both ends keep a ProofOfAuthentication keyed by the synapse and the
//! synapse's connection id, which travels as the message id of every
//! handshake message. Each step only ever moves the proof forward, and the
//! proof is deleted a little while after the handshake completes.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::{
    connection::{Connection, ConnectionState},
    connector::ConnectorState,
    dispatch::{Affector, Receptor},
    error::Error,
    wire::{Message, MessageType, MessageUid},
    NodeId,
};
use crate::{
    hex::HexDisplayExt,
    proof::{book::Advance, AuthState, DocumentKey, ProofDocument, ProofKind},
};

pub const CHALLENGE_LEN: usize = 32;

/// The CREDENTIALS payload: a MAC over the challenge and the answering node,
/// keyed with the key derived from the shared secret.
pub fn credential_mac(key: &[u8; 32], challenge: &[u8], node: NodeId) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(challenge);
    hasher.update(&node.to_le_bytes());
    hasher.finalize()
}

fn auth_key(state: &ConnectorState, initiator: NodeId, id: u64) -> DocumentKey {
    DocumentKey::authentication(
        state.port,
        initiator,
        MessageUid {
            source_node: initiator,
            message_id: id,
        },
    )
}

fn handshake_message(
    state: &ConnectorState,
    msg_type: MessageType,
    id: u64,
    payload: Vec<u8>,
) -> Result<Message, Error> {
    Message::builder()
        .msg_type(msg_type)
        .source_node(state.node_id)
        .message_id(id)
        .originating_port(state.port)
        .payload(payload)
        .build()
}

fn missing_key(message_type: MessageType) -> Error {
    Error::HandlerInstantiation {
        message_type,
        reason: "no shared secret configured".into(),
    }
}

/// Opens the handshake on a connection we dialed.
pub fn begin(state: &ConnectorState, conn: &Connection) -> Result<(), Error> {
    let startup = handshake_message(state, MessageType::Startup, conn.id(), Vec::new())?;
    debug!(conn = conn.id(), "starting handshake");
    if !conn.enqueue(startup) {
        return Err(Error::ConnectionClosed);
    }
    Ok(())
}

/// Moves an auth proof forward, treating a missing proof as a handshake that
/// already completed.
fn advance(state: &ConnectorState, key: &DocumentKey, to: AuthState) -> Result<(), Error> {
    match state.proofs().advance(key, to)? {
        Advance::NotFound => warn!(%key, "Authentication proof not found. Ignoring."),
        Advance::Unchanged(_) => trace!(%key, "authentication proof already at {:?}", to),
        Advance::Advanced(_) => trace!(%key, "authentication proof at {:?}", to),
    }
    Ok(())
}

/// Ends a handshake that can't succeed: the connection is failed for good,
/// its auth proof dropped and the socket closed.
fn reject(
    state: &ConnectorState,
    conn: &Connection,
    key: &DocumentKey,
    node: NodeId,
    reason: &'static str,
) -> Error {
    warn!(conn = conn.id(), node, "authentication failed: {}", reason);
    conn.fail_auth();
    if let Err(e) = state.proofs().remove(key) {
        warn!(%key, "failed to remove authentication proof: {}. Ignoring.", e);
    }
    conn.close();
    Error::AuthenticationFailed { node, reason }
}

fn complete(state: &Arc<ConnectorState>, key: DocumentKey, conn: &Arc<Connection>) -> Result<(), Error> {
    advance(state, &key, AuthState::ReadyConfirmed)?;
    state.schedule_auth_cleanup(key);
    info!(conn = conn.id(), peer = ?conn.peer_node(), "handshake complete");
    state.on_ready(conn)
}

// synapse side

/// Records the handshake once STARTUP is on the wire.
pub struct StartupAffector;

impl Affector for StartupAffector {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        _message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let doc = ProofDocument::builder()
            .kind(ProofKind::Authentication)
            .port(state.port)
            .producer(state.node_id)
            .consumer(Some(state.node_id))
            .message_id(conn.id())
            .state(AuthState::Startup.into())
            .build();
        state.proofs().create_if_absent(doc)?;
        Ok(())
    }
}

/// Answers the cerebrum's challenge.
pub struct ChallengeReceptor {
    key: [u8; 32],
}

impl ChallengeReceptor {
    pub fn new(key: Option<[u8; 32]>) -> Result<Self, Error> {
        key.map(|key| Self { key })
            .ok_or_else(|| missing_key(MessageType::Startup))
    }
}

impl Receptor for ChallengeReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let peer = message.source_node();
        let key = auth_key(state, state.node_id, conn.id());
        if message.payload().len() != CHALLENGE_LEN {
            return Err(reject(state, conn, &key, peer, "malformed challenge"));
        }
        if !conn.set_peer_node(peer) {
            return Err(reject(state, conn, &key, peer, "challenge from a different node"));
        }
        let mac = credential_mac(&self.key, message.payload(), state.node_id);
        let credentials = handshake_message(
            state,
            MessageType::Credentials,
            conn.id(),
            mac.as_bytes().to_vec(),
        )?;
        trace!(conn = conn.id(), peer, challenge = %message.payload().hex(), "answering challenge");
        state.transmit(conn, credentials);
        Ok(())
    }
}

pub struct CredentialsAffector;

impl Affector for CredentialsAffector {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        _message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        advance(state, &auth_key(state, state.node_id, conn.id()), AuthState::Credentials)
    }
}

pub struct ReadyConfirmedReceptor;

impl Receptor for ReadyConfirmedReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let peer = message.source_node();
        let key = auth_key(state, state.node_id, conn.id());
        if conn.peer_node() != Some(peer) {
            return Err(reject(state, conn, &key, peer, "confirmation from a different node"));
        }
        if !conn.set_ready() {
            debug!(conn = conn.id(), "Duplicate READY_CONFIRMED. Ignoring.");
            return Ok(());
        }
        state.register_node(peer, conn);
        complete(state, key, conn)
    }
}

// cerebrum side

/// Issues a challenge to a synapse that opened a handshake.
pub struct StartupReceptor;

impl Receptor for StartupReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let peer = message.source_node();
        if conn.state() != ConnectionState::PendingAuth {
            warn!(conn = conn.id(), peer, "STARTUP on an authenticated connection. Ignoring.");
            return Ok(());
        }
        if !conn.set_peer_node(peer) {
            // the challenge issued to the node that opened the handshake
            let opened_by = conn.peer_node().unwrap_or(peer);
            let key = auth_key(state, opened_by, message.message_id());
            return Err(reject(state, conn, &key, peer, "STARTUP from a different node"));
        }
        let key = auth_key(state, peer, message.message_id());
        // a repeated STARTUP gets the challenge already issued
        let challenge = match state.proofs().load(&key)? {
            Some(doc) => doc.payload,
            None => {
                let challenge = rand::random::<[u8; CHALLENGE_LEN]>().to_vec();
                let doc = ProofDocument::builder()
                    .kind(ProofKind::Authentication)
                    .port(state.port)
                    .producer(peer)
                    .consumer(Some(peer))
                    .message_id(message.message_id())
                    .state(AuthState::Startup.into())
                    .payload(challenge.clone())
                    .build();
                state.proofs().create(doc)?;
                challenge
            }
        };
        let reply = handshake_message(state, MessageType::Startup, message.message_id(), challenge)?;
        trace!(conn = conn.id(), peer, "issuing challenge");
        state.transmit(conn, reply);
        Ok(())
    }
}

/// Verifies a synapse's answer. A wrong answer fails the connection for
/// good.
pub struct CredentialsReceptor {
    key: [u8; 32],
}

impl CredentialsReceptor {
    pub fn new(key: Option<[u8; 32]>) -> Result<Self, Error> {
        key.map(|key| Self { key })
            .ok_or_else(|| missing_key(MessageType::Credentials))
    }
}

impl Receptor for CredentialsReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let peer = message.source_node();
        let key = auth_key(state, peer, message.message_id());
        let verdict = match state.proofs().load(&key)? {
            _ if conn.peer_node() != Some(peer) => Err("credentials from a different node"),
            None => Err("no challenge was issued"),
            Some(doc) => match <[u8; 32]>::try_from(message.payload()) {
                Ok(mac) if blake3::Hash::from(mac) == credential_mac(&self.key, &doc.payload, peer) => {
                    Ok(())
                }
                _ => Err("credentials do not match"),
            },
        };
        if let Err(reason) = verdict {
            let opened_by = conn.peer_node().unwrap_or(peer);
            let key = auth_key(state, opened_by, message.message_id());
            return Err(reject(state, conn, &key, peer, reason));
        }

        advance(state, &key, AuthState::Credentials)?;
        if !conn.set_ready() {
            debug!(conn = conn.id(), "Duplicate CREDENTIALS. Ignoring.");
            return Ok(());
        }
        state.register_node(peer, conn);
        let confirm = handshake_message(state, MessageType::ReadyConfirmed, message.message_id(), Vec::new())?;
        state.transmit(conn, confirm);
        Ok(())
    }
}

pub struct ReadyConfirmedAffector;

impl Affector for ReadyConfirmedAffector {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let peer = conn.peer_node().ok_or(Error::NotAuthenticated)?;
        complete(state, auth_key(state, peer, message.message_id()), conn)
    }
}
