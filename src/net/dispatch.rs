use std::sync::Arc;

use tracing::{trace, warn};

use super::{
    connection::{Connection, ConnectionState},
    connector::ConnectorState,
    delivery::{
        AckReceptor, ControlAffector, PauseReceptor, PublishReceptor, RelayReceptor,
        ResumeReceptor, SubscribeReceptor, ThreeWayAckAffector, ThreeWayAckReceptor,
        TransmissionAffector,
    },
    error::Error,
    handshake::{
        ChallengeReceptor, CredentialsAffector, CredentialsReceptor, ReadyConfirmedAffector,
        ReadyConfirmedReceptor, StartupAffector, StartupReceptor,
    },
    wire::{Message, MessageType},
    worker::Dispatch,
};
use crate::config::Role;

/// A message and the connection it was read from or written to.
pub struct Job {
    pub message: Message,
    pub connection: Arc<Connection>,
}

/// Handles a message of one type after it has been read.
pub trait Receptor: Send + Sync {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error>;
}

/// Handles a message of one type after it has been written.
pub trait Affector: Send + Sync {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error>;
}

/// Handlers indexed by message type byte. Built once per connector and never
/// modified afterwards.
pub struct Registry<H: ?Sized> {
    handlers: Vec<Option<Box<H>>>,
}

impl<H: ?Sized> Registry<H> {
    fn new() -> Self {
        let len = MessageType::ALL
            .iter()
            .map(|t| t.byte() as usize + 1)
            .max()
            .unwrap_or_default();
        Self {
            handlers: (0..len).map(|_| None).collect(),
        }
    }

    fn with(mut self, message_type: MessageType, handler: Box<H>) -> Self {
        self.handlers[message_type.byte() as usize] = Some(handler);
        self
    }

    pub fn lookup(&self, type_byte: u8) -> Result<&H, Error> {
        self.handlers
            .get(type_byte as usize)
            .and_then(|handler| handler.as_deref())
            .ok_or(Error::InvalidMessageType(type_byte))
    }

    /// Types with a registered handler.
    pub fn types(&self) -> Vec<MessageType> {
        MessageType::ALL
            .into_iter()
            .filter(|t| self.lookup(t.byte()).is_ok())
            .collect()
    }
}

/// The receptors for `role`. Handlers that verify or answer challenges need
/// the credential key.
pub fn receptors(
    role: Role,
    credential_key: Option<[u8; 32]>,
) -> Result<Registry<dyn Receptor>, Error> {
    use MessageType::*;
    let common = Registry::<dyn Receptor>::new()
        .with(Ack, Box::new(AckReceptor))
        .with(ThreeWayAck, Box::new(ThreeWayAckReceptor))
        .with(PauseTransmission, Box::new(PauseReceptor))
        .with(ResumeTransmission, Box::new(ResumeReceptor));
    Ok(match role {
        Role::Cerebrum => common
            .with(Startup, Box::new(StartupReceptor))
            .with(Credentials, Box::new(CredentialsReceptor::new(credential_key)?))
            .with(PublishEvent, Box::new(PublishReceptor))
            .with(Subscribe, Box::new(SubscribeReceptor)),
        Role::Synapse => common
            .with(Startup, Box::new(ChallengeReceptor::new(credential_key)?))
            .with(ReadyConfirmed, Box::new(ReadyConfirmedReceptor))
            .with(RelayEvent, Box::new(RelayReceptor)),
    })
}

pub fn affectors(role: Role) -> Registry<dyn Affector> {
    use MessageType::*;
    let common = Registry::<dyn Affector>::new()
        .with(Ack, Box::new(ControlAffector))
        .with(ThreeWayAck, Box::new(ThreeWayAckAffector))
        .with(PauseTransmission, Box::new(ControlAffector))
        .with(ResumeTransmission, Box::new(ControlAffector));
    match role {
        Role::Cerebrum => common
            .with(Startup, Box::new(ControlAffector))
            .with(ReadyConfirmed, Box::new(ReadyConfirmedAffector))
            .with(RelayEvent, Box::new(TransmissionAffector)),
        Role::Synapse => common
            .with(Startup, Box::new(StartupAffector))
            .with(Credentials, Box::new(CredentialsAffector))
            .with(PublishEvent, Box::new(TransmissionAffector))
            .with(Subscribe, Box::new(ControlAffector)),
    }
}

/// Runs receptors on the reader pool. Only handshake messages get through
/// before a connection is ready, and nothing gets through once its
/// authentication failed.
pub struct ReaderDispatch {
    state: Arc<ConnectorState>,
    receptors: Registry<dyn Receptor>,
}

impl ReaderDispatch {
    pub fn new(state: Arc<ConnectorState>, receptors: Registry<dyn Receptor>) -> Self {
        Self { state, receptors }
    }
}

impl Dispatch<Job> for ReaderDispatch {
    fn dispatch(&self, job: Job) -> Result<(), Error> {
        let Job {
            message,
            connection: conn,
        } = job;
        match conn.state() {
            ConnectionState::AuthFailed => {
                trace!(conn = conn.id(), "dropping {} on failed connection", message);
                return Ok(());
            }
            ConnectionState::PendingAuth if !message.msg_type().is_handshake() => {
                warn!(conn = conn.id(), "Received {} before authentication. Ignoring.", message);
                return Err(Error::NotAuthenticated);
            }
            _ => {}
        }
        let receptor = self.receptors.lookup(message.msg_type().byte()).map_err(|e| {
            warn!(conn = conn.id(), "No receptor for {}. Ignoring.", message);
            e
        })?;
        let in_flight = conn.metrics().begin();
        match receptor.execute(&self.state, &message, &conn) {
            Ok(()) => {
                in_flight.succeed();
                Ok(())
            }
            Err(e) => {
                warn!(conn = conn.id(), "Receptor for {} failed: {}", message, e);
                Err(e)
            }
        }
    }
}

/// Runs affectors on the writer pool.
pub struct WriterDispatch {
    state: Arc<ConnectorState>,
    affectors: Registry<dyn Affector>,
}

impl WriterDispatch {
    pub fn new(state: Arc<ConnectorState>, affectors: Registry<dyn Affector>) -> Self {
        Self { state, affectors }
    }
}

impl Dispatch<Job> for WriterDispatch {
    fn dispatch(&self, job: Job) -> Result<(), Error> {
        let Job {
            message,
            connection: conn,
        } = job;
        let affector = self.affectors.lookup(message.msg_type().byte()).map_err(|e| {
            warn!(conn = conn.id(), "No affector for {}. Ignoring.", message);
            e
        })?;
        affector
            .execute(&self.state, &message, &conn)
            .map_err(|e| {
                warn!(conn = conn.id(), "Affector for {} failed: {}", message, e);
                e
            })
    }
}
