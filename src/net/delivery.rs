use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{
    connection::Connection,
    connector::{ConnectorState, DeliveredEvent},
    dispatch::{Affector, Receptor},
    error::Error,
    wire::{Message, MessageType},
};
use crate::{
    config::Role,
    proof::{book::Advance, DeliveryState, DocumentKey},
};

/// The proof a delivery message refers to: the publish proof on a synapse,
/// the relay proof for the peer on the cerebrum.
fn proof_key(state: &ConnectorState, message: &Message, conn: &Connection) -> Result<DocumentKey, Error> {
    Ok(match state.role {
        Role::Synapse => DocumentKey::publish(state.port, message.uid()),
        Role::Cerebrum => {
            let peer = conn.peer_node().ok_or(Error::NotAuthenticated)?;
            DocumentKey::relay(state.port, peer, message.uid())
        }
    })
}

fn reply(state: &ConnectorState, msg_type: MessageType, to: &Message) -> Result<Message, Error> {
    Message::builder()
        .msg_type(msg_type)
        .event_type(to.event_type())
        .uid(to.uid())
        .originating_port(state.port)
        .build()
}

/// Cerebrum: an event from a synapse. Relayed to every subscriber the first
/// time it's seen, acknowledged every time.
pub struct PublishReceptor;

impl Receptor for PublishReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let (producer, event_type, id) = (message.source_node(), message.event_type(), message.message_id());
        if state.incoming().record(producer, event_type, id) {
            match state.fan_out(message) {
                Ok(relayed) => trace!(uid = %message.uid(), relayed, "relayed publish"),
                Err(e) => {
                    // unacknowledged, so the producer retransmits
                    state.incoming().forget(producer, event_type, id);
                    return Err(e);
                }
            }
        } else {
            debug!(uid = %message.uid(), "duplicate publish, acknowledging again");
        }
        state.transmit(conn, reply(state, MessageType::Ack, message)?);
        Ok(())
    }
}

/// Synapse: an event we subscribed to. Handed to the application once,
/// acknowledged every time.
pub struct RelayReceptor;

impl Receptor for RelayReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        if state
            .incoming()
            .record(message.source_node(), message.event_type(), message.message_id())
        {
            state.deliver(DeliveredEvent::from(message));
        } else {
            debug!(uid = %message.uid(), "duplicate relay, acknowledging again");
        }
        state.transmit(conn, reply(state, MessageType::Ack, message)?);
        Ok(())
    }
}

/// The peer has the event. Moves the proof to ACK_RECEIVED and tells the
/// peer we know, which is repeated for every duplicate ACK so a lost
/// THREE_WAY_ACK doesn't leave the peer waiting.
pub struct AckReceptor;

impl Receptor for AckReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let key = proof_key(state, message, conn)?;
        match state.proofs().advance(&key, DeliveryState::AckReceived)? {
            Advance::NotFound => {
                warn!(%key, "Proof not found for ACK. Ignoring.");
                return Ok(());
            }
            Advance::Unchanged(doc) => {
                debug!(%key, state = doc.state, "duplicate ACK");
            }
            Advance::Advanced(_) => trace!(%key, "ack received"),
        }
        state.transmit(conn, reply(state, MessageType::ThreeWayAck, message)?);
        Ok(())
    }
}

/// THREE_WAY_ACK is on the wire, which completes the delivery.
pub struct ThreeWayAckAffector;

impl Affector for ThreeWayAckAffector {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let key = proof_key(state, message, conn)?;
        for step in [DeliveryState::ThreeWayAckSent, DeliveryState::Done] {
            if let Advance::NotFound = state.proofs().advance(&key, step)? {
                warn!(%key, "Proof not found for THREE_WAY_ACK. Ignoring.");
                return Ok(());
            }
        }
        debug!(%key, "delivery complete");
        Ok(())
    }
}

/// The sender saw our ACK and won't retransmit.
pub struct ThreeWayAckReceptor;

impl Receptor for ThreeWayAckReceptor {
    fn execute(
        &self,
        _state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        trace!(conn = conn.id(), uid = %message.uid(), "delivery settled");
        Ok(())
    }
}

/// A PUBLISH_EVENT or RELAY_EVENT left the node. Counts the attempt on its
/// proof; the state is left alone.
pub struct TransmissionAffector;

impl Affector for TransmissionAffector {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let key = proof_key(state, message, conn)?;
        match state.proofs().stamp_attempt(&key)? {
            Some(doc) => trace!(%key, attempts = doc.attempts, "transmitted"),
            None => warn!(%key, "Proof not found for transmitted event. Ignoring."),
        }
        Ok(())
    }
}

/// Messages with nothing to record once written.
pub struct ControlAffector;

impl Affector for ControlAffector {
    fn execute(
        &self,
        _state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        trace!(conn = conn.id(), "sent {}", message);
        Ok(())
    }
}

pub struct PauseReceptor;

impl Receptor for PauseReceptor {
    fn execute(
        &self,
        _state: &Arc<ConnectorState>,
        _message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        debug!(conn = conn.id(), "peer asked us to pause");
        conn.pause_outbound();
        Ok(())
    }
}

pub struct ResumeReceptor;

impl Receptor for ResumeReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        _message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        debug!(conn = conn.id(), "peer asked us to resume");
        conn.resume_outbound();
        if let Some(node) = conn.peer_node() {
            state.resume_transmission(node);
        }
        Ok(())
    }
}

/// Cerebrum: a synapse wants an event type.
pub struct SubscribeReceptor;

impl Receptor for SubscribeReceptor {
    fn execute(
        &self,
        state: &Arc<ConnectorState>,
        message: &Message,
        conn: &Arc<Connection>,
    ) -> Result<(), Error> {
        let node = conn.peer_node().ok_or(Error::NotAuthenticated)?;
        if state.subscriptions().subscribe(node, message.event_type()) {
            debug!(node, event_type = message.event_type(), "subscribed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::{
        net::{
            testing::{self, pair, types},
            NodeId,
        },
        proof::{
            store::{DocumentStore, StoreError},
            PartitionKey, ProofDocument, ProofKind,
        },
    };

    /// Accepts nothing.
    struct Refusing;

    impl DocumentStore for Refusing {
        fn load(&self, _key: &DocumentKey) -> Result<Option<ProofDocument>, StoreError> {
            Ok(None)
        }

        fn save(&self, _doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError> {
            Err(StoreError::SyncFailed {
                key: key.to_string(),
                reason: "disk full".into(),
            })
        }

        fn update(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError> {
            self.save(doc, key)
        }

        fn delete(&self, _key: &DocumentKey, _doc: &ProofDocument) -> Result<(), StoreError> {
            Ok(())
        }

        fn find_all_by_partition_key(
            &self,
            _partition: &PartitionKey,
        ) -> Result<Vec<ProofDocument>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn message(msg_type: MessageType, uid: &str) -> Message {
        Message::builder()
            .msg_type(msg_type)
            .event_type(1)
            .uid_str(uid)
            .originating_port(testing::PORT)
            .payload(&b"event"[..])
            .build()
            .unwrap()
    }

    fn written(kind: ProofKind, consumer: Option<NodeId>) -> ProofDocument {
        ProofDocument::builder()
            .kind(kind)
            .port(testing::PORT)
            .producer(12)
            .consumer(consumer)
            .event_type(1)
            .message_id(4001)
            .state(DeliveryState::Written.into())
            .build()
    }

    fn delivery_state(state: &ConnectorState, key: &DocumentKey) -> Option<DeliveryState> {
        state
            .proofs()
            .load(key)
            .unwrap()
            .and_then(|doc| doc.delivery_state())
    }

    #[tokio::test]
    async fn test_ack_advances_publish_proof_once() {
        let synapse = testing::state(Role::Synapse, 12);
        let (dialed, _accepted) = pair().await;
        let doc = written(ProofKind::Publish, None);
        let key = doc.key();
        synapse.proofs().create(doc).unwrap();
        let ack = message(MessageType::Ack, "12-4001");

        AckReceptor.execute(&synapse, &ack, &dialed).unwrap();
        assert_eq!(delivery_state(&synapse, &key), Some(DeliveryState::AckReceived));
        let sent = dialed.take_queued();
        assert_eq!(types(&sent), vec![MessageType::ThreeWayAck]);
        assert_eq!(sent[0].uid().to_string(), "12-4001");

        // a duplicate ACK is answered again and leaves the proof where it is
        AckReceptor.execute(&synapse, &ack, &dialed).unwrap();
        assert_eq!(delivery_state(&synapse, &key), Some(DeliveryState::AckReceived));
        let sent = dialed.take_queued();
        assert_eq!(types(&sent), vec![MessageType::ThreeWayAck]);

        ThreeWayAckAffector.execute(&synapse, &sent[0], &dialed).unwrap();
        assert_eq!(synapse.proofs().load(&key).unwrap(), None);
        assert!(synapse.proofs().cache().is_empty());
    }

    #[tokio::test]
    async fn test_ack_advances_relay_proof_of_sender() {
        let cerebrum = testing::state(Role::Cerebrum, 1);
        let (_dialed, accepted) = pair().await;
        let relay = written(ProofKind::Relay, Some(7));
        let key = relay.key();
        cerebrum.proofs().create(relay).unwrap();
        let ack = message(MessageType::Ack, "12-4001");

        assert!(matches!(
            AckReceptor.execute(&cerebrum, &ack, &accepted),
            Err(Error::NotAuthenticated)
        ));
        assert!(accepted.set_peer_node(7));
        AckReceptor.execute(&cerebrum, &ack, &accepted).unwrap();
        assert_eq!(delivery_state(&cerebrum, &key), Some(DeliveryState::AckReceived));
        assert_eq!(types(&accepted.take_queued()), vec![MessageType::ThreeWayAck]);
        let publish = DocumentKey::publish(testing::PORT, ack.uid());
        assert_eq!(cerebrum.proofs().load(&publish).unwrap(), None);
    }

    #[tokio::test]
    async fn test_ack_without_proof_is_ignored() {
        let synapse = testing::state(Role::Synapse, 12);
        let (dialed, _accepted) = pair().await;
        AckReceptor
            .execute(&synapse, &message(MessageType::Ack, "12-9"), &dialed)
            .unwrap();
        assert!(dialed.take_queued().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_publishes_deliver_once() {
        const ROUNDS: u64 = 500;
        const READERS: usize = 4;
        let cerebrum = testing::state(Role::Cerebrum, 1);
        let mut events = cerebrum.take_events().unwrap();
        cerebrum.subscribe(1).unwrap();
        let (_dialed, accepted) = pair().await;
        assert!(accepted.set_peer_node(12));

        let barrier = Barrier::new(READERS);
        thread::scope(|s| {
            for _ in 0..READERS {
                s.spawn(|| {
                    for id in 1..=ROUNDS {
                        let publish = message(MessageType::PublishEvent, &format!("12-{}", id));
                        barrier.wait();
                        PublishReceptor.execute(&cerebrum, &publish, &accepted).unwrap();
                    }
                });
            }
        });

        let mut delivered = Vec::new();
        while let Ok(event) = events.try_recv() {
            delivered.push(event.uid.message_id);
        }
        delivered.sort_unstable();
        assert_eq!(delivered, (1..=ROUNDS).collect::<Vec<_>>());
        // every copy is acknowledged
        assert_eq!(accepted.take_queued().len(), READERS * ROUNDS as usize);
    }

    #[tokio::test]
    async fn test_failed_relay_is_not_marked_seen() {
        let cerebrum = testing::state_with_store(Role::Cerebrum, 1, Arc::new(Refusing));
        let mut events = cerebrum.take_events().unwrap();
        cerebrum.subscribe(1).unwrap();
        cerebrum.subscriptions().subscribe(5, 1);
        let (_dialed, accepted) = pair().await;
        assert!(accepted.set_peer_node(12));
        let publish = message(MessageType::PublishEvent, "12-4001");

        assert!(matches!(
            PublishReceptor.execute(&cerebrum, &publish, &accepted),
            Err(Error::Store(_))
        ));
        assert!(!cerebrum.incoming().contains(12, 1, 4001));
        assert!(accepted.take_queued().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_is_delivered_once_and_always_acked() {
        let synapse = testing::state(Role::Synapse, 5);
        let mut events = synapse.take_events().unwrap();
        let (dialed, _accepted) = pair().await;
        let relay = message(MessageType::RelayEvent, "12-4001");

        RelayReceptor.execute(&synapse, &relay, &dialed).unwrap();
        RelayReceptor.execute(&synapse, &relay, &dialed).unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.uid, relay.uid());
        assert_eq!(event.payload, b"event");
        assert!(events.try_recv().is_err());
        assert_eq!(
            types(&dialed.take_queued()),
            vec![MessageType::Ack, MessageType::Ack]
        );
    }
}
