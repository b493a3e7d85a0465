use std::{fmt, str::FromStr};

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use super::{error::Error, EventType, NodeId, HEADER_LEN, MAX_MESSAGE_ID};
use crate::hex::HexDisplayExt;

/// Every message starts with a fixed 24 byte header:
///
/// ```text
/// 0      1            2          8             10                 12            16         24
/// | type | event type | id (u48) | source node | originating port | payload len | reserved | payload..
/// ```
///
/// All integers are little endian. The reserved bytes are written as zero and
/// ignored when reading.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    // HANDSHAKE MESSAGES
    /// Opens the handshake. The cerebrum answers with a STARTUP carrying a
    /// challenge.
    Startup = 1,
    /// The synapse's answer to the challenge
    Credentials = 2,
    /// Handshake complete
    ReadyConfirmed = 3,

    // DELIVERY MESSAGES
    /// An event published by a synapse
    PublishEvent = 4,
    /// An event forwarded by the cerebrum to a subscriber
    RelayEvent = 5,
    /// The receiver has the event
    Ack = 6,
    /// The sender has seen the ack and stops retransmitting
    ThreeWayAck = 7,

    // CONTROL MESSAGES
    /// The receiver's worker pools are saturated, hold new events
    PauseTransmission = 8,
    /// Pressure subsided, send held events
    ResumeTransmission = 9,
    /// Register interest in an event type
    Subscribe = 10,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Startup,
        MessageType::Credentials,
        MessageType::ReadyConfirmed,
        MessageType::PublishEvent,
        MessageType::RelayEvent,
        MessageType::Ack,
        MessageType::ThreeWayAck,
        MessageType::PauseTransmission,
        MessageType::ResumeTransmission,
        MessageType::Subscribe,
    ];

    /// Messages that make up the authentication handshake. These are the only
    /// messages accepted before a connection is ready.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::Startup
                | MessageType::Credentials
                | MessageType::ReadyConfirmed
        )
    }

    /// Messages carrying application events. These are held back while the
    /// peer has asked us to pause.
    pub fn is_event(&self) -> bool {
        matches!(self, MessageType::PublishEvent | MessageType::RelayEvent)
    }

    pub fn byte(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Startup,
            2 => MessageType::Credentials,
            3 => MessageType::ReadyConfirmed,
            4 => MessageType::PublishEvent,
            5 => MessageType::RelayEvent,
            6 => MessageType::Ack,
            7 => MessageType::ThreeWayAck,
            8 => MessageType::PauseTransmission,
            9 => MessageType::ResumeTransmission,
            10 => MessageType::Subscribe,
            other => return Err(Error::InvalidMessageType(other)),
        })
    }
}

/// The globally unique id of a message: the node that created it and a 48 bit
/// id local to that node. Printed as `source-message`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageUid {
    pub source_node: NodeId,
    pub message_id: u64,
}

impl MessageUid {
    pub fn new(source_node: NodeId, message_id: u64) -> Result<Self, Error> {
        if message_id > MAX_MESSAGE_ID {
            return Err(Error::InvalidMessageUid(format!(
                "{}-{}",
                source_node, message_id
            )));
        }
        Ok(Self {
            source_node,
            message_id,
        })
    }
}

impl fmt::Display for MessageUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source_node, self.message_id)
    }
}

impl FromStr for MessageUid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidMessageUid(s.to_owned());
        let (source, id) = s.split_once('-').ok_or_else(invalid)?;
        let source_node = source.trim().parse().map_err(|_| invalid())?;
        let message_id = id.trim().parse().map_err(|_| invalid())?;
        MessageUid::new(source_node, message_id).map_err(|_| invalid())
    }
}

/// An immutable protocol message. Build one with [`Message::builder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    msg_type: MessageType,
    event_type: EventType,
    uid: MessageUid,
    originating_port: u16,
    payload: Vec<u8>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn uid(&self) -> MessageUid {
        self.uid
    }

    pub fn message_id(&self) -> u64 {
        self.uid.message_id
    }

    pub fn source_node(&self) -> NodeId {
        self.uid.source_node
    }

    pub fn originating_port(&self) -> u16 {
        self.originating_port
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length of the message once encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        buf[0] = self.msg_type.byte();
        buf[1] = self.event_type;
        LittleEndian::write_u48(&mut buf[2..8], self.uid.message_id);
        LittleEndian::write_u16(&mut buf[8..10], self.uid.source_node);
        LittleEndian::write_u16(&mut buf[10..12], self.originating_port);
        LittleEndian::write_u32(&mut buf[12..16], self.payload.len() as u32);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Decodes a single message from the start of `buf`. Bytes beyond the
    /// declared payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let header = Header::parse(buf)?;
        let end = HEADER_LEN + header.payload_len;
        if buf.len() < end {
            return Err(Error::MalformedHeader {
                available: buf.len(),
            });
        }
        header.into_message(buf[HEADER_LEN..end].to_vec())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[{}] {} via :{}",
            self.msg_type, self.event_type, self.uid, self.originating_port
        )
    }
}

/// Builder for [`Message`]. The id can be given as separate components or as
/// a `source-message` string.
#[derive(Default)]
pub struct MessageBuilder {
    msg_type: Option<MessageType>,
    event_type: EventType,
    source_node: NodeId,
    message_id: u64,
    uid_str: Option<String>,
    originating_port: u16,
    payload: Vec<u8>,
}

impl MessageBuilder {
    pub fn msg_type(mut self, msg_type: MessageType) -> Self {
        self.msg_type = Some(msg_type);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }

    pub fn source_node(mut self, source_node: NodeId) -> Self {
        self.source_node = source_node;
        self
    }

    pub fn message_id(mut self, message_id: u64) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn uid(self, uid: MessageUid) -> Self {
        self.source_node(uid.source_node).message_id(uid.message_id)
    }

    /// Sets both id components from a `source-message` string, e.g.
    /// `"12-4001"`.
    pub fn uid_str(mut self, uid: impl Into<String>) -> Self {
        self.uid_str = Some(uid.into());
        self
    }

    pub fn originating_port(mut self, port: u16) -> Self {
        self.originating_port = port;
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn build(self) -> Result<Message, Error> {
        let msg_type = self.msg_type.ok_or(Error::InvalidMessageType(0))?;
        let uid = match self.uid_str {
            Some(s) => s.parse()?,
            None => MessageUid::new(self.source_node, self.message_id)?,
        };
        Ok(Message {
            msg_type,
            event_type: self.event_type,
            uid,
            originating_port: self.originating_port,
            payload: self.payload,
        })
    }
}

/// A parsed header whose type byte hasn't been validated yet.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    type_byte: u8,
    event_type: EventType,
    message_id: u64,
    source_node: NodeId,
    originating_port: u16,
    payload_len: usize,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::MalformedHeader {
                available: buf.len(),
            });
        }
        let header = array_ref![buf, 0, HEADER_LEN];
        Ok(Self {
            type_byte: header[0],
            event_type: header[1],
            message_id: LittleEndian::read_u48(&header[2..8]),
            source_node: LittleEndian::read_u16(&header[8..10]),
            originating_port: LittleEndian::read_u16(&header[10..12]),
            payload_len: LittleEndian::read_u32(&header[12..16]) as usize,
        })
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }

    fn into_message(self, payload: Vec<u8>) -> Result<Message, Error> {
        Ok(Message {
            msg_type: MessageType::try_from(self.type_byte)?,
            event_type: self.event_type,
            uid: MessageUid {
                source_node: self.source_node,
                message_id: self.message_id,
            },
            originating_port: self.originating_port,
            payload,
        })
    }
}

/// Reassembles messages from a byte stream. Bytes are appended as they
/// arrive and complete frames are taken off the front.
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

/// The result of taking one frame off a [`FrameDecoder`].
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    /// A complete frame that couldn't be decoded. Its bytes have been
    /// consumed so the stream stays aligned.
    Rejected(Error),
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Takes the next complete frame, if any. A header declaring a payload
    /// above the configured maximum can't be skipped safely, so it's returned
    /// as an error and the stream should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let header = match Header::parse(&self.buf) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };
        if header.payload_len > self.max_payload {
            return Err(Error::MalformedHeader {
                available: self.buf.len(),
            });
        }
        if self.buf.len() < header.frame_len() {
            return Ok(None);
        }
        let rest = self.buf.split_off(header.frame_len());
        let frame = std::mem::replace(&mut self.buf, rest);
        trace!(
            "decoded frame type={:#04x} payload={:?}",
            header.type_byte,
            frame[HEADER_LEN..].hex()
        );
        Ok(Some(
            match header.into_message(frame[HEADER_LEN..].to_vec()) {
                Ok(msg) => Frame::Message(msg),
                Err(e) => Frame::Rejected(e),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(uid: &str, payload: &[u8]) -> Message {
        Message::builder()
            .msg_type(MessageType::PublishEvent)
            .event_type(7)
            .uid_str(uid)
            .originating_port(4100)
            .payload(payload)
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_trip_keeps_every_field() {
        let msgs = [
            publish("12-4001", b"hello"),
            publish("0-0", b""),
            Message::builder()
                .msg_type(MessageType::ThreeWayAck)
                .event_type(u8::MAX)
                .source_node(u16::MAX)
                .message_id(MAX_MESSAGE_ID)
                .originating_port(u16::MAX)
                .build()
                .unwrap(),
        ];
        for msg in msgs {
            let buf = msg.encode();
            assert_eq!(buf.len(), HEADER_LEN + msg.payload().len());
            assert_eq!(Message::decode(&buf).unwrap(), msg);
        }
    }

    #[test]
    fn test_header_layout() {
        let buf = publish("12-4001", b"xy").encode();
        assert_eq!(buf[0], MessageType::PublishEvent.byte());
        assert_eq!(buf[1], 7);
        assert_eq!(LittleEndian::read_u48(&buf[2..8]), 4001);
        assert_eq!(LittleEndian::read_u16(&buf[8..10]), 12);
        assert_eq!(LittleEndian::read_u16(&buf[10..12]), 4100);
        assert_eq!(LittleEndian::read_u32(&buf[12..16]), 2);
        assert!(buf[16..24].iter().all(|b| *b == 0));
        assert_eq!(&buf[24..], b"xy");
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        let err = Message::decode(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader { available: 20 }));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut buf = publish("1-1", b"").encode();
        buf[0] = 0xEE;
        assert!(matches!(
            Message::decode(&buf),
            Err(Error::InvalidMessageType(0xEE))
        ));
    }

    #[test]
    fn test_uid_string_parsing() {
        let uid: MessageUid = "12-4001".parse().unwrap();
        assert_eq!(uid.source_node, 12);
        assert_eq!(uid.message_id, 4001);
        assert_eq!(uid.to_string(), "12-4001");

        assert!("12".parse::<MessageUid>().is_err());
        assert!("x-1".parse::<MessageUid>().is_err());
        assert!("70000-1".parse::<MessageUid>().is_err());
        assert!(format!("1-{}", MAX_MESSAGE_ID + 1)
            .parse::<MessageUid>()
            .is_err());
    }

    #[test]
    fn test_builder_requires_type() {
        assert!(Message::builder().message_id(1).build().is_err());
    }

    #[test]
    fn test_frame_decoder_handles_partial_and_bad_frames() {
        let mut decoder = FrameDecoder::new(1024);
        let first = publish("3-1", b"abc").encode();
        let mut bad = publish("3-2", b"zz").encode();
        bad[0] = 0x7F;
        let last = publish("3-3", b"").encode();

        decoder.extend(&first[..10]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&first[10..]);
        decoder.extend(&bad);
        decoder.extend(&last);

        match decoder.next_frame().unwrap() {
            Some(Frame::Message(msg)) => assert_eq!(msg.uid().to_string(), "3-1"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            decoder.next_frame().unwrap(),
            Some(Frame::Rejected(Error::InvalidMessageType(0x7F)))
        ));
        match decoder.next_frame().unwrap() {
            Some(Frame::Message(msg)) => assert_eq!(msg.message_id(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_decoder_refuses_oversized_payload() {
        let mut decoder = FrameDecoder::new(4);
        decoder.extend(&publish("3-1", b"too long").encode());
        assert!(decoder.next_frame().is_err());
    }
}
