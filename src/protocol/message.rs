use std::fmt::{Debug, Formatter};
use bytes::{BufMut, BytesMut};
use tokio::time::Instant;
use crate::ids::ConnectionId;
use crate::protocol::header::{Header, MessageType, OFP_VERSION_1, OFP_VERSION_4};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Reasons for dropping a received frame. None of these close the connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("message too short: {length} bytes")]
    TooShort { length: usize },
    #[error("header length {header} does not match message size {actual}")]
    LengthMismatch { header: u16, actual: usize },
    #[error("{message_type:?} message (version {version}) has invalid length {length}")]
    InvalidLength { version: u8, message_type: MessageType, length: u16 },
    #[error("malformed hello element at offset {offset}")]
    InvalidHelloElement { offset: usize },
}

/// Length constraints for a class of messages: the total length must be in `min_len..=max_len`,
///  and the part after `base_len` must consist of whole `unit`s (e.g. port structs).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRule {
    pub min_len: u16,
    pub max_len: u16,
    pub base_len: u16,
    pub unit: u16,
}

impl FrameRule {
    const fn range(min_len: u16, max_len: u16) -> FrameRule {
        FrameRule { min_len, max_len, base_len: 0, unit: 1 }
    }

    const fn repeated(base_len: u16, unit: u16) -> FrameRule {
        FrameRule { min_len: base_len, max_len: u16::MAX, base_len, unit }
    }

    pub fn for_message(version: u8, message_type: MessageType) -> FrameRule {
        match message_type {
            MessageType::Hello => Self::range(8, u16::MAX),
            MessageType::Error => Self::range(12, u16::MAX),
            MessageType::FeaturesRequest => Self::range(8, 8),
            MessageType::FeaturesReply => match version {
                OFP_VERSION_1 => Self::repeated(32, 48),
                2 | 3 => Self::repeated(32, 64),
                _ => Self::range(32, 32),
            },
            MessageType::MultipartRequest | MessageType::MultipartReply => {
                if version == OFP_VERSION_1 {
                    Self::range(12, u16::MAX)
                }
                else {
                    FrameRule { min_len: 16, max_len: u16::MAX, base_len: 0, unit: 8 }
                }
            }
            _ => Self::range(8, u16::MAX),
        }
    }

    pub fn accepts(&self, length: u16) -> bool {
        length >= self.min_len
            && length <= self.max_len
            && (length - self.base_len) % self.unit == 0
    }
}


/// A single OpenFlow message: a contiguous buffer starting with a [Header] whose length field
///  matches the buffer's size.
#[derive(Clone)]
pub struct Message {
    buf: BytesMut,
    source: Option<ConnectionId>,
    time: Instant,
}

impl Message {
    /// Wraps a received frame, checking that the header's length matches the buffer
    pub fn new(buf: BytesMut) -> Result<Message, FrameError> {
        let header = Header::peek(&buf)
            .ok_or(FrameError::TooShort { length: buf.len() })?;
        let length: usize = header.length.safe_cast();
        if length < Header::SERIALIZED_LEN {
            return Err(FrameError::TooShort { length });
        }
        if length != buf.len() {
            return Err(FrameError::LengthMismatch { header: header.length, actual: buf.len() });
        }

        Ok(Message {
            buf,
            source: None,
            time: Instant::now(),
        })
    }

    /// Builds a message from its parts. The caller is responsible for keeping the body short
    ///  enough to fit the 16 bit length field.
    pub fn build(version: u8, message_type: MessageType, xid: u32, body: &[u8]) -> Message {
        let length: u16 = (Header::SERIALIZED_LEN + body.len()).prechecked_cast();
        let mut buf = BytesMut::with_capacity(length as usize);
        Header::new(version, message_type, length, xid).ser(&mut buf);
        buf.put_slice(body);

        Message {
            buf,
            source: None,
            time: Instant::now(),
        }
    }

    pub fn with_source(mut self, source: ConnectionId) -> Message {
        self.source = Some(source);
        self
    }

    pub fn source(&self) -> Option<ConnectionId> {
        self.source
    }

    pub fn time(&self) -> Instant {
        self.time
    }

    pub fn header(&self) -> Header {
        let b = &self.buf;
        Header {
            version: b[0],
            raw_type: b[1],
            length: u16::from_be_bytes([b[2], b[3]]),
            xid: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        }
    }

    pub fn version(&self) -> u8 {
        self.buf[0]
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_wire(self.version(), self.buf[1])
    }

    pub fn xid(&self) -> u32 {
        self.header().xid
    }

    pub fn length(&self) -> u16 {
        self.header().length
    }

    /// The complete message including the header
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// The message without its header
    pub fn body(&self) -> &[u8] {
        &self.buf[Header::SERIALIZED_LEN..]
    }

    /// Rewrites the type in place, e.g. to turn an echo request into its reply
    pub fn set_type(&mut self, message_type: MessageType) {
        let version = self.version();
        self.buf[1] = message_type.to_wire(version).unwrap_or(message_type.into());
    }

    pub fn set_xid(&mut self, xid: u32) {
        self.buf[4..8].copy_from_slice(&xid.to_be_bytes());
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    /// Checks the message against the length rules for its type and version
    pub fn validate(&self) -> Result<(), FrameError> {
        let version = self.version();
        let message_type = self.message_type();
        let length = self.length();

        if !FrameRule::for_message(version, message_type).accepts(length) {
            return Err(FrameError::InvalidLength { version, message_type, length });
        }

        if message_type == MessageType::Hello && version >= OFP_VERSION_4 {
            Self::validate_hello_elements(self.body())?;
        }
        Ok(())
    }

    /// Hello elements are `type (u16), length (u16), payload`, padded to a multiple of 8 bytes.
    ///  The length field excludes padding.
    fn validate_hello_elements(body: &[u8]) -> Result<(), FrameError> {
        let mut offset = 0;
        while body.len() - offset >= 4 {
            let element_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            let padded_len = (element_len + 7) & !7;
            if element_len < 4 || offset + padded_len > body.len() {
                return Err(FrameError::InvalidHelloElement { offset: offset + Header::SERIALIZED_LEN });
            }
            offset += padded_len;
        }
        Ok(())
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("version", &self.version())
            .field("type", &self.message_type())
            .field("length", &self.length())
            .field("xid", &self.xid())
            .field("source", &self.source)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn raw(version: u8, raw_type: u8, length: u16) -> BytesMut {
        let mut buf = BytesMut::new();
        Header { version, raw_type, length, xid: 7 }.ser(&mut buf);
        buf.resize(length.max(8) as usize, 0);
        buf
    }

    #[test]
    fn test_new_too_short() {
        assert_eq!(Message::new(BytesMut::from(&[4u8, 0, 0][..])).unwrap_err(), FrameError::TooShort { length: 3 });
        assert_eq!(Message::new(raw(4, 0, 4)).unwrap_err(), FrameError::TooShort { length: 4 });
    }

    #[test]
    fn test_new_length_mismatch() {
        let mut buf = raw(4, 0, 16);
        buf.truncate(12);
        assert_eq!(Message::new(buf).unwrap_err(), FrameError::LengthMismatch { header: 16, actual: 12 });
    }

    #[test]
    fn test_accessors() {
        let msg = Message::build(4, MessageType::EchoRequest, 0x1234, b"abc");
        assert_eq!(msg.version(), 4);
        assert_eq!(msg.message_type(), MessageType::EchoRequest);
        assert_eq!(msg.xid(), 0x1234);
        assert_eq!(msg.length(), 11);
        assert_eq!(msg.body(), b"abc");
        assert_eq!(msg.source(), None);
        assert_eq!(msg.clone().with_source(ConnectionId(3)).source(), Some(ConnectionId(3)));
    }

    #[test]
    fn test_set_type() {
        let mut msg = Message::build(1, MessageType::EchoRequest, 1, &[]);
        msg.set_type(MessageType::EchoReply);
        assert_eq!(msg.message_type(), MessageType::EchoReply);
        assert_eq!(msg.data()[1], 3);
        msg.set_xid(99);
        assert_eq!(msg.xid(), 99);
    }

    #[rstest]
    #[case::hello(4, 0, 8, true)]
    #[case::error_too_short(4, 1, 10, false)]
    #[case::error(4, 1, 12, true)]
    #[case::features_request(4, 5, 8, true)]
    #[case::features_request_with_body(4, 5, 16, false)]
    #[case::features_reply_v1_ports(1, 6, 32 + 2*48, true)]
    #[case::features_reply_v1_partial_port(1, 6, 32 + 40, false)]
    #[case::features_reply_v3_ports(3, 6, 32 + 64, true)]
    #[case::features_reply_v3_v1_ports(3, 6, 32 + 48, false)]
    #[case::features_reply_v4(4, 6, 32, true)]
    #[case::features_reply_v4_too_long(4, 6, 40, false)]
    #[case::multipart_reply_v4(4, 19, 16 + 64, true)]
    #[case::multipart_reply_v4_misaligned(4, 19, 20, false)]
    #[case::multipart_reply_v4_too_short(4, 19, 8, false)]
    #[case::stats_reply_v1(1, 17, 12, true)]
    #[case::packet_in(4, 10, 9, true)]
    fn test_validate_length(#[case] version: u8, #[case] raw_type: u8, #[case] length: u16, #[case] valid: bool) {
        let msg = Message::new(raw(version, raw_type, length)).unwrap();
        assert_eq!(msg.validate().is_ok(), valid);
    }

    #[rstest]
    #[case::bitmap(&[0, 1, 0, 8, 0, 0, 0, 0x12], true)]
    #[case::padded(&[0, 1, 0, 12, 0, 0, 0, 0x12, 0, 0, 0, 0x1, 0, 0, 0, 0], true)]
    #[case::padding_missing(&[0, 1, 0, 12, 0, 0, 0, 0x12, 0, 0, 0, 0x1], false)]
    #[case::element_too_short(&[0, 1, 0, 2, 0, 0, 0, 0], false)]
    #[case::trailing_garbage(&[0, 1, 0, 8, 0, 0, 0, 0x12, 0], true)]
    fn test_validate_hello_elements(#[case] body: &[u8], #[case] valid: bool) {
        let msg = Message::build(4, MessageType::Hello, 1, body);
        assert_eq!(msg.validate().is_ok(), valid);
    }

    #[test]
    fn test_hello_elements_ignored_before_v4() {
        let msg = Message::build(1, MessageType::Hello, 1, &[0, 1, 0, 2]);
        assert!(msg.validate().is_ok());
    }
}
