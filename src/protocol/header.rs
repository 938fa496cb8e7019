use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const OFP_VERSION_1: u8 = 1;
pub const OFP_VERSION_2: u8 = 2;
pub const OFP_VERSION_3: u8 = 3;
pub const OFP_VERSION_4: u8 = 4;
pub const OFP_VERSION_5: u8 = 5;
pub const OFP_VERSION_6: u8 = 6;

/// The highest wire version this driver speaks
pub const OFP_VERSION_LATEST: u8 = OFP_VERSION_6;

/// Message types in the canonical (OpenFlow 1.3+) numbering. Version 1 uses a slightly different
///  numbering on the wire; the translation happens in [Header::message_type] and
///  [MessageType::to_wire].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Experimenter = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    GetConfigRequest = 7,
    GetConfigReply = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    GroupMod = 15,
    PortMod = 16,
    TableMod = 17,
    MultipartRequest = 18,
    MultipartReply = 19,
    BarrierRequest = 20,
    BarrierReply = 21,
    QueueGetConfigRequest = 22,
    QueueGetConfigReply = 23,
    RoleRequest = 24,
    RoleReply = 25,
    GetAsyncRequest = 26,
    GetAsyncReply = 27,
    SetAsync = 28,
    MeterMod = 29,
    RoleStatus = 30,
    TableStatus = 31,
    RequestForward = 32,
    BundleControl = 33,
    BundleAddMessage = 34,
    ControllerStatus = 35,
    Unsupported = 0xff,
}

impl MessageType {
    /// Highest canonical message type that exists in a given protocol version
    fn max_for_version(version: u8) -> u8 {
        match version {
            OFP_VERSION_1 => MessageType::QueueGetConfigReply.into(),
            OFP_VERSION_2 => MessageType::QueueGetConfigReply.into(),
            OFP_VERSION_3 => MessageType::RoleReply.into(),
            OFP_VERSION_4 => MessageType::MeterMod.into(),
            OFP_VERSION_5 => MessageType::BundleAddMessage.into(),
            _ => MessageType::ControllerStatus.into(),
        }
    }

    /// Maps a raw wire type of a given version to the canonical message type. Types that do not
    ///  exist in that version map to [MessageType::Unsupported].
    pub fn from_wire(version: u8, raw: u8) -> MessageType {
        let canonical = if version == OFP_VERSION_1 {
            match raw {
                0..=14 => Some(raw),
                // OFPT_PORT_MOD, there is no GROUP_MOD in 1.0
                15 => Some(MessageType::PortMod.into()),
                // OFPT_STATS_REQUEST / OFPT_STATS_REPLY
                16 | 17 => Some(raw + 2),
                // barrier and queue config
                18..=21 => Some(raw + 2),
                _ => None,
            }
        }
        else if raw <= Self::max_for_version(version) {
            Some(raw)
        }
        else {
            None
        };

        canonical
            .and_then(|t| MessageType::try_from(t).ok())
            .unwrap_or(MessageType::Unsupported)
    }

    /// The raw type of this message for a given version, or `None` if the type does not exist
    ///  in that version
    pub fn to_wire(self, version: u8) -> Option<u8> {
        let canonical: u8 = self.into();
        if self == MessageType::Unsupported {
            return None;
        }

        if version == OFP_VERSION_1 {
            match canonical {
                0..=14 => Some(canonical),
                16 => Some(15),
                18..=23 => Some(canonical - 2),
                _ => None,
            }
        }
        else if canonical <= Self::max_for_version(version) {
            Some(canonical)
        }
        else {
            None
        }
    }
}

/// The fixed 8-byte header in front of every OpenFlow message, all numbers in network byte order:
///
/// ```ascii
/// 0: version (u8)
/// 1: type (u8)
/// 2: length (u16) - total message length including this header
/// 4: xid (u32) - transaction id
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub raw_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl Header {
    pub const SERIALIZED_LEN: usize = 8;
    pub const SERIALIZED_LEN_U16: u16 = Self::SERIALIZED_LEN as u16;

    pub fn new(version: u8, message_type: MessageType, length: u16, xid: u32) -> Header {
        Header {
            version,
            raw_type: message_type.to_wire(version).unwrap_or(message_type.into()),
            length,
            xid,
        }
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_wire(self.version, self.raw_type)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.raw_type);
        buf.put_u16(self.length);
        buf.put_u32(self.xid);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Header> {
        let version = buf.try_get_u8()?;
        let raw_type = buf.try_get_u8()?;
        let length = buf.try_get_u16()?;
        let xid = buf.try_get_u32()?;
        Ok(Header {
            version,
            raw_type,
            length,
            xid,
        })
    }

    /// Reads the header from the start of a buffer without consuming anything
    pub fn peek(buf: &[u8]) -> Option<Header> {
        if buf.len() < Self::SERIALIZED_LEN {
            return None;
        }
        let mut b = buf;
        Self::deser(&mut b).ok()
    }
}
