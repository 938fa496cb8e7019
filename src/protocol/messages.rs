//! Codecs for the handful of messages the driver itself sends and interprets during the
//!  handshake and for keep-alive. Everything else is passed through to the application as an
//!  opaque [Message].

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::protocol::datapath_id::DatapathId;
use crate::protocol::header::{Header, MessageType, OFP_VERSION_1, OFP_VERSION_4};
use crate::protocol::message::Message;
use crate::protocol::versions::ProtocolVersions;

pub const OFPHET_VERSIONBITMAP: u16 = 1;

pub const OFPET_HELLO_FAILED: u16 = 0;
pub const OFPHFC_INCOMPATIBLE: u16 = 0;

pub const OFPMP_PORT_DESC: u16 = 13;
pub const OFPMPF_MORE: u16 = 1;

pub struct Hello;

impl Hello {
    /// Builds a Hello announcing `versions`: the header carries the highest version, and a version
    ///  bitmap element is added only if the peer could not infer the set from that.
    pub fn build(versions: ProtocolVersions, xid: u32) -> Message {
        let mut body = BytesMut::new();
        if versions.needs_bitmap() {
            body.put_u16(OFPHET_VERSIONBITMAP);
            body.put_u16(8);
            body.put_u32(versions.bitmap());
        }
        Message::build(versions.highest_version(), MessageType::Hello, xid, &body)
    }

    /// Extracts the version bitmap element from a received Hello, if there is one.
    ///
    /// NB: Bitmap words after the first refer to versions we can not represent, they are ignored
    pub fn version_bitmap(message: &Message) -> Option<ProtocolVersions> {
        let mut body = message.body();
        while body.len() >= 4 {
            let element_type = u16::from_be_bytes([body[0], body[1]]);
            let element_len = u16::from_be_bytes([body[2], body[3]]) as usize;
            if element_len < 4 || element_len > body.len() {
                return None;
            }

            if element_type == OFPHET_VERSIONBITMAP && element_len >= 8 {
                let bitmap = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                return Some(ProtocolVersions::from_bitmap(bitmap));
            }

            let padded_len = ((element_len + 7) & !7).min(body.len());
            body = &body[padded_len..];
        }
        None
    }
}

pub fn features_request(version: u8, xid: u32) -> Message {
    Message::build(version, MessageType::FeaturesRequest, xid, &[])
}

pub fn echo_request(version: u8, xid: u32, payload: &[u8]) -> Message {
    Message::build(version, MessageType::EchoRequest, xid, payload)
}

/// The multipart request for a switch's port descriptions, which replaces the port list in
///  the features reply as of OpenFlow 1.3
pub fn port_desc_request(version: u8, xid: u32) -> Message {
    let mut body = BytesMut::with_capacity(8);
    body.put_u16(OFPMP_PORT_DESC);
    body.put_u16(0);
    body.put_u32(0);
    Message::build(version, MessageType::MultipartRequest, xid, &body)
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error_type: u16,
    pub code: u16,
    pub data: Bytes,
}

impl ErrorMessage {
    pub fn hello_failed(explanation: &str) -> ErrorMessage {
        ErrorMessage {
            error_type: OFPET_HELLO_FAILED,
            code: OFPHFC_INCOMPATIBLE,
            data: Bytes::copy_from_slice(explanation.as_bytes()),
        }
    }

    pub fn build(&self, version: u8, xid: u32) -> Message {
        let mut body = BytesMut::with_capacity(4 + self.data.len());
        body.put_u16(self.error_type);
        body.put_u16(self.code);
        body.put_slice(&self.data);
        Message::build(version, MessageType::Error, xid, &body)
    }

    pub fn parse(message: &Message) -> anyhow::Result<ErrorMessage> {
        if message.message_type() != MessageType::Error {
            bail!("not an error message: {:?}", message.message_type());
        }
        let mut body = message.body();
        let error_type = body.try_get_u16()?;
        let code = body.try_get_u16()?;
        Ok(ErrorMessage {
            error_type,
            code,
            data: Bytes::copy_from_slice(body),
        })
    }
}


/// The fixed part of a features reply. The layout of the fixed 24 bytes after the header is
///  identical in all versions except for the byte at offset 13, which is the auxiliary id as of
///  1.3 and padding before:
///
/// ```ascii
///  0: datapath id (u64)
///  8: n_buffers (u32)
/// 12: n_tables (u8)
/// 13: auxiliary id (u8, 1.3+)
/// 14: pad (2 bytes)
/// 16: capabilities (u32)
/// 20: actions (1.0) / reserved (u32)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeaturesReply {
    pub version: u8,
    pub datapath_id: DatapathId,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub auxiliary_id: u8,
    pub capabilities: u32,
    pub reserved: u32,
}

impl FeaturesReply {
    pub const SERIALIZED_LEN: usize = 32;

    pub fn parse(message: &Message) -> anyhow::Result<FeaturesReply> {
        if message.message_type() != MessageType::FeaturesReply {
            bail!("not a features reply: {:?}", message.message_type());
        }

        let version = message.version();
        let mut body = message.body();
        let datapath_id = DatapathId::from_u64(body.try_get_u64()?);
        let n_buffers = body.try_get_u32()?;
        let n_tables = body.try_get_u8()?;
        let auxiliary_id = body.try_get_u8()?;
        body.try_get_u16()?;
        let capabilities = body.try_get_u32()?;
        let reserved = body.try_get_u32()?;

        Ok(FeaturesReply {
            version,
            datapath_id,
            n_buffers,
            n_tables,
            auxiliary_id: if version >= OFP_VERSION_4 { auxiliary_id } else { 0 },
            capabilities,
            reserved,
        })
    }

    pub fn ser_body(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.datapath_id.as_u64());
        buf.put_u32(self.n_buffers);
        buf.put_u8(self.n_tables);
        buf.put_u8(if self.version >= OFP_VERSION_4 { self.auxiliary_id } else { 0 });
        buf.put_u16(0);
        buf.put_u32(self.capabilities);
        buf.put_u32(self.reserved);
    }

    /// Builds the reply message, followed by `ports` (which are part of the reply only before 1.3)
    pub fn build(&self, xid: u32, ports: &[u8]) -> Message {
        let mut body = BytesMut::with_capacity(Self::SERIALIZED_LEN - Header::SERIALIZED_LEN + ports.len());
        self.ser_body(&mut body);
        body.put_slice(ports);
        Message::build(self.version, MessageType::FeaturesReply, xid, &body)
    }
}

/// Size of a port description struct, if it is fixed for a version
pub fn port_size(version: u8) -> Option<usize> {
    match version {
        OFP_VERSION_1 => Some(48),
        2..=4 => Some(64),
        _ => None,
    }
}

/// Splits a buffer of concatenated port structs. Version 1.4 and later ports carry their own
///  length at offset 4.
pub fn split_ports(version: u8, mut ports: &[u8]) -> Vec<&[u8]> {
    let mut result = Vec::new();
    while !ports.is_empty() {
        let len = match port_size(version) {
            Some(len) => len,
            None => {
                if ports.len() < 6 {
                    break;
                }
                u16::from_be_bytes([ports[4], ports[5]]) as usize
            }
        };
        if len == 0 || len > ports.len() {
            break;
        }
        result.push(&ports[..len]);
        ports = &ports[len..];
    }
    result
}


/// A multipart reply, i.e. a reply that may be split across several messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartReply<'a> {
    pub multipart_type: u16,
    pub flags: u16,
    pub payload: &'a [u8],
}

impl <'a> MultipartReply<'a> {
    pub fn parse(message: &'a Message) -> anyhow::Result<MultipartReply<'a>> {
        if message.message_type() != MessageType::MultipartReply {
            bail!("not a multipart reply: {:?}", message.message_type());
        }
        if message.version() == OFP_VERSION_1 {
            bail!("port descriptions are not a multipart type in version 1");
        }

        let mut body = message.body();
        let multipart_type = body.try_get_u16()?;
        let flags = body.try_get_u16()?;
        body.try_get_u32()?;
        Ok(MultipartReply {
            multipart_type,
            flags,
            payload: body,
        })
    }

    pub fn is_port_desc(&self) -> bool {
        self.multipart_type == OFPMP_PORT_DESC
    }

    pub fn has_more(&self) -> bool {
        self.flags & OFPMPF_MORE != 0
    }

    pub fn build(version: u8, xid: u32, multipart_type: u16, flags: u16, payload: &[u8]) -> Message {
        let mut body = BytesMut::with_capacity(8 + payload.len());
        body.put_u16(multipart_type);
        body.put_u16(flags);
        body.put_u32(0);
        body.put_slice(payload);
        Message::build(version, MessageType::MultipartReply, xid, &body)
    }
}


/// What the handshake learned about a switch: the features reply, together with the switch's
///  ports - whether they were part of the reply or were collected from port description replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Features {
    pub reply: FeaturesReply,
    pub xid: u32,
    ports: BytesMut,
}

impl Features {
    pub fn from_message(message: &Message) -> anyhow::Result<Features> {
        let reply = FeaturesReply::parse(message)?;
        let ports = if message.version() < OFP_VERSION_4 {
            BytesMut::from(&message.data()[FeaturesReply::SERIALIZED_LEN..])
        }
        else {
            BytesMut::new()
        };

        Ok(Features {
            reply,
            xid: message.xid(),
            ports,
        })
    }

    pub fn version(&self) -> u8 {
        self.reply.version
    }

    pub fn datapath_id(&self) -> DatapathId {
        self.reply.datapath_id
    }

    pub fn auxiliary_id(&self) -> u8 {
        self.reply.auxiliary_id
    }

    pub fn ports(&self) -> &[u8] {
        &self.ports
    }

    pub fn port_count(&self) -> usize {
        split_ports(self.version(), &self.ports).len()
    }

    /// Appends ports from a port description reply. Returns `false` if the combined image would
    ///  no longer fit into a single message, in which case the ports are not added.
    pub fn add_ports(&mut self, ports: &[u8]) -> bool {
        if FeaturesReply::SERIALIZED_LEN + self.ports.len() + ports.len() > u16::MAX as usize {
            return false;
        }
        self.ports.extend_from_slice(ports);
        true
    }

    /// The features reply as a single message with all ports appended after the fixed part - the
    ///  pre-1.3 layout, regardless of version.
    pub fn to_message(&self) -> Message {
        self.reply.build(self.xid, &self.ports)
    }
}
