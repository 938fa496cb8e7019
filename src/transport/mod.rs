//! The byte-moving side of connections. A connection's [Transport] is one of
//! * a TCP stream, optionally with TLS, served by its own I/O task
//! * a UDP 'connection', i.e. a remote endpoint on a shared UDP socket, optionally with DTLS
//! * an in-memory link for tests
//!
//! Transports never call into protocol logic: I/O tasks report what happens as engine events,
//!  tagged with the connection's id.

use std::net::SocketAddr;
use bytes::Bytes;
use tracing::warn;
use crate::protocol::header::Header;
use crate::util::safe_converter::SafeCast;

pub mod datagram;
pub mod memory;
pub mod stream;

use datagram::DatagramLink;
use memory::MemoryLink;
use stream::StreamLink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Tls,
    Udp,
    Dtls,
    Memory,
}

/// How far a transport got when asked to shut down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShutdownProgress {
    /// The transport's I/O task completes the shutdown and reports when it is closed
    Pending,
    /// The transport is closed. `shutdown_done` tells whether a secure session was shut down
    ///  properly.
    Closed { shutdown_done: bool },
}

pub(crate) enum Transport {
    Stream(StreamLink),
    Datagram(DatagramLink),
    Memory(MemoryLink),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Stream(link) => link.kind(),
            Transport::Datagram(link) => link.kind(),
            Transport::Memory(_) => TransportKind::Memory,
        }
    }

    /// Datagram transports deliver exactly one message per datagram and can not carry a main
    ///  connection
    pub fn is_datagram(&self) -> bool {
        match self {
            Transport::Stream(_) => false,
            Transport::Datagram(_) => true,
            Transport::Memory(link) => link.is_datagram(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Stream(link) => Some(link.local_addr()),
            Transport::Datagram(link) => Some(link.local_addr()),
            Transport::Memory(_) => None,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Stream(link) => Some(link.remote_addr()),
            Transport::Datagram(link) => Some(link.remote_addr()),
            Transport::Memory(_) => None,
        }
    }

    /// Hands a chunk of complete messages to the transport. This never blocks.
    pub fn send(&mut self, data: Bytes) {
        match self {
            Transport::Stream(link) => link.send(data),
            Transport::Datagram(link) => link.send(data),
            Transport::Memory(link) => link.send(data),
        }
    }

    pub fn shutdown(&mut self) -> ShutdownProgress {
        match self {
            Transport::Stream(link) => {
                link.shutdown();
                ShutdownProgress::Pending
            }
            Transport::Datagram(link) => ShutdownProgress::Closed { shutdown_done: link.shutdown() },
            Transport::Memory(link) => {
                link.shutdown();
                ShutdownProgress::Closed { shutdown_done: true }
            }
        }
    }
}

/// Splits a buffer of complete messages into one buffer per message, based on the length in
///  each message's header
pub(crate) fn split_messages(mut data: Bytes) -> Vec<Bytes> {
    let mut result = Vec::new();
    while !data.is_empty() {
        let len: usize = match Header::peek(&data) {
            Some(header) => header.length.safe_cast(),
            None => 0,
        };
        if len < Header::SERIALIZED_LEN || len > data.len() {
            warn!("dropping {} bytes of outgoing data that are not a complete message", data.len());
            break;
        }
        result.push(data.split_to(len));
    }
    result
}
