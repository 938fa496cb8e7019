use std::io;
use std::net::SocketAddr;
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use crate::engine::config::ChannelSettings;
use crate::ids::{ConnectionId, ServerId};
use crate::protocol::message::FrameError;

/// A request for an outgoing TCP connection, either from the application or a scheduled
///  re-connect
pub(crate) struct ConnectRequest {
    pub remote: SocketAddr,
    pub settings: ChannelSettings,
    pub starting_xid: Option<u32>,
    pub reply: Option<oneshot::Sender<anyhow::Result<ConnectionId>>>,
}

/// Everything I/O tasks report back to the engine. Connections are referred to by id: an event
///  for a connection that no longer exists is ignored.
pub(crate) enum EngineEvent {
    Accepted {
        server: ServerId,
        stream: TcpStream,
        remote: SocketAddr,
    },
    Connected {
        request: ConnectRequest,
        result: io::Result<TcpStream>,
    },
    /// The transport is ready for OpenFlow traffic, i.e. a TLS handshake completed if there is one
    TransportReady {
        conn: ConnectionId,
    },
    Received {
        conn: ConnectionId,
        data: BytesMut,
    },
    /// A frame the I/O task could not hand over as a message
    DecodeError {
        conn: ConnectionId,
        error: FrameError,
    },
    Datagram {
        server: ServerId,
        from: SocketAddr,
        data: BytesMut,
    },
    Closed {
        conn: ConnectionId,
        shutdown_done: bool,
        error: Option<String>,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;
