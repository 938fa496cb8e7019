//! An in-memory transport for exercising the engine without sockets: the engine side is a
//!  [MemoryLink], and the test plays the peer through the matching [MemoryPeer].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;
use crate::engine::event::{EngineEvent, EventSender};
use crate::ids::ConnectionId;
use crate::protocol::header::Header;
use crate::protocol::message::Message;
use crate::transport::split_messages;
use crate::util::safe_converter::SafeCast;

pub(crate) struct MemoryLink {
    datagram: bool,
    sent: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl MemoryLink {
    /// Creates a link for connection `conn`. With `datagram`, the link behaves like a datagram
    ///  transport, i.e. every message is sent separately.
    pub fn pair(conn: ConnectionId, datagram: bool, events: EventSender) -> (MemoryLink, MemoryPeer) {
        let (sent, received) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let link = MemoryLink {
            datagram,
            sent,
            closed: closed.clone(),
        };
        let peer = MemoryPeer {
            conn,
            events,
            received,
            pending: BytesMut::new(),
            closed,
        };
        (link, peer)
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    pub fn send(&self, data: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            debug!("memory link is closed, dropping outgoing data");
            return;
        }
        let chunks = if self.datagram { split_messages(data) } else { vec![data] };
        for chunk in chunks {
            let _ = self.sent.send(chunk);
        }
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// The remote end of an in-memory connection
pub struct MemoryPeer {
    conn: ConnectionId,
    events: EventSender,
    received: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    /// Delivers a message to the engine as if it had arrived on the connection
    pub fn send(&self, message: &Message) {
        self.send_raw(message.data());
    }

    pub fn send_raw(&self, data: &[u8]) {
        let _ = self.events.send(EngineEvent::Received {
            conn: self.conn,
            data: BytesMut::from(data),
        });
    }

    /// Closes the connection from the peer's side
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.events.send(EngineEvent::Closed {
            conn: self.conn,
            shutdown_done: true,
            error: None,
        });
    }

    /// `true` once either side closed the connection
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the next message the engine sent, if there is one already
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.next_pending() {
                return Some(message);
            }
            match self.received.try_recv() {
                Ok(data) => self.pending.extend_from_slice(&data),
                Err(_) => return None,
            }
        }
    }

    /// Waits for the next message the engine sends. Returns `None` when the engine dropped the
    ///  connection.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.next_pending() {
                return Some(message);
            }
            let data = self.received.recv().await?;
            self.pending.extend_from_slice(&data);
        }
    }

    /// Returns all messages the engine sent so far
    pub fn drain(&mut self) -> Vec<Message> {
        let mut result = Vec::new();
        while let Some(message) = self.try_recv() {
            result.push(message);
        }
        result
    }

    fn next_pending(&mut self) -> Option<Message> {
        loop {
            let header = Header::peek(&self.pending)?;
            let length: usize = header.length.safe_cast();
            if length < Header::SERIALIZED_LEN {
                // nothing sensible can follow
                self.pending.clear();
                return None;
            }
            if self.pending.len() < length {
                return None;
            }
            let buf = self.pending.split_to(length);
            match Message::new(buf) {
                Ok(message) => return Some(message),
                Err(e) => debug!("engine sent invalid message: {}", e),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::MessageType;

    #[test]
    fn test_stream_link_frames_messages() {
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (link, mut peer) = MemoryLink::pair(ConnectionId(3), false, events);

        let hello = Message::build(4, MessageType::Hello, 1, &[]);
        let echo = Message::build(4, MessageType::EchoRequest, 2, b"xyz");
        let mut data = hello.data().to_vec();
        data.extend_from_slice(echo.data());
        link.send(Bytes::from(data));

        let received = peer.drain();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].message_type(), MessageType::Hello);
        assert_eq!(received[1].xid(), 2);

        peer.send(&hello);
        match events_rx.try_recv() {
            Ok(EngineEvent::Received { conn, data }) => {
                assert_eq!(conn, ConnectionId(3));
                assert_eq!(&data[..], hello.data());
            }
            _ => panic!("expected a received event"),
        }
    }

    #[test]
    fn test_shutdown() {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (link, mut peer) = MemoryLink::pair(ConnectionId(3), true, events);
        assert!(link.is_datagram());
        assert!(!peer.is_closed());

        link.shutdown();
        assert!(peer.is_closed());
        link.send(Bytes::copy_from_slice(Message::build(4, MessageType::Hello, 1, &[]).data()));
        assert!(peer.try_recv().is_none());
    }
}
