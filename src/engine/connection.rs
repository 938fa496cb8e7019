use std::collections::BTreeMap;
use std::time::Duration;
use bitflags::bitflags;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::engine::channel::ChannelListener;
use crate::engine::config::ChannelSettings;
use crate::engine::handshake::Handshake;
use crate::ids::{ConnectionId, ServerId};
use crate::protocol::datapath_id::DatapathId;
use crate::protocol::message::Message;
use crate::protocol::messages::{echo_request, Features};
use crate::transport::Transport;

/// The xid of keep-alive echo requests. Replies with this xid and [KEEPALIVE_PAYLOAD] are
///  consumed by the driver.
pub const KEEPALIVE_XID: u32 = 0xffff_ffff;
pub const KEEPALIVE_PAYLOAD: &[u8] = b"KEEPALIV";

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConnectionFlags: u8 {
        const CHANNEL_UP = 1;
        /// a keep-alive probe was sent, and nothing was received since
        const IDLE = 2;
        const REQUIRES_HANDSHAKE = 4;
        const HANDSHAKE_DONE = 8;
        /// the transport's secure session was shut down properly
        const SHUTDOWN_DONE = 16;
        const SHUTDOWN_REQUESTED = 32;
        /// initiated by this side
        const OUTGOING = 64;
    }
}

/// Who handles a connection's messages. While a listener is being called, it is taken out of
///  its slot and the slot is `Dispatching`.
pub(crate) enum ListenerSlot {
    Empty,
    Handshake(Box<Handshake>),
    Application(Box<dyn ChannelListener>),
    Dispatching,
}

impl ListenerSlot {
    pub fn is_dispatching(&self) -> bool {
        matches!(self, ListenerSlot::Dispatching)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Active,
    /// the connection was idle, and a keep-alive echo request was sent
    Probed,
    TimedOut,
}

pub(crate) struct Connection {
    pub id: ConnectionId,
    pub transport: Transport,
    pub settings: ChannelSettings,
    /// the server that accepted the connection, or owns its UDP socket
    pub server: Option<ServerId>,
    pub version: u8,
    next_xid: u32,
    pub listener: ListenerSlot,
    pub datapath_id: DatapathId,
    pub auxiliary_id: u8,
    /// the connection's own id for main connections
    pub main_connection: ConnectionId,
    /// auxiliary connections by auxiliary id; only main connections have any
    pub auxiliaries: BTreeMap<u8, ConnectionId>,
    /// zero disables keep-alive
    pub keep_alive: Duration,
    pub latest_activity: Instant,
    pub flags: ConnectionFlags,
    outgoing: BytesMut,
    pub features: Option<Features>,
    /// re-connect when the connection is lost - cleared when the application closes it
    pub reconnect: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, transport: Transport, settings: ChannelSettings, server: Option<ServerId>, outgoing: bool, starting_xid: u32, now: Instant) -> Connection {
        let mut flags = ConnectionFlags::REQUIRES_HANDSHAKE;
        if outgoing {
            flags |= ConnectionFlags::OUTGOING;
        }
        let reconnect = outgoing && settings.reconnect_delay.is_some();

        Connection {
            id,
            transport,
            settings,
            server,
            version: 0,
            next_xid: starting_xid,
            listener: ListenerSlot::Handshake(Box::new(Handshake::new(now))),
            datapath_id: DatapathId::EMPTY,
            auxiliary_id: 0,
            main_connection: id,
            auxiliaries: BTreeMap::new(),
            keep_alive: Duration::ZERO,
            latest_activity: now,
            flags,
            outgoing: BytesMut::new(),
            features: None,
            reconnect,
        }
    }

    /// Marks the connection as not needing a handshake, with a fixed protocol version
    pub fn without_handshake(mut self, version: u8) -> Connection {
        self.flags.remove(ConnectionFlags::REQUIRES_HANDSHAKE);
        self.listener = ListenerSlot::Empty;
        self.version = version;
        self
    }

    pub fn is_main(&self) -> bool {
        self.main_connection == self.id
    }

    pub fn is_up(&self) -> bool {
        self.flags.contains(ConnectionFlags::CHANNEL_UP)
    }

    pub fn is_outgoing(&self) -> bool {
        self.flags.contains(ConnectionFlags::OUTGOING)
    }

    pub fn next_xid(&mut self) -> u32 {
        self.next_xid = self.next_xid.wrapping_add(1);
        self.next_xid
    }

    /// The xid counter's current value, i.e. the most recently used xid
    pub fn current_xid(&self) -> u32 {
        self.next_xid
    }

    pub fn write(&mut self, data: &[u8]) {
        self.outgoing.extend_from_slice(data);
    }

    pub fn flush(&mut self) {
        if self.outgoing.is_empty() {
            return;
        }
        let data = self.outgoing.split().freeze();
        trace!(conn = %self.id, "flushing {} bytes", data.len());
        self.transport.send(data);
    }

    pub fn send(&mut self, message: &Message) {
        self.write(message.data());
        self.flush();
    }

    pub fn touch(&mut self, now: Instant) {
        self.latest_activity = now;
        self.flags.remove(ConnectionFlags::IDLE);
    }

    /// Keep-alive: a connection that was idle for its keep-alive timeout is probed with an echo
    ///  request, once. If it stays idle for twice the timeout, it is timed out.
    pub fn poll(&mut self, now: Instant) -> PollOutcome {
        if self.keep_alive.is_zero() || !self.is_up() || self.flags.contains(ConnectionFlags::SHUTDOWN_REQUESTED) {
            return PollOutcome::Active;
        }

        let idle = now.saturating_duration_since(self.latest_activity);
        if idle < self.keep_alive {
            return PollOutcome::Active;
        }
        if idle >= 2 * self.keep_alive || self.version == 0 {
            return PollOutcome::TimedOut;
        }
        if self.flags.contains(ConnectionFlags::IDLE) {
            return PollOutcome::Active;
        }

        debug!(conn = %self.id, "idle for {:?}, sending keep-alive", idle);
        self.flags.insert(ConnectionFlags::IDLE);
        let probe = echo_request(self.version, KEEPALIVE_XID, KEEPALIVE_PAYLOAD);
        self.send(&probe);
        PollOutcome::Probed
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::sync::mpsc;
    use crate::engine::config::ChannelOptions;
    use crate::protocol::header::MessageType;
    use crate::protocol::versions::ProtocolVersions;
    use crate::transport::memory::{MemoryLink, MemoryPeer};

    fn connection(now: Instant) -> (Connection, MemoryPeer) {
        let (events, _) = mpsc::unbounded_channel();
        let (link, peer) = MemoryLink::pair(ConnectionId(1), false, events);
        let settings = ChannelSettings::new(ChannelOptions::DEFAULT_CONTROLLER, ProtocolVersions::ALL, None);
        let mut conn = Connection::new(ConnectionId(1), Transport::Memory(link), settings, None, false, 0, now);
        conn.flags.insert(ConnectionFlags::CHANNEL_UP);
        conn.version = 4;
        conn.keep_alive = Duration::from_secs(10);
        (conn, peer)
    }

    #[test]
    fn test_next_xid() {
        let (mut conn, _peer) = connection(Instant::now());
        assert_eq!(conn.next_xid(), 1);
        assert_eq!(conn.next_xid(), 2);
        assert_eq!(conn.current_xid(), 2);

        conn.next_xid = u32::MAX - 1;
        assert_eq!(conn.next_xid(), u32::MAX);
        assert_eq!(conn.next_xid(), 0);
    }

    #[test]
    fn test_write_and_flush() {
        let (mut conn, mut peer) = connection(Instant::now());
        let hello = Message::build(4, MessageType::Hello, 7, &[]);

        conn.write(hello.data());
        assert!(peer.try_recv().is_none());
        conn.flush();
        assert_eq!(peer.try_recv().map(|m| m.xid()), Some(7));
    }

    #[rstest]
    #[case::fresh(0, PollOutcome::Active, false)]
    #[case::just_below(9_999, PollOutcome::Active, false)]
    #[case::idle(10_000, PollOutcome::Probed, true)]
    #[case::still_idle(19_999, PollOutcome::Probed, true)]
    #[case::timed_out(20_000, PollOutcome::TimedOut, false)]
    fn test_poll(#[case] idle_millis: u64, #[case] expected: PollOutcome, #[case] probe_sent: bool) {
        let start = Instant::now();
        let (mut conn, mut peer) = connection(start);

        assert_eq!(conn.poll(start + Duration::from_millis(idle_millis)), expected);

        let probe = peer.try_recv();
        assert_eq!(probe.is_some(), probe_sent);
        if let Some(probe) = probe {
            assert_eq!(probe.message_type(), MessageType::EchoRequest);
            assert_eq!(probe.xid(), KEEPALIVE_XID);
            assert_eq!(probe.body(), KEEPALIVE_PAYLOAD);
        }
    }

    #[test]
    fn test_poll_probes_once() {
        let start = Instant::now();
        let (mut conn, mut peer) = connection(start);

        assert_eq!(conn.poll(start + Duration::from_secs(11)), PollOutcome::Probed);
        assert_eq!(conn.poll(start + Duration::from_secs(12)), PollOutcome::Active);
        assert_eq!(peer.drain().len(), 1);

        conn.touch(start + Duration::from_secs(13));
        assert!(!conn.flags.contains(ConnectionFlags::IDLE));
        assert_eq!(conn.poll(start + Duration::from_secs(22)), PollOutcome::Active);
        assert_eq!(conn.poll(start + Duration::from_secs(23)), PollOutcome::Probed);
    }

    #[test]
    fn test_poll_disabled() {
        let start = Instant::now();
        let (mut conn, _peer) = connection(start);
        conn.keep_alive = Duration::ZERO;
        assert_eq!(conn.poll(start + Duration::from_secs(100)), PollOutcome::Active);

        conn.keep_alive = Duration::from_secs(1);
        conn.flags.remove(ConnectionFlags::CHANNEL_UP);
        assert_eq!(conn.poll(start + Duration::from_secs(100)), PollOutcome::Active);
    }

    #[test]
    fn test_poll_without_version() {
        let start = Instant::now();
        let (mut conn, _peer) = connection(start);
        conn.version = 0;
        assert_eq!(conn.poll(start + Duration::from_secs(10)), PollOutcome::TimedOut);
    }
}
