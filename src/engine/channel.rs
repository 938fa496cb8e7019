use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::warn;
use crate::engine::connection::{Connection, ListenerSlot};
use crate::engine::engine_core::EngineCore;
use crate::ids::{ConnectionId, SecurityId};
use crate::protocol::datapath_id::DatapathId;
use crate::protocol::message::{FrameError, Message};
use crate::protocol::messages::Features;
use crate::transport::TransportKind;

/// The application's side of a channel. A listener is created by the channel's
///  [ListenerFactory] once the handshake completes, and it receives the messages of the channel
///  and all of its auxiliary channels.
///
/// Callbacks run on the engine's event loop, so they must not block.
pub trait ChannelListener: Send {
    fn on_channel_up(&mut self, channel: &mut Channel<'_>);

    fn on_channel_down(&mut self, _channel: &mut Channel<'_>) {}

    /// `channel` is the connection the message arrived on, which is an auxiliary connection of
    ///  the listener's main connection if the two differ
    fn on_message(&mut self, channel: &mut Channel<'_>, message: &Message);

    /// called on every idle interval
    fn on_tickle(&mut self, _channel: &mut Channel<'_>) {}
}

pub type ListenerFactory = Arc<dyn Fn() -> Box<dyn ChannelListener> + Send + Sync>;

/// Out-of-band notifications for monitoring, e.g. version mismatches and keep-alive timeouts
#[cfg_attr(test, automock)]
pub trait AlertMonitor: Send + Sync + 'static {
    fn on_alert(&self, conn: ConnectionId, alert: &str, data: &[u8]);

    fn on_decode_error(&self, conn: ConnectionId, error: &FrameError);
}

pub struct LoggingAlertMonitor;

impl AlertMonitor for LoggingAlertMonitor {
    fn on_alert(&self, conn: ConnectionId, alert: &str, data: &[u8]) {
        warn!(%conn, "alert: {} ({} bytes of data)", alert, data.len());
    }

    fn on_decode_error(&self, conn: ConnectionId, error: &FrameError) {
        warn!(%conn, "dropping invalid message: {}", error);
    }
}

/// A listener's view of a connection, valid for the duration of a callback
pub struct Channel<'a> {
    core: &'a mut EngineCore,
    id: ConnectionId,
}

impl<'a> Channel<'a> {
    pub(crate) fn new(core: &'a mut EngineCore, id: ConnectionId) -> Channel<'a> {
        Channel { core, id }
    }

    fn conn(&self) -> Option<&Connection> {
        self.core.connections.get(self.id)
    }

    fn conn_mut(&mut self) -> Option<&mut Connection> {
        self.core.connections.get_mut(self.id)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// The negotiated protocol version, 0 before the handshake negotiated one
    pub fn version(&self) -> u8 {
        self.conn().map(|c| c.version).unwrap_or(0)
    }

    pub fn datapath_id(&self) -> DatapathId {
        self.conn().map(|c| c.datapath_id).unwrap_or(DatapathId::EMPTY)
    }

    pub fn auxiliary_id(&self) -> u8 {
        self.conn().map(|c| c.auxiliary_id).unwrap_or(0)
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.conn().map(|c| c.transport.kind())
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.conn().and_then(|c| c.transport.remote_addr())
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.conn().and_then(|c| c.transport.local_addr())
    }

    pub fn main_connection_id(&self) -> ConnectionId {
        self.conn().map(|c| c.main_connection).unwrap_or(self.id)
    }

    pub fn security_id(&self) -> Option<SecurityId> {
        self.conn().and_then(|c| c.settings.security_id)
    }

    /// The switch's features as learned during the handshake, including its ports
    pub fn features(&self) -> Option<&Features> {
        self.conn().and_then(|c| c.features.as_ref())
    }

    pub fn next_xid(&mut self) -> u32 {
        self.conn_mut().map(|c| c.next_xid()).unwrap_or(0)
    }

    /// Appends data to the channel's outgoing buffer. Nothing is sent before [Channel::flush].
    pub fn write(&mut self, data: &[u8]) {
        if let Some(conn) = self.conn_mut() {
            conn.write(data);
        }
    }

    pub fn flush(&mut self) {
        if let Some(conn) = self.conn_mut() {
            conn.flush();
        }
    }

    /// Writes and flushes a complete message
    pub fn send(&mut self, message: &Message) {
        if let Some(conn) = self.conn_mut() {
            conn.send(message);
        }
    }

    /// Closes the connection. The listener is notified by [ChannelListener::on_channel_down]
    ///  once the connection is gone.
    pub fn shutdown(&mut self) {
        self.core.close(self.id);
    }

    pub fn alert(&mut self, alert: &str, data: &[u8]) {
        self.core.alert(self.id, alert, data);
    }

    /// Replaces this connection's listener. If called from a callback of the current
    ///  listener, the current listener is dropped when the callback returns.
    pub fn set_listener(&mut self, listener: Box<dyn ChannelListener>) {
        if let Some(conn) = self.conn_mut() {
            conn.listener = ListenerSlot::Application(listener);
        }
    }

    /// Removes this connection's listener, dropping subsequent messages
    pub fn clear_listener(&mut self) {
        if let Some(conn) = self.conn_mut() {
            conn.listener = ListenerSlot::Empty;
        }
    }
}
