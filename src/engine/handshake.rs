use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::engine::config::ChannelOptions;
use crate::engine::engine_core::EngineCore;
use crate::engine::timers::TimerEvent;
use crate::ids::ConnectionId;
use crate::protocol::header::{Header, MessageType, OFP_VERSION_3};
use crate::protocol::message::Message;
use crate::protocol::messages::{features_request, port_desc_request, ErrorMessage, Features, Hello, MultipartReply};
use crate::protocol::versions::ProtocolVersions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    Init,
    SentHello,
    SentFeaturesRequest,
    SentPortDescRequest,
    Done,
}

/// What the connection should do after the handshake handled an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeStep {
    /// keep the handshake as the connection's listener
    Continue,
    /// install the application's listener
    Complete,
    /// the connection is an auxiliary: its messages go to the main connection's listener
    Detach,
    /// shut the connection down
    Abort,
}

/// The OpenFlow handshake as the initial listener of every connection: exchange Hellos and
///  negotiate a version, and with [ChannelOptions::FEATURES_REQ] request the features and
///  (1.3 and later) the port descriptions, registering the datapath with the engine.
pub(crate) struct Handshake {
    state: HandshakeState,
    /// restarted when the features request is sent
    started: Instant,
}

impl Handshake {
    pub fn new(now: Instant) -> Handshake {
        Handshake {
            state: HandshakeState::Init,
            started: now,
        }
    }

    pub fn on_channel_up(&mut self, core: &mut EngineCore, conn_id: ConnectionId, now: Instant) -> HandshakeStep {
        let conn = match core.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return HandshakeStep::Abort,
        };

        let xid = conn.next_xid();
        conn.send(&Hello::build(conn.settings.versions, xid));
        debug!(conn = %conn_id, "sent hello for versions {}", conn.settings.versions);

        self.state = HandshakeState::SentHello;
        self.started = now;
        HandshakeStep::Continue
    }

    pub fn on_message(&mut self, core: &mut EngineCore, conn_id: ConnectionId, message: &Message, now: Instant) -> HandshakeStep {
        match (self.state, message.message_type()) {
            (HandshakeState::SentHello, MessageType::Hello) => self.on_hello(core, conn_id, message, now),
            (HandshakeState::SentFeaturesRequest, MessageType::FeaturesReply) => self.on_features_reply(core, conn_id, message),
            (HandshakeState::SentPortDescRequest, MessageType::MultipartReply) => self.on_port_desc_reply(core, conn_id, message),
            (_, MessageType::Error) => {
                match ErrorMessage::parse(message) {
                    Ok(error) => warn!(conn = %conn_id, "error during handshake: type {}, code {}, {:?}", error.error_type, error.code, String::from_utf8_lossy(&error.data)),
                    Err(e) => warn!(conn = %conn_id, "invalid error message during handshake: {}", e),
                }
                HandshakeStep::Continue
            }
            (state, message_type) => {
                debug!(conn = %conn_id, "ignoring unexpected {:?} in handshake state {:?}", message_type, state);
                HandshakeStep::Continue
            }
        }
    }

    /// Called when the handshake deadline expires. The deadline is scheduled once, so it is
    ///  re-scheduled here if the handshake was restarted in the meantime.
    pub fn on_deadline(&mut self, core: &mut EngineCore, conn_id: ConnectionId, now: Instant) -> HandshakeStep {
        if self.state == HandshakeState::Done {
            return HandshakeStep::Continue;
        }

        let deadline = self.started + core.config.handshake_timeout;
        if now < deadline {
            core.timers.schedule(deadline, TimerEvent::HandshakeDeadline { conn: conn_id });
            return HandshakeStep::Continue;
        }

        warn!(conn = %conn_id, "handshake timed out in state {:?}", self.state);
        HandshakeStep::Abort
    }

    fn on_hello(&mut self, core: &mut EngineCore, conn_id: ConnectionId, message: &Message, now: Instant) -> HandshakeStep {
        let controller_keep_alive = core.config.controller_keep_alive;
        let raw_keep_alive = core.config.raw_keep_alive;

        let conn = match core.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return HandshakeStep::Abort,
        };

        let versions = conn.settings.versions;
        let peer_versions = Hello::version_bitmap(message).unwrap_or(ProtocolVersions::NONE);
        let version = versions.negotiate_version(message.version(), peer_versions);

        if version == 0 {
            let explanation = format!("Incompatible OpenFlow version: {} {} Supported versions: {}", message.version(), peer_versions, versions);
            warn!(conn = %conn_id, "{}", explanation);

            // the connecting controller leaves it to the switch to report the error
            if !conn.is_outgoing() || !conn.settings.options.contains(ChannelOptions::FEATURES_REQ) {
                conn.send(&ErrorMessage::hello_failed(&explanation).build(message.version(), message.xid()));
            }
            core.alert(conn_id, &explanation, &message.data()[..Header::SERIALIZED_LEN]);
            return HandshakeStep::Abort;
        }

        info!(conn = %conn_id, "negotiated version {}, peer version {} {}", version, message.version(), peer_versions);
        conn.version = version;

        if conn.settings.options.contains(ChannelOptions::FEATURES_REQ) {
            conn.keep_alive = controller_keep_alive;
            let xid = conn.next_xid();
            conn.send(&features_request(version, xid));
            self.state = HandshakeState::SentFeaturesRequest;
            self.started = now;
            HandshakeStep::Continue
        }
        else {
            conn.keep_alive = raw_keep_alive;
            self.state = HandshakeState::Done;
            HandshakeStep::Complete
        }
    }

    fn on_features_reply(&mut self, core: &mut EngineCore, conn_id: ConnectionId, message: &Message) -> HandshakeStep {
        let features = match Features::from_message(message) {
            Ok(features) => features,
            Err(e) => {
                warn!(conn = %conn_id, "invalid features reply: {}", e);
                return HandshakeStep::Abort;
            }
        };
        let datapath_id = features.datapath_id();
        let auxiliary_id = features.auxiliary_id();

        match core.connections.get_mut(conn_id) {
            Some(conn) => conn.features = Some(features),
            None => return HandshakeStep::Abort,
        }

        if let Err(e) = core.post_datapath(conn_id, datapath_id, auxiliary_id) {
            warn!(conn = %conn_id, dpid = %datapath_id, "rejecting connection: {}", e);
            return HandshakeStep::Abort;
        }

        let conn = match core.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return HandshakeStep::Abort,
        };

        if auxiliary_id != 0 && !conn.is_main() {
            self.state = HandshakeState::Done;
            return HandshakeStep::Detach;
        }

        if conn.version <= OFP_VERSION_3 {
            self.state = HandshakeState::Done;
            return HandshakeStep::Complete;
        }

        let xid = conn.next_xid();
        conn.send(&port_desc_request(conn.version, xid));
        self.state = HandshakeState::SentPortDescRequest;
        HandshakeStep::Continue
    }

    fn on_port_desc_reply(&mut self, core: &mut EngineCore, conn_id: ConnectionId, message: &Message) -> HandshakeStep {
        let reply = match MultipartReply::parse(message) {
            Ok(reply) if reply.is_port_desc() => reply,
            Ok(reply) => {
                debug!(conn = %conn_id, "ignoring multipart reply of type {} during handshake", reply.multipart_type);
                return HandshakeStep::Continue;
            }
            Err(e) => {
                warn!(conn = %conn_id, "invalid multipart reply: {}", e);
                return HandshakeStep::Continue;
            }
        };

        let features = match core.connections.get_mut(conn_id).and_then(|c| c.features.as_mut()) {
            Some(features) => features,
            None => return HandshakeStep::Abort,
        };
        if !features.add_ports(reply.payload) {
            warn!(conn = %conn_id, "too many port descriptions, ignoring {} bytes", reply.payload.len());
        }

        if reply.has_more() {
            HandshakeStep::Continue
        }
        else {
            self.state = HandshakeState::Done;
            HandshakeStep::Complete
        }
    }
}
