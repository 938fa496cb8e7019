use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::engine::channel::{AlertMonitor, Channel};
use crate::engine::config::{ChannelOptions, ChannelSettings, EngineConfig};
use crate::engine::connection::{Connection, ConnectionFlags, ListenerSlot, PollOutcome, KEEPALIVE_PAYLOAD, KEEPALIVE_XID};
use crate::engine::engine::ConnectionInfo;
use crate::engine::event::{ConnectRequest, EngineEvent, EventSender};
use crate::engine::handshake::{Handshake, HandshakeStep};
use crate::engine::registry::ConnectionTable;
use crate::engine::server::{Server, ServerInfo, UdpEndpoint};
use crate::engine::timers::{TimerEvent, TimerQueue};
use crate::ids::{ConnectionId, IdGenerator, SecurityId, ServerId};
use crate::protocol::datapath_id::DatapathId;
use crate::protocol::header::{Header, MessageType};
use crate::protocol::message::{FrameError, Message};
use crate::security::dtls_record::is_handshake_start;
use crate::security::identity::{Identity, SecureTransport};
use crate::security::security_check::HandshakeContext;
use crate::transport::datagram::{spawn_receiver, DatagramEvent, DatagramLink, DatagramSender};
use crate::transport::memory::{MemoryLink, MemoryPeer};
use crate::transport::stream::{spawn_acceptor, spawn_connect, spawn_stream, StreamSecurity};
use crate::transport::{ShutdownProgress, Transport};

/// All protocol state of an engine: connections, servers, registrations and timers. The core
///  is owned by the engine's event loop and is never shared; I/O tasks talk to it through
///  [EngineEvent]s only.
pub(crate) struct EngineCore {
    pub config: EngineConfig,
    pub connections: ConnectionTable,
    datapaths: FxHashMap<DatapathId, ConnectionId>,
    servers: BTreeMap<ServerId, Server>,
    identities: FxHashMap<SecurityId, Arc<Identity>>,
    pub timers: TimerQueue,
    events: EventSender,
    monitor: Arc<dyn AlertMonitor>,
    connection_ids: IdGenerator,
    server_ids: IdGenerator,
    security_ids: IdGenerator,
    /// the grace period, once the engine is stopping
    stopping: Option<Duration>,
    finished: bool,
}

impl EngineCore {
    pub fn new(config: EngineConfig, monitor: Arc<dyn AlertMonitor>, events: EventSender) -> EngineCore {
        EngineCore {
            config,
            connections: ConnectionTable::default(),
            datapaths: FxHashMap::default(),
            servers: BTreeMap::new(),
            identities: FxHashMap::default(),
            timers: TimerQueue::default(),
            events,
            monitor,
            connection_ids: IdGenerator::default(),
            server_ids: IdGenerator::default(),
            security_ids: IdGenerator::default(),
            stopping: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn alert(&self, conn: ConnectionId, alert: &str, data: &[u8]) {
        self.monitor.on_alert(conn, alert, data);
    }

    pub fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Accepted { server, stream, remote } => self.on_accepted(server, stream, remote),
            EngineEvent::Connected { request, result } => self.on_connected(request, result),
            EngineEvent::TransportReady { conn } => self.channel_up(conn),
            EngineEvent::Received { conn, data } => self.post_message(conn, data),
            EngineEvent::DecodeError { conn, error } => self.decode_error(conn, &error),
            EngineEvent::Datagram { server, from, data } => self.datagram_received(server, from, data),
            EngineEvent::Closed { conn, shutdown_done, error } => self.connection_closed(conn, shutdown_done, error),
        }
    }

    //----------------------------------------------------------------------------------------
    // identities and servers

    pub fn add_identity(&mut self, cert_chain_pem: &[u8], private_key_pem: &[u8], trusted_ca_pem: &[u8]) -> anyhow::Result<SecurityId> {
        let security_id = SecurityId(self.security_ids.next());
        let identity = Identity::new(security_id, cert_chain_pem, private_key_pem, trusted_ca_pem)?;
        self.identities.insert(security_id, Arc::new(identity));
        info!(%security_id, "added identity");
        Ok(security_id)
    }

    fn identity(&self, security_id: Option<SecurityId>) -> anyhow::Result<Option<Arc<Identity>>> {
        match security_id {
            None => Ok(None),
            Some(id) => self.identities.get(&id)
                .cloned()
                .map(Some)
                .ok_or_else(|| anyhow!("unknown security id {}", id)),
        }
    }

    fn check_settings(&self, settings: &ChannelSettings) -> anyhow::Result<()> {
        if self.stopping.is_some() {
            bail!("engine is stopping");
        }
        settings.validate()?;
        self.identity(settings.security_id)?;
        Ok(())
    }

    pub fn listen(&mut self, tcp: TcpListener, udp: Option<UdpSocket>, settings: ChannelSettings) -> anyhow::Result<ServerInfo> {
        self.check_settings(&settings)?;

        let id = ServerId(self.server_ids.next());
        let tcp_addr = tcp.local_addr()?;
        let mut tasks = vec![spawn_acceptor(id, tcp, self.events.clone())];

        let udp = match udp {
            None => None,
            Some(socket) => {
                let socket = Arc::new(socket);
                let local = socket.local_addr()?;
                let (sender, send_task) = DatagramSender::spawn(Arc::new(socket.clone()));
                tasks.push(send_task);
                tasks.push(spawn_receiver(id, socket, self.config.max_datagram_size, self.events.clone()));
                Some(UdpEndpoint {
                    local,
                    sender,
                    connections: FxHashMap::default(),
                    accepts_new: true,
                })
            }
        };

        let server = Server::new(id, settings, Some(tcp_addr), udp, None, tasks);
        let info = server.info();
        info!(server = %id, "listening on {:?} (UDP: {:?})", info.tcp_addr, info.udp_addr);
        self.servers.insert(id, server);
        Ok(info)
    }

    /// Stops accepting connections on a server. Connections on its UDP socket are closed, TCP
    ///  connections it accepted are not affected.
    pub fn close_server(&mut self, id: ServerId) -> bool {
        if !self.servers.contains_key(&id) {
            return false;
        }

        let on_socket: Vec<ConnectionId> = self.connections.values()
            .filter(|c| c.server == Some(id) && c.transport.is_datagram())
            .map(|c| c.id)
            .collect();
        for conn in on_socket {
            self.close(conn);
        }

        self.servers.remove(&id);
        info!(server = %id, "closed server");
        true
    }

    pub fn servers(&self) -> Vec<ServerInfo> {
        self.servers.values()
            .filter(|s| s.owner.is_none())
            .map(|s| s.info())
            .collect()
    }

    //----------------------------------------------------------------------------------------
    // creating connections

    fn new_connection_id(&mut self) -> ConnectionId {
        ConnectionId(self.connection_ids.next())
    }

    fn add_connection(&mut self, conn: Connection) -> anyhow::Result<()> {
        let id = conn.id;
        let requires_handshake = conn.flags.contains(ConnectionFlags::REQUIRES_HANDSHAKE);
        self.connections.insert(conn)?;
        if requires_handshake {
            // covers a TLS / DTLS handshake before the OpenFlow handshake starts
            self.timers.schedule(Instant::now() + self.config.handshake_timeout, TimerEvent::HandshakeDeadline { conn: id });
        }
        debug!(conn = %id, "added connection");
        Ok(())
    }

    fn stream_security(&self, conn_id: ConnectionId, settings: &ChannelSettings, remote: SocketAddr, is_client: bool) -> anyhow::Result<Option<StreamSecurity>> {
        Ok(self.identity(settings.security_id)?
            .map(|identity| StreamSecurity {
                ctx: HandshakeContext {
                    conn_id,
                    security_id: identity.security_id(),
                    transport: SecureTransport::Tls,
                    remote,
                    is_client,
                },
                identity,
            }))
    }

    pub fn connect(&mut self, request: ConnectRequest) {
        if let Err(e) = self.check_settings(&request.settings) {
            if let Some(reply) = request.reply {
                let _ = reply.send(Err(e));
            }
            return;
        }
        spawn_connect(request, self.events.clone());
    }

    fn on_connected(&mut self, request: ConnectRequest, result: std::io::Result<TcpStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.connect_failed(request, e.into());
                return;
            }
        };

        let id = self.new_connection_id();
        let link = self.stream_security(id, &request.settings, request.remote, true)
            .and_then(|security| spawn_stream(id, stream, security, self.events.clone()));
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                self.connect_failed(request, e);
                return;
            }
        };

        info!(conn = %id, "connected to {:?}", request.remote);
        let conn = Connection::new(id, Transport::Stream(link), request.settings, None, true, request.starting_xid.unwrap_or(0), Instant::now());
        let result = self.add_connection(conn).map(|_| id);
        if let Some(reply) = request.reply {
            let _ = reply.send(result);
        }
    }

    fn connect_failed(&mut self, request: ConnectRequest, error: anyhow::Error) {
        warn!("connecting to {:?} failed: {}", request.remote, error);
        match request.reply {
            Some(reply) => {
                let _ = reply.send(Err(error));
            }
            None => {
                // a re-connect: keep trying
                if let (Some(delay), None) = (request.settings.reconnect_delay, self.stopping) {
                    self.timers.schedule(Instant::now() + delay, TimerEvent::Reconnect {
                        remote: request.remote,
                        settings: request.settings,
                        starting_xid: request.starting_xid.unwrap_or(0),
                    });
                }
            }
        }
    }

    fn on_accepted(&mut self, server_id: ServerId, stream: TcpStream, remote: SocketAddr) {
        let settings = match self.servers.get(&server_id) {
            Some(server) if self.stopping.is_none() => server.settings.clone(),
            _ => {
                debug!("server {} is closed, dropping connection from {:?}", server_id, remote);
                return;
            }
        };

        let id = self.new_connection_id();
        let link = self.stream_security(id, &settings, remote, false)
            .and_then(|security| spawn_stream(id, stream, security, self.events.clone()));
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                warn!("failed to set up connection from {:?}: {}", remote, e);
                return;
            }
        };

        info!(conn = %id, server = %server_id, "accepted connection from {:?}", remote);
        let conn = Connection::new(id, Transport::Stream(link), settings, Some(server_id), false, 0, Instant::now());
        if let Err(e) = self.add_connection(conn) {
            warn!("failed to add connection from {:?}: {}", remote, e);
        }
    }

    /// Opens a UDP 'connection' to `remote` on its own socket
    pub fn connect_udp(&mut self, socket: UdpSocket, remote: SocketAddr, settings: ChannelSettings) -> anyhow::Result<ConnectionId> {
        self.check_settings(&settings)?;
        let identity = self.identity(settings.security_id)?;

        let socket = Arc::new(socket);
        let local = socket.local_addr()?;
        let server_id = ServerId(self.server_ids.next());
        let id = self.new_connection_id();

        let (sender, send_task) = DatagramSender::spawn(Arc::new(socket.clone()));
        let receive_task = spawn_receiver(server_id, socket, self.config.max_datagram_size, self.events.clone());

        let link = match identity {
            None => DatagramLink::plain(local, remote, sender.clone()),
            Some(identity) => {
                let ctx = HandshakeContext {
                    conn_id: id,
                    security_id: identity.security_id(),
                    transport: SecureTransport::Dtls,
                    remote,
                    is_client: true,
                };
                DatagramLink::secure(local, remote, sender.clone(), identity, ctx, self.config.dtls_mtu)?
            }
        };
        let ready = link.is_ready();

        let mut connections = FxHashMap::default();
        connections.insert(remote, id);
        let udp = UdpEndpoint {
            local,
            sender,
            connections,
            accepts_new: false,
        };
        self.servers.insert(server_id, Server::new(server_id, settings.clone(), None, Some(udp), Some(id), vec![send_task, receive_task]));

        let mut conn = Connection::new(id, Transport::Datagram(link), settings, Some(server_id), true, 0, Instant::now());
        conn.reconnect = false;
        if let Err(e) = self.add_connection(conn) {
            self.servers.remove(&server_id);
            return Err(e);
        }
        info!(conn = %id, "opened UDP connection from {:?} to {:?}", local, remote);

        if ready {
            self.channel_up(id);
        }
        else if let Some(Transport::Datagram(link)) = self.connections.get_mut(id).map(|c| &mut c.transport) {
            link.start();
        }
        Ok(id)
    }

    /// Adds a connection over an in-memory link. With `version`, the connection skips the
    ///  handshake and uses that version right away.
    pub fn attach_memory(&mut self, settings: ChannelSettings, datagram: bool, outgoing: bool, version: Option<u8>) -> anyhow::Result<MemoryPeer> {
        self.check_settings(&settings)?;

        let id = self.new_connection_id();
        let (link, peer) = MemoryLink::pair(id, datagram, self.events.clone());
        let mut conn = Connection::new(id, Transport::Memory(link), settings, None, outgoing, 0, Instant::now());
        conn.reconnect = false;
        if let Some(version) = version {
            conn = conn.without_handshake(version);
        }

        self.add_connection(conn)?;
        self.channel_up(id);
        Ok(peer)
    }

    //----------------------------------------------------------------------------------------
    // listeners

    pub fn channel_up(&mut self, conn_id: ConnectionId) {
        let now = Instant::now();
        let requires_handshake = match self.connections.get_mut(conn_id) {
            Some(conn) if !conn.is_up() => {
                conn.flags.insert(ConnectionFlags::CHANNEL_UP);
                conn.touch(now);
                conn.flags.contains(ConnectionFlags::REQUIRES_HANDSHAKE)
            }
            _ => return,
        };
        debug!(conn = %conn_id, "channel up");

        if !requires_handshake {
            self.install_application_listener(conn_id);
            return;
        }

        match self.take_listener(conn_id) {
            Some(ListenerSlot::Handshake(mut handshake)) => {
                let step = handshake.on_channel_up(self, conn_id, now);
                self.apply_handshake_step(conn_id, handshake, step);
            }
            Some(other) => self.restore_listener(conn_id, other),
            None => {}
        }
    }

    fn take_listener(&mut self, conn_id: ConnectionId) -> Option<ListenerSlot> {
        self.connections.get_mut(conn_id)
            .map(|conn| std::mem::replace(&mut conn.listener, ListenerSlot::Dispatching))
    }

    /// Puts a listener back after a callback - unless the callback installed a different one
    fn restore_listener(&mut self, conn_id: ConnectionId, listener: ListenerSlot) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            if conn.listener.is_dispatching() {
                conn.listener = listener;
            }
        }
    }

    fn apply_handshake_step(&mut self, conn_id: ConnectionId, handshake: Box<Handshake>, step: HandshakeStep) {
        match step {
            HandshakeStep::Continue => self.restore_listener(conn_id, ListenerSlot::Handshake(handshake)),
            HandshakeStep::Complete => {
                debug!(conn = %conn_id, "handshake complete");
                self.install_application_listener(conn_id);
            }
            HandshakeStep::Detach => {
                debug!(conn = %conn_id, "handshake complete for auxiliary connection");
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.flags.insert(ConnectionFlags::HANDSHAKE_DONE);
                }
                self.restore_listener(conn_id, ListenerSlot::Empty);
            }
            HandshakeStep::Abort => {
                self.restore_listener(conn_id, ListenerSlot::Empty);
                self.shutdown_connection(conn_id);
            }
        }
    }

    fn install_application_listener(&mut self, conn_id: ConnectionId) {
        let (factory, features) = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.flags.insert(ConnectionFlags::HANDSHAKE_DONE);
                conn.listener = ListenerSlot::Dispatching;
                (conn.settings.factory.clone(), conn.features.as_ref().map(|f| f.to_message().with_source(conn_id)))
            }
            None => return,
        };

        let factory = match factory {
            Some(factory) => factory,
            None => {
                debug!(conn = %conn_id, "no listener factory, messages will be dropped");
                self.restore_listener(conn_id, ListenerSlot::Empty);
                return;
            }
        };

        let mut listener = factory();
        {
            let mut channel = Channel::new(self, conn_id);
            listener.on_channel_up(&mut channel);
            if let Some(features) = &features {
                listener.on_message(&mut channel, features);
            }
        }
        self.restore_listener(conn_id, ListenerSlot::Application(listener));
    }

    //----------------------------------------------------------------------------------------
    // messages

    pub fn post_message(&mut self, conn_id: ConnectionId, data: BytesMut) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => {
                trace!(conn = %conn_id, "dropping message for closed connection");
                return;
            }
        };
        conn.touch(Instant::now());

        let message = Message::new(data)
            .and_then(|m| m.validate().map(|_| m));
        let mut message = match message {
            Ok(message) => message.with_source(conn_id),
            Err(e) => {
                debug!(conn = %conn_id, "invalid message: {}", e);
                self.monitor.on_decode_error(conn_id, &e);
                return;
            }
        };

        match message.message_type() {
            MessageType::EchoRequest if conn.version != 0 => {
                message.set_type(MessageType::EchoReply);
                conn.send(&message);
                return;
            }
            MessageType::EchoReply if message.xid() == KEEPALIVE_XID && message.body() == KEEPALIVE_PAYLOAD => {
                trace!(conn = %conn_id, "keep-alive reply");
                return;
            }
            _ => {}
        }

        self.dispatch(conn_id, message);
    }

    fn decode_error(&mut self, conn_id: ConnectionId, error: &FrameError) {
        if self.connections.get(conn_id).is_some() {
            debug!(conn = %conn_id, "invalid frame: {}", error);
            self.monitor.on_decode_error(conn_id, error);
        }
    }

    /// Hands a message to the listener of the main connection of `source`
    fn dispatch(&mut self, source: ConnectionId, message: Message) {
        let target = match self.connections.get(source) {
            Some(conn) if self.connections.get(conn.main_connection).is_some() => conn.main_connection,
            Some(_) => source,
            None => return,
        };

        match self.take_listener(target) {
            Some(ListenerSlot::Handshake(mut handshake)) => {
                if target != source {
                    debug!(conn = %source, "main connection {} is still in its handshake, dropping message", target);
                    self.restore_listener(target, ListenerSlot::Handshake(handshake));
                    return;
                }
                let step = handshake.on_message(self, source, &message, Instant::now());
                self.apply_handshake_step(source, handshake, step);
            }
            Some(ListenerSlot::Application(mut listener)) => {
                listener.on_message(&mut Channel::new(self, source), &message);
                self.restore_listener(target, ListenerSlot::Application(listener));
            }
            Some(ListenerSlot::Empty) => {
                trace!(conn = %source, "no listener, dropping {:?}", message.message_type());
                self.restore_listener(target, ListenerSlot::Empty);
            }
            Some(ListenerSlot::Dispatching) => {
                warn!(conn = %source, "listener is busy, dropping {:?}", message.message_type());
            }
            None => {}
        }
    }

    pub fn send(&mut self, conn_id: ConnectionId, message: &Message) -> bool {
        match self.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.send(message);
                true
            }
            None => false,
        }
    }

    //----------------------------------------------------------------------------------------
    // datapaths and auxiliary connections

    /// Records a connection's datapath identity, registering it with the engine: a main
    ///  connection (`auxiliary_id` 0) must be the only one for its datapath, and an auxiliary
    ///  connection is bound to its datapath's main connection
    pub fn post_datapath(&mut self, conn_id: ConnectionId, datapath_id: DatapathId, auxiliary_id: u8) -> anyhow::Result<()> {
        let conn = self.connections.get_mut(conn_id)
            .ok_or_else(|| anyhow!("connection {} does not exist", conn_id))?;

        if auxiliary_id == 0 && conn.transport.is_datagram() {
            bail!("a main connection can not use a datagram transport");
        }
        if auxiliary_id != 0 && !conn.settings.options.contains(ChannelOptions::AUXILIARY) {
            bail!("auxiliary connections are not enabled");
        }
        conn.datapath_id = datapath_id;
        conn.auxiliary_id = auxiliary_id;

        if auxiliary_id == 0 {
            if let Some(existing) = self.datapaths.get(&datapath_id) {
                if *existing != conn_id {
                    bail!("datapath {} already has main connection {}", datapath_id, existing);
                }
            }
            self.datapaths.insert(datapath_id, conn_id);
            info!(conn = %conn_id, dpid = %datapath_id, "registered datapath");
            return Ok(());
        }

        let main = *self.datapaths.get(&datapath_id)
            .ok_or_else(|| anyhow!("no main connection for datapath {}", datapath_id))?;
        self.set_main_connection(conn_id, main, auxiliary_id);
        Ok(())
    }

    /// Binds a connection as auxiliary connection `auxiliary_id` of `main`, shutting down and
    ///  replacing an existing auxiliary connection with the same id
    fn set_main_connection(&mut self, conn_id: ConnectionId, main: ConnectionId, auxiliary_id: u8) {
        let existing = self.connections.get(main)
            .and_then(|m| m.auxiliaries.get(&auxiliary_id))
            .cloned();
        if let Some(existing) = existing {
            if existing != conn_id {
                warn!(conn = %existing, "replacing auxiliary connection {} with {}", auxiliary_id, conn_id);
                self.shutdown_connection(existing);
                if let Some(old) = self.connections.get_mut(existing) {
                    old.main_connection = existing;
                }
            }
        }

        if let Some(m) = self.connections.get_mut(main) {
            m.auxiliaries.insert(auxiliary_id, conn_id);
        }
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.main_connection = main;
        }
        info!(conn = %conn_id, "bound as auxiliary connection {} of {}", auxiliary_id, main);
    }

    pub fn main_connection_for(&self, datapath_id: DatapathId) -> Option<ConnectionId> {
        self.datapaths.get(&datapath_id).cloned()
    }

    //----------------------------------------------------------------------------------------
    // closing connections

    /// Closes a connection on the application's behalf, i.e. without re-connecting. Returns
    ///  the number of connections this closes, including auxiliary connections.
    pub fn close(&mut self, conn_id: ConnectionId) -> usize {
        let count = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.reconnect = false;
                1 + conn.auxiliaries.len()
            }
            None => return 0,
        };
        self.shutdown_connection(conn_id);
        count
    }

    pub fn close_all(&mut self) -> usize {
        let ids = self.connections.ids();
        for &id in &ids {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.reconnect = false;
            }
            self.shutdown_connection(id);
        }
        ids.len()
    }

    /// Flushes pending output and shuts the transport down. The connection is removed once the
    ///  transport reports it is closed.
    pub fn shutdown_connection(&mut self, conn_id: ConnectionId) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };
        if conn.flags.contains(ConnectionFlags::SHUTDOWN_REQUESTED) {
            return;
        }
        conn.flags.insert(ConnectionFlags::SHUTDOWN_REQUESTED);
        conn.flush();

        debug!(conn = %conn_id, "shutting down");
        match conn.transport.shutdown() {
            ShutdownProgress::Pending => {}
            ShutdownProgress::Closed { shutdown_done } => {
                let _ = self.events.send(EngineEvent::Closed { conn: conn_id, shutdown_done, error: None });
            }
        }
    }

    fn connection_closed(&mut self, conn_id: ConnectionId, shutdown_done: bool, error: Option<String>) {
        match self.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.flags.remove(ConnectionFlags::CHANNEL_UP);
                if shutdown_done {
                    conn.flags.insert(ConnectionFlags::SHUTDOWN_DONE);
                }
            }
            None => {
                trace!(conn = %conn_id, "closed event for unknown connection");
                return;
            }
        }
        match &error {
            Some(error) => info!(conn = %conn_id, "connection closed: {}", error),
            None => info!(conn = %conn_id, "connection closed"),
        }

        if let Some(ListenerSlot::Application(mut listener)) = self.take_listener(conn_id) {
            listener.on_channel_down(&mut Channel::new(self, conn_id));
        }

        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };
        let auxiliaries = std::mem::take(&mut conn.auxiliaries);
        let is_main = conn.is_main();
        let main = conn.main_connection;
        let auxiliary_id = conn.auxiliary_id;
        let datapath_id = conn.datapath_id;
        let server = conn.server;
        let remote = conn.transport.remote_addr();
        let is_datagram = conn.transport.is_datagram();
        let reconnect = match (conn.reconnect, conn.settings.reconnect_delay, remote) {
            (true, Some(delay), Some(remote)) => Some((remote, delay, conn.settings.clone(), conn.current_xid())),
            _ => None,
        };

        if is_main {
            for (_, aux) in auxiliaries {
                if let Some(aux_conn) = self.connections.get_mut(aux) {
                    aux_conn.main_connection = aux;
                }
                self.shutdown_connection(aux);
            }
            if self.datapaths.get(&datapath_id) == Some(&conn_id) {
                self.datapaths.remove(&datapath_id);
                debug!(conn = %conn_id, dpid = %datapath_id, "released datapath");
            }
        }
        else if let Some(main_conn) = self.connections.get_mut(main) {
            if main_conn.auxiliaries.get(&auxiliary_id) == Some(&conn_id) {
                main_conn.auxiliaries.remove(&auxiliary_id);
            }
        }

        if let (Some(server_id), true) = (server, is_datagram) {
            let owned = match self.servers.get_mut(&server_id) {
                Some(server) => {
                    if let (Some(udp), Some(remote)) = (server.udp.as_mut(), remote) {
                        if udp.connections.get(&remote) == Some(&conn_id) {
                            udp.connections.remove(&remote);
                        }
                    }
                    server.owner == Some(conn_id)
                }
                None => false,
            };
            if owned {
                self.servers.remove(&server_id);
            }
        }

        self.connections.remove(conn_id);

        if let (Some((remote, delay, settings, starting_xid)), None) = (reconnect, self.stopping) {
            info!("re-connecting to {:?} in {:?}", remote, delay);
            self.timers.schedule(Instant::now() + delay, TimerEvent::Reconnect { remote, settings, starting_xid });
        }
        self.schedule_stop_if_idle();
    }

    //----------------------------------------------------------------------------------------
    // UDP

    fn datagram_received(&mut self, server_id: ServerId, from: SocketAddr, data: BytesMut) {
        let (known, accepts_new, security_id, sender, local, settings) = match self.servers.get(&server_id) {
            Some(Server { udp: Some(udp), settings, .. }) => (
                udp.connections.get(&from).cloned(),
                udp.accepts_new,
                settings.security_id,
                udp.sender.clone(),
                udp.local,
                settings.clone(),
            ),
            _ => return,
        };

        if let Some(conn_id) = known {
            self.connection_datagram(conn_id, data);
            return;
        }
        if !accepts_new || self.stopping.is_some() {
            debug!("dropping datagram from unknown endpoint {:?}", from);
            return;
        }

        let now = Instant::now();
        let security = match security_id {
            Some(security_id) => {
                if !is_handshake_start(&data) {
                    debug!("dropping datagram from {:?}: not the start of a DTLS handshake", from);
                    return;
                }
                let identity = match self.identities.get(&security_id) {
                    Some(identity) => identity.clone(),
                    None => return,
                };
                let ctx = HandshakeContext {
                    conn_id: ConnectionId(0),
                    security_id,
                    transport: SecureTransport::Dtls,
                    remote: from,
                    is_client: false,
                };
                (identity, ctx)
            }
            None => {
                let header = match Header::peek(&data) {
                    Some(header) if header.length as usize == data.len() => header,
                    _ => {
                        debug!("dropping malformed datagram from {:?}", from);
                        return;
                    }
                };
                match header.message_type() {
                    MessageType::EchoRequest => {
                        if let Ok(mut echo) = Message::new(data) {
                            trace!("answering echo request from {:?}", from);
                            echo.set_type(MessageType::EchoReply);
                            sender.send(from, echo.into_bytes().freeze());
                        }
                    }
                    MessageType::Hello => {
                        let id = self.new_connection_id();
                        let link = DatagramLink::plain(local, from, sender);
                        let conn = Connection::new(id, Transport::Datagram(link), settings, Some(server_id), false, 0, now);
                        if self.add_udp_connection(server_id, from, conn) {
                            self.channel_up(id);
                            self.post_message(id, data);
                        }
                    }
                    other => debug!("dropping {:?} from unknown endpoint {:?}", other, from),
                }
                return;
            }
        };

        let (identity, mut ctx) = security;
        let id = self.new_connection_id();
        ctx.conn_id = id;
        let link = match DatagramLink::secure(local, from, sender, identity, ctx, self.config.dtls_mtu) {
            Ok(link) => link,
            Err(e) => {
                warn!("failed to set up DTLS for {:?}: {}", from, e);
                return;
            }
        };
        let conn = Connection::new(id, Transport::Datagram(link), settings, Some(server_id), false, 0, now);
        if self.add_udp_connection(server_id, from, conn) {
            self.connection_datagram(id, data);
        }
    }

    fn add_udp_connection(&mut self, server_id: ServerId, remote: SocketAddr, conn: Connection) -> bool {
        let id = conn.id;
        if let Err(e) = self.add_connection(conn) {
            warn!("failed to add UDP connection from {:?}: {}", remote, e);
            return false;
        }
        if let Some(Server { udp: Some(udp), .. }) = self.servers.get_mut(&server_id) {
            udp.connections.insert(remote, id);
        }
        info!(conn = %id, server = %server_id, "new UDP connection from {:?}", remote);
        true
    }

    fn connection_datagram(&mut self, conn_id: ConnectionId, data: BytesMut) {
        let input = match self.connections.get_mut(conn_id).map(|c| &mut c.transport) {
            Some(Transport::Datagram(link)) => link.receive(data.freeze()),
            _ => return,
        };

        if input.event == Some(DatagramEvent::Secured) {
            self.channel_up(conn_id);
        }
        for message in input.messages {
            self.post_message(conn_id, BytesMut::from(&message[..]));
        }
        match input.event {
            Some(DatagramEvent::SecurityFailed) | Some(DatagramEvent::PeerClosed) => self.shutdown_connection(conn_id),
            _ => {}
        }
    }

    //----------------------------------------------------------------------------------------
    // timers

    /// Keep-alive and `on_tickle` for every connection
    pub fn poll_connections(&mut self, now: Instant) {
        let (guard, ids) = self.connections.iterate();
        for id in ids {
            let outcome = match self.connections.get_mut(id) {
                Some(conn) => conn.poll(now),
                None => continue,
            };
            if outcome == PollOutcome::TimedOut {
                warn!(conn = %id, "keep-alive timeout");
                self.alert(id, "keep-alive timeout", &[]);
                self.shutdown_connection(id);
                continue;
            }
            self.tickle(id);
        }
        drop(guard);
        self.connections.settle();
    }

    fn tickle(&mut self, conn_id: ConnectionId) {
        let is_application = matches!(self.connections.get(conn_id).map(|c| &c.listener), Some(ListenerSlot::Application(_)));
        if !is_application {
            return;
        }
        if let Some(ListenerSlot::Application(mut listener)) = self.take_listener(conn_id) {
            listener.on_tickle(&mut Channel::new(self, conn_id));
            self.restore_listener(conn_id, ListenerSlot::Application(listener));
        }
    }

    pub fn fire_timers(&mut self, now: Instant) {
        for event in self.timers.pop_due(now) {
            match event {
                TimerEvent::HandshakeDeadline { conn } => {
                    let in_handshake = matches!(self.connections.get(conn).map(|c| &c.listener), Some(ListenerSlot::Handshake(_)));
                    if !in_handshake {
                        continue;
                    }
                    if let Some(ListenerSlot::Handshake(mut handshake)) = self.take_listener(conn) {
                        let step = handshake.on_deadline(self, conn, now);
                        self.apply_handshake_step(conn, handshake, step);
                    }
                }
                TimerEvent::Reconnect { remote, settings, starting_xid } => {
                    if self.stopping.is_some() {
                        continue;
                    }
                    info!("re-connecting to {:?}", remote);
                    spawn_connect(ConnectRequest {
                        remote,
                        settings,
                        starting_xid: Some(starting_xid),
                        reply: None,
                    }, self.events.clone());
                }
                TimerEvent::StopGracePeriod => {
                    if self.stopping.is_some() && self.connections.is_empty() {
                        info!("grace period is over");
                        self.finished = true;
                    }
                }
            }
        }
    }

    //----------------------------------------------------------------------------------------
    // stopping

    /// Closes all servers. Once there are no more connections, the engine finishes after
    ///  `grace`.
    pub fn stop(&mut self, grace: Duration) {
        if self.stopping.is_some() {
            return;
        }
        info!("stopping engine, grace period {:?}", grace);

        let servers: Vec<ServerId> = self.servers.values()
            .filter(|s| s.owner.is_none())
            .map(|s| s.id)
            .collect();
        for server in servers {
            self.close_server(server);
        }

        self.stopping = Some(grace);
        self.schedule_stop_if_idle();
    }

    fn schedule_stop_if_idle(&mut self) {
        if let Some(grace) = self.stopping {
            if self.connections.is_empty() {
                self.timers.schedule(Instant::now() + grace, TimerEvent::StopGracePeriod);
            }
        }
    }

    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.connections.values()
            .map(|conn| ConnectionInfo {
                id: conn.id,
                transport: conn.transport.kind(),
                local: conn.transport.local_addr(),
                remote: conn.transport.remote_addr(),
                version: conn.version,
                datapath_id: conn.datapath_id,
                auxiliary_id: conn.auxiliary_id,
                main_connection: conn.main_connection,
                handshake_done: conn.flags.contains(ConnectionFlags::HANDSHAKE_DONE),
                outgoing: conn.is_outgoing(),
            })
            .collect()
    }
}
