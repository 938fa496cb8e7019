use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tokio::net::{TcpListener, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};
use crate::engine::channel::{AlertMonitor, LoggingAlertMonitor};
use crate::engine::config::{ChannelOptions, ChannelSettings, EngineConfig};
use crate::engine::engine_core::EngineCore;
use crate::engine::event::{ConnectRequest, EventReceiver};
use crate::engine::server::ServerInfo;
use crate::ids::{ConnectionId, SecurityId, ServerId};
use crate::protocol::datapath_id::DatapathId;
use crate::protocol::message::Message;
use crate::transport::memory::MemoryPeer;
use crate::transport::TransportKind;

/// A snapshot of a connection's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub version: u8,
    pub datapath_id: DatapathId,
    pub auxiliary_id: u8,
    pub main_connection: ConnectionId,
    pub handshake_done: bool,
    pub outgoing: bool,
}

enum Command {
    Listen {
        tcp: TcpListener,
        udp: Option<UdpSocket>,
        settings: ChannelSettings,
        reply: oneshot::Sender<anyhow::Result<ServerInfo>>,
    },
    Connect {
        request: ConnectRequest,
    },
    ConnectUdp {
        socket: UdpSocket,
        remote: SocketAddr,
        settings: ChannelSettings,
        reply: oneshot::Sender<anyhow::Result<ConnectionId>>,
    },
    AttachMemory {
        settings: ChannelSettings,
        datagram: bool,
        outgoing: bool,
        version: Option<u8>,
        reply: oneshot::Sender<anyhow::Result<MemoryPeer>>,
    },
    Close {
        conn: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
    CloseServer {
        server: ServerId,
        reply: oneshot::Sender<bool>,
    },
    CloseAll {
        reply: oneshot::Sender<usize>,
    },
    AddIdentity {
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        trusted_ca_pem: Vec<u8>,
        reply: oneshot::Sender<anyhow::Result<SecurityId>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Servers {
        reply: oneshot::Sender<Vec<ServerInfo>>,
    },
    Send {
        conn: ConnectionId,
        message: Message,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

/// The engine's event loop. All protocol logic runs inside [Engine::run], driven by commands
///  from [EngineHandle]s, events from I/O tasks and timers.
pub struct Engine {
    core: EngineCore,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Engine {
    /// Creates an engine and a handle to it. Without a monitor, alerts are logged.
    pub fn new(config: EngineConfig, monitor: Option<Arc<dyn AlertMonitor>>) -> anyhow::Result<(Engine, EngineHandle)> {
        config.validate()?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let monitor = monitor.unwrap_or_else(|| Arc::new(LoggingAlertMonitor));

        let engine = Engine {
            core: EngineCore::new(config, monitor, events_tx),
            events,
            commands,
        };
        Ok((engine, EngineHandle { commands: commands_tx }))
    }

    /// Runs until the engine is stopped and its grace period is over. If all handles are
    ///  dropped, the engine closes all connections and stops without a grace period.
    pub async fn run(mut self) {
        let mut idle = interval(self.core.config.idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        info!("engine started");
        while !self.core.is_finished() {
            let next_timer = self.core.timers.next_deadline();
            let timer_deadline = next_timer.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all engine handles were dropped");
                        commands_open = false;
                        self.core.close_all();
                        self.core.stop(Duration::ZERO);
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.core.on_event(event),
                    None => break,
                },
                _ = idle.tick() => self.core.poll_connections(Instant::now()),
                _ = sleep_until(timer_deadline), if next_timer.is_some() => self.core.fire_timers(Instant::now()),
            }
        }
        info!("engine stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Listen { tcp, udp, settings, reply } => {
                let _ = reply.send(self.core.listen(tcp, udp, settings));
            }
            Command::Connect { request } => self.core.connect(request),
            Command::ConnectUdp { socket, remote, settings, reply } => {
                let _ = reply.send(self.core.connect_udp(socket, remote, settings));
            }
            Command::AttachMemory { settings, datagram, outgoing, version, reply } => {
                let _ = reply.send(self.core.attach_memory(settings, datagram, outgoing, version));
            }
            Command::Close { conn, reply } => {
                let _ = reply.send(self.core.close(conn));
            }
            Command::CloseServer { server, reply } => {
                let _ = reply.send(self.core.close_server(server));
            }
            Command::CloseAll { reply } => {
                let _ = reply.send(self.core.close_all());
            }
            Command::AddIdentity { cert_chain_pem, private_key_pem, trusted_ca_pem, reply } => {
                let _ = reply.send(self.core.add_identity(&cert_chain_pem, &private_key_pem, &trusted_ca_pem));
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.core.connection_infos());
            }
            Command::Servers { reply } => {
                let _ = reply.send(self.core.servers());
            }
            Command::Send { conn, message, reply } => {
                let _ = reply.send(self.core.send(conn, &message));
            }
            Command::Stop { grace, reply } => {
                self.core.stop(grace);
                let _ = reply.send(());
            }
        }
    }
}

/// Cloneable handle for controlling an [Engine] from any task
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (reply, result) = oneshot::channel();
        self.commands.send(command(reply))
            .map_err(|_| anyhow!("engine is stopped"))?;
        result.await
            .map_err(|_| anyhow!("engine is stopped"))
    }

    /// Listens for TCP connections on `endpoint` - and with [ChannelOptions::LISTEN_UDP] for UDP
    ///  on the same address
    pub async fn listen(&self, endpoint: SocketAddr, settings: ChannelSettings) -> anyhow::Result<ServerInfo> {
        settings.validate()?;
        let tcp = TcpListener::bind(endpoint).await?;
        let udp = if settings.options.contains(ChannelOptions::LISTEN_UDP) {
            Some(UdpSocket::bind(tcp.local_addr()?).await?)
        }
        else {
            None
        };
        self.request(|reply| Command::Listen { tcp, udp, settings, reply }).await?
    }

    /// Connects to `endpoint`, returning when the TCP connection is established (before the
    ///  OpenFlow handshake). With [ChannelOptions::CONNECT_UDP], this is [EngineHandle::connect_udp].
    pub async fn connect(&self, endpoint: SocketAddr, settings: ChannelSettings) -> anyhow::Result<ConnectionId> {
        if settings.options.contains(ChannelOptions::CONNECT_UDP) {
            return self.connect_udp(endpoint, settings).await;
        }
        self.request(|reply| Command::Connect {
            request: ConnectRequest {
                remote: endpoint,
                settings,
                starting_xid: None,
                reply: Some(reply),
            },
        }).await?
    }

    pub async fn connect_udp(&self, endpoint: SocketAddr, settings: ChannelSettings) -> anyhow::Result<ConnectionId> {
        settings.validate()?;
        let local: SocketAddr = if endpoint.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        }
        else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        self.request(|reply| Command::ConnectUdp { socket, remote: endpoint, settings, reply }).await?
    }

    /// Adds a connection over an in-memory link, returning the link's remote end. With
    ///  `datagram`, the link behaves like a datagram transport. `outgoing` makes the engine
    ///  side the connecting side.
    pub async fn attach_memory(&self, settings: ChannelSettings, datagram: bool, outgoing: bool) -> anyhow::Result<MemoryPeer> {
        self.request(|reply| Command::AttachMemory { settings, datagram, outgoing, version: None, reply }).await?
    }

    /// Like [EngineHandle::attach_memory], but without a handshake: the connection uses `version`
    ///  right away
    pub async fn attach_memory_negotiated(&self, settings: ChannelSettings, version: u8) -> anyhow::Result<MemoryPeer> {
        self.request(|reply| Command::AttachMemory { settings, datagram: false, outgoing: false, version: Some(version), reply }).await?
    }

    /// Returns the number of connections this closes, i.e. including auxiliary connections
    pub async fn close(&self, conn: ConnectionId) -> anyhow::Result<usize> {
        self.request(|reply| Command::Close { conn, reply }).await
    }

    pub async fn close_server(&self, server: ServerId) -> anyhow::Result<bool> {
        self.request(|reply| Command::CloseServer { server, reply }).await
    }

    pub async fn close_all(&self) -> anyhow::Result<usize> {
        self.request(|reply| Command::CloseAll { reply }).await
    }

    /// Registers certificate chain, private key and trusted CAs (all PEM) for TLS and DTLS
    pub async fn add_identity(&self, cert_chain_pem: &[u8], private_key_pem: &[u8], trusted_ca_pem: &[u8]) -> anyhow::Result<SecurityId> {
        let cert_chain_pem = cert_chain_pem.to_vec();
        let private_key_pem = private_key_pem.to_vec();
        let trusted_ca_pem = trusted_ca_pem.to_vec();
        self.request(|reply| Command::AddIdentity { cert_chain_pem, private_key_pem, trusted_ca_pem, reply }).await?
    }

    pub async fn connections(&self) -> anyhow::Result<Vec<ConnectionInfo>> {
        self.request(|reply| Command::Connections { reply }).await
    }

    pub async fn servers(&self) -> anyhow::Result<Vec<ServerInfo>> {
        self.request(|reply| Command::Servers { reply }).await
    }

    /// Sends a message on a connection, returning `false` if there is no such connection
    pub async fn send(&self, conn: ConnectionId, message: Message) -> anyhow::Result<bool> {
        self.request(|reply| Command::Send { conn, message, reply }).await
    }

    /// Closes all servers; the engine finishes `grace` after the last connection is gone
    pub async fn stop(&self, grace: Duration) -> anyhow::Result<()> {
        self.request(|reply| Command::Stop { grace, reply }).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};
    use crate::engine::channel::{Channel, ChannelListener, ListenerFactory};
    use crate::protocol::header::{MessageType, OFP_VERSION_4};
    use crate::protocol::messages::{FeaturesReply, MultipartReply, OFPMP_PORT_DESC};
    use crate::protocol::versions::ProtocolVersions;
    use crate::test_util::listener::{tracking_factory, ListenerEvent, ListenerTracker};
    use crate::test_util::security::TestPki;

    const DPID: u64 = 0x0000_0000_0000_abcd;

    /// Answers a controller's handshake requests the way a switch does
    struct SwitchListener {
        auxiliary_id: u8,
    }

    impl ChannelListener for SwitchListener {
        fn on_channel_up(&mut self, _channel: &mut Channel<'_>) {}

        fn on_message(&mut self, channel: &mut Channel<'_>, message: &Message) {
            match message.message_type() {
                MessageType::FeaturesRequest => {
                    let reply = FeaturesReply {
                        version: message.version(),
                        datapath_id: DatapathId::from_u64(DPID),
                        n_buffers: 0,
                        n_tables: 1,
                        auxiliary_id: self.auxiliary_id,
                        capabilities: 0,
                        reserved: 0,
                    };
                    channel.send(&reply.build(message.xid(), &[]));
                }
                MessageType::MultipartRequest => {
                    channel.send(&MultipartReply::build(message.version(), message.xid(), OFPMP_PORT_DESC, 0, &[0u8; 64]));
                }
                _ => {}
            }
        }
    }

    fn switch_settings(options: ChannelOptions, auxiliary_id: u8) -> ChannelSettings {
        let factory: ListenerFactory = Arc::new(move || Box::new(SwitchListener { auxiliary_id }));
        ChannelSettings::new(options, ProtocolVersions::from_version(OFP_VERSION_4), Some(factory))
    }

    fn start_engine() -> (EngineHandle, JoinHandle<()>) {
        let (engine, handle) = Engine::new(EngineConfig::new(), None).unwrap();
        (handle, tokio::spawn(engine.run()))
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn wait_for_events(tracker: &ListenerTracker, num_events: usize) -> Vec<ListenerEvent> {
        timeout(Duration::from_secs(5), async {
            while tracker.events().len() < num_events {
                sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("listener events did not arrive in time");
        tracker.take()
    }

    async fn wait_for_connections(handle: &EngineHandle, condition: impl Fn(&[ConnectionInfo]) -> bool) -> Vec<ConnectionInfo> {
        timeout(Duration::from_secs(5), async {
            loop {
                let connections = handle.connections().await.unwrap();
                if condition(&connections) {
                    return connections;
                }
                sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("connections did not reach the expected state in time")
    }

    async fn agent_pair(server_settings: ChannelSettings, client_settings: ChannelSettings) -> ((EngineHandle, JoinHandle<()>), (EngineHandle, JoinHandle<()>)) {
        let server = start_engine();
        let client = start_engine();
        let info = server.0.listen(localhost(), server_settings).await.unwrap();
        client.0.connect(info.tcp_addr.unwrap(), client_settings).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_tcp_agents() {
        let (server_factory, server_tracker) = tracking_factory();
        let (client_factory, client_tracker) = tracking_factory();
        let ((server, _), (client, _)) = agent_pair(
            ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, Some(server_factory)),
            ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::from_versions(&[1, 4]), Some(client_factory)),
        ).await;

        let server_events = wait_for_events(&server_tracker, 1).await;
        let client_events = wait_for_events(&client_tracker, 1).await;
        let server_conn = match server_events[0] {
            ListenerEvent::Up { conn, version, .. } => {
                assert_eq!(version, OFP_VERSION_4);
                conn
            }
            ref other => panic!("unexpected event {:?}", other),
        };
        let client_conn = match client_events[0] {
            ListenerEvent::Up { conn, .. } => conn,
            ref other => panic!("unexpected event {:?}", other),
        };

        let infos = client.connections().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].transport, TransportKind::Tcp);
        assert!(infos[0].outgoing);
        assert!(infos[0].handshake_done);

        // the server's listener answers barriers
        let barrier = Message::build(OFP_VERSION_4, MessageType::BarrierRequest, 1234, &[]);
        assert!(client.send(client_conn, barrier).await.unwrap());
        let events = wait_for_events(&client_tracker, 1).await;
        assert_eq!(events, vec![ListenerEvent::Message { conn: client_conn, message_type: MessageType::BarrierReply, xid: 1234 }]);
        let events = wait_for_events(&server_tracker, 1).await;
        assert_eq!(events, vec![ListenerEvent::Message { conn: server_conn, message_type: MessageType::BarrierRequest, xid: 1234 }]);

        assert_eq!(server.close(server_conn).await.unwrap(), 1);
        assert_eq!(wait_for_events(&server_tracker, 1).await, vec![ListenerEvent::Down { conn: server_conn }]);
        assert_eq!(wait_for_events(&client_tracker, 1).await, vec![ListenerEvent::Down { conn: client_conn }]);
    }

    #[tokio::test]
    async fn test_tls_agents() {
        let pki = TestPki::new();
        let (server, server_task) = start_engine();
        let (client, _client_task) = start_engine();

        let (cert, key) = pki.issue("controller");
        let server_security = server.add_identity(&cert, &key, &pki.ca_pem()).await.unwrap();
        let (cert, key) = pki.issue("switch");
        let client_security = client.add_identity(&cert, &key, &pki.ca_pem()).await.unwrap();

        let (server_factory, server_tracker) = tracking_factory();
        let (client_factory, client_tracker) = tracking_factory();
        let info = server.listen(localhost(), ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, Some(server_factory))
            .with_security(server_security)).await.unwrap();
        client.connect(info.tcp_addr.unwrap(), ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, Some(client_factory))
            .with_security(client_security)).await.unwrap();

        assert!(matches!(wait_for_events(&server_tracker, 1).await[0], ListenerEvent::Up { .. }));
        assert!(matches!(wait_for_events(&client_tracker, 1).await[0], ListenerEvent::Up { .. }));
        let infos = server.connections().await.unwrap();
        assert_eq!(infos[0].transport, TransportKind::Tls);

        server.stop(Duration::ZERO).await.unwrap();
        server.close_all().await.unwrap();
        timeout(Duration::from_secs(5), server_task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tls_with_untrusted_peer() {
        let pki = TestPki::new();
        let other_pki = TestPki::new();
        let (server, _server_task) = start_engine();
        let (client, _client_task) = start_engine();

        let (cert, key) = pki.issue("controller");
        let server_security = server.add_identity(&cert, &key, &pki.ca_pem()).await.unwrap();
        let (cert, key) = other_pki.issue("switch");
        let client_security = client.add_identity(&cert, &key, &other_pki.ca_pem()).await.unwrap();

        let (server_factory, server_tracker) = tracking_factory();
        let info = server.listen(localhost(), ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, Some(server_factory))
            .with_security(server_security)).await.unwrap();
        client.connect(info.tcp_addr.unwrap(), ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, None)
            .with_security(client_security)).await.unwrap();

        wait_for_connections(&client, |c| c.is_empty()).await;
        wait_for_connections(&server, |c| c.is_empty()).await;
        server_tracker.assert_no_events();
    }

    #[tokio::test]
    async fn test_tls_peer_without_client_hello() {
        let pki = TestPki::new();
        let mut config = EngineConfig::new();
        config.handshake_timeout = Duration::from_millis(300);
        let (engine, server) = Engine::new(config, None).unwrap();
        let server_task = tokio::spawn(engine.run());

        let (cert, key) = pki.issue("controller");
        let security = server.add_identity(&cert, &key, &pki.ca_pem()).await.unwrap();
        let info = server.listen(localhost(), ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, None)
            .with_security(security)).await.unwrap();

        // the handshake deadline closes a connection whose peer never starts TLS
        let mut silent = TcpStream::connect(info.tcp_addr.unwrap()).await.unwrap();
        wait_for_connections(&server, |c| c.len() == 1).await;
        wait_for_connections(&server, |c| c.is_empty()).await;
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), silent.read(&mut buf)).await.unwrap();
        assert_eq!(read.unwrap_or(0), 0);

        // so does closing it explicitly, and the engine can stop afterwards
        let _silent = TcpStream::connect(info.tcp_addr.unwrap()).await.unwrap();
        wait_for_connections(&server, |c| c.len() == 1).await;
        assert_eq!(server.close_all().await.unwrap(), 1);
        wait_for_connections(&server, |c| c.is_empty()).await;

        server.stop(Duration::ZERO).await.unwrap();
        timeout(Duration::from_secs(5), server_task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_controller_with_udp_auxiliary() {
        let (controller, _controller_task) = start_engine();
        let (switch, _switch_task) = start_engine();

        let (factory, tracker) = tracking_factory();
        let options = ChannelOptions::FEATURES_REQ | ChannelOptions::AUXILIARY | ChannelOptions::LISTEN_UDP;
        let info = controller.listen(localhost(), ChannelSettings::new(options, ProtocolVersions::ALL, Some(factory))).await.unwrap();
        assert_eq!(info.tcp_addr, info.udp_addr);

        switch.connect(info.tcp_addr.unwrap(), switch_settings(ChannelOptions::DEFAULT_AGENT, 0)).await.unwrap();
        let events = wait_for_events(&tracker, 2).await;
        let main = match events[0] {
            ListenerEvent::Up { conn, version, datapath_id } => {
                assert_eq!(version, OFP_VERSION_4);
                assert_eq!(datapath_id, DatapathId::from_u64(DPID));
                conn
            }
            ref other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(events[1], ListenerEvent::Message { conn: main, message_type: MessageType::FeaturesReply, xid: 2 });

        switch.connect(info.udp_addr.unwrap(), switch_settings(ChannelOptions::CONNECT_UDP, 1)).await.unwrap();
        let connections = wait_for_connections(&controller, |c| c.iter().any(|c| c.transport == TransportKind::Udp && c.handshake_done)).await;
        let aux = connections.iter()
            .find(|c| c.transport == TransportKind::Udp)
            .unwrap();
        assert_eq!(aux.auxiliary_id, 1);
        assert_eq!(aux.main_connection, main);
        assert_eq!(aux.datapath_id, DatapathId::from_u64(DPID));
        tracker.assert_no_events();

        // closing the main connection takes the auxiliary connection with it
        assert_eq!(controller.close(main).await.unwrap(), 2);
        wait_for_connections(&controller, |c| c.is_empty()).await;
        assert_eq!(wait_for_events(&tracker, 1).await, vec![ListenerEvent::Down { conn: main }]);
    }

    #[tokio::test]
    async fn test_udp_echo_from_unknown_endpoint() {
        let (controller, _task) = start_engine();
        let options = ChannelOptions::FEATURES_REQ | ChannelOptions::AUXILIARY | ChannelOptions::LISTEN_UDP;
        let info = controller.listen(localhost(), ChannelSettings::new(options, ProtocolVersions::ALL, None)).await.unwrap();

        let socket = UdpSocket::bind(localhost()).await.unwrap();
        let request = Message::build(OFP_VERSION_4, MessageType::EchoRequest, 42, b"abc");
        socket.send_to(request.data(), info.udp_addr.unwrap()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await.unwrap().unwrap();
        let reply = Message::new(BytesMut::from(&buf[..len])).unwrap();
        assert_eq!(reply.message_type(), MessageType::EchoReply);
        assert_eq!(reply.xid(), 42);
        assert_eq!(reply.body(), b"abc");

        assert!(controller.connections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_controller_with_dtls_auxiliary() {
        let pki = TestPki::new();
        let (controller, _controller_task) = start_engine();
        let (switch, _switch_task) = start_engine();

        let (cert, key) = pki.issue("controller");
        let controller_security = controller.add_identity(&cert, &key, &pki.ca_pem()).await.unwrap();
        let (cert, key) = pki.issue("switch");
        let switch_security = switch.add_identity(&cert, &key, &pki.ca_pem()).await.unwrap();

        let (factory, tracker) = tracking_factory();
        let options = ChannelOptions::FEATURES_REQ | ChannelOptions::AUXILIARY | ChannelOptions::LISTEN_UDP;
        let info = controller.listen(localhost(), ChannelSettings::new(options, ProtocolVersions::ALL, Some(factory))
            .with_security(controller_security)).await.unwrap();

        switch.connect(info.tcp_addr.unwrap(), switch_settings(ChannelOptions::DEFAULT_AGENT, 0).with_security(switch_security)).await.unwrap();
        let main = match wait_for_events(&tracker, 2).await[0] {
            ListenerEvent::Up { conn, .. } => conn,
            ref other => panic!("unexpected event {:?}", other),
        };

        switch.connect(info.udp_addr.unwrap(), switch_settings(ChannelOptions::CONNECT_UDP, 1).with_security(switch_security)).await.unwrap();
        let connections = wait_for_connections(&controller, |c| c.iter().any(|c| c.transport == TransportKind::Dtls && c.handshake_done)).await;
        let aux = connections.iter()
            .find(|c| c.transport == TransportKind::Dtls)
            .unwrap();
        assert_eq!(aux.auxiliary_id, 1);
        assert_eq!(aux.main_connection, main);
        assert_eq!(connections.iter().find(|c| c.id == main).unwrap().transport, TransportKind::Tls);

        assert_eq!(controller.close(main).await.unwrap(), 2);
        wait_for_connections(&controller, |c| c.is_empty()).await;
    }

    #[tokio::test]
    async fn test_reconnect() {
        let (server_factory, server_tracker) = tracking_factory();
        let (client_factory, client_tracker) = tracking_factory();
        let ((server, _), (client, _)) = agent_pair(
            ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, Some(server_factory)),
            ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, Some(client_factory))
                .with_reconnect(Duration::from_millis(50)),
        ).await;

        let first = match wait_for_events(&server_tracker, 1).await[0] {
            ListenerEvent::Up { conn, .. } => conn,
            ref other => panic!("unexpected event {:?}", other),
        };
        wait_for_events(&client_tracker, 1).await;

        server.close(first).await.unwrap();
        let events = wait_for_events(&server_tracker, 2).await;
        assert_eq!(events[0], ListenerEvent::Down { conn: first });
        assert!(matches!(events[1], ListenerEvent::Up { conn, .. } if conn != first));

        // an application close ends re-connecting
        let client_conn = client.connections().await.unwrap()[0].id;
        client.close(client_conn).await.unwrap();
        wait_for_connections(&client, |c| c.is_empty()).await;
        sleep(Duration::from_millis(200)).await;
        assert!(client.connections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listen_with_invalid_settings() {
        let (handle, _task) = start_engine();
        let settings = ChannelSettings::new(ChannelOptions::AUXILIARY, ProtocolVersions::ALL, None);
        assert!(handle.listen(localhost(), settings).await.is_err());

        let settings = ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, None)
            .with_security(SecurityId(42));
        assert!(handle.listen(localhost(), settings).await.is_err());
        assert!(handle.servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_server() {
        let (handle, _task) = start_engine();
        let info = handle.listen(localhost(), ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, None)).await.unwrap();
        assert_eq!(handle.servers().await.unwrap(), vec![info]);

        assert!(handle.close_server(info.id).await.unwrap());
        assert!(!handle.close_server(info.id).await.unwrap());
        assert!(handle.servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_stops_when_handles_are_dropped() {
        let (handle, task) = start_engine();
        let peer = handle.attach_memory(ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, None), false, false).await.unwrap();
        drop(handle);

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_negotiated_memory_connection() {
        let (handle, _task) = start_engine();
        let (factory, tracker) = tracking_factory();
        let settings = ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, Some(factory));
        let mut peer = handle.attach_memory_negotiated(settings, OFP_VERSION_4).await.unwrap();
        let conn = peer.connection_id();

        peer.send(&Message::build(OFP_VERSION_4, MessageType::BarrierRequest, 17, &[]));
        assert_eq!(wait_for_events(&tracker, 2).await, vec![
            ListenerEvent::Up { conn, version: OFP_VERSION_4, datapath_id: DatapathId::EMPTY },
            ListenerEvent::Message { conn, message_type: MessageType::BarrierRequest, xid: 17 },
        ]);

        let reply = timeout(Duration::from_secs(5), peer.recv()).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::BarrierReply);
        assert_eq!(reply.xid(), 17);

        assert!(handle.send(conn, Message::build(OFP_VERSION_4, MessageType::EchoRequest, 18, b"ping")).await.unwrap());
        let echo = timeout(Duration::from_secs(5), peer.recv()).await.unwrap().unwrap();
        assert_eq!((echo.message_type(), echo.xid()), (MessageType::EchoRequest, 18));
        assert!(!handle.send(ConnectionId(99), Message::build(OFP_VERSION_4, MessageType::EchoRequest, 19, &[])).await.unwrap());

        assert_eq!(handle.close(conn).await.unwrap(), 1);
        assert_eq!(wait_for_events(&tracker, 1).await, vec![ListenerEvent::Down { conn }]);
    }

    #[tokio::test]
    async fn test_stopped_engine_rejects_requests() {
        let (handle, task) = start_engine();
        handle.stop(Duration::from_millis(10)).await.unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert!(handle.connections().await.is_err());
    }
}
