use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, trace, warn, Instrument};
use crate::engine::event::{EngineEvent, EventSender};
use crate::ids::ServerId;
use crate::security::dtls_adapter::{DtlsAdapter, DtlsEvent, DtlsOutput};
use crate::security::identity::{Identity, SecureTransport};
use crate::security::security_check;
use crate::security::security_check::HandshakeContext;
use crate::transport::{split_messages, TransportKind};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}

/// Queues datagrams for a UDP socket's send task, so the engine never waits for the socket
#[derive(Clone)]
pub(crate) struct DatagramSender {
    tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

impl DatagramSender {
    pub fn spawn(socket: Arc<dyn SendSocket>) -> (DatagramSender, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(send_loop(socket, rx));
        (DatagramSender { tx }, handle)
    }

    pub fn send(&self, to: SocketAddr, datagram: Bytes) {
        if self.tx.send((to, datagram)).is_err() {
            debug!("UDP socket is closed, dropping datagram to {:?}", to);
        }
    }
}

async fn send_loop(socket: Arc<dyn SendSocket>, mut rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
    while let Some((to, datagram)) = rx.recv().await {
        socket.do_send_datagram(to, &datagram).await;
    }
}

pub(crate) fn spawn_receiver(server: ServerId, socket: Arc<UdpSocket>, max_datagram_size: usize, events: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut buf = BytesMut::zeroed(max_datagram_size);
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    buf.truncate(len);
                    trace!("received datagram of {} bytes from {:?}", len, from);
                    if events.send(EngineEvent::Datagram { server, from, data: buf }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP errors for earlier sends show up here on some platforms
                    debug!("error receiving UDP datagram: {}", e);
                }
            }
        }
    }.instrument(info_span!("udp", %server)))
}

struct DtlsSession {
    adapter: DtlsAdapter,
    identity: Arc<Identity>,
    ctx: HandshakeContext,
}

/// What happened to the DTLS session as a result of a received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatagramEvent {
    Secured,
    SecurityFailed,
    PeerClosed,
}

#[derive(Debug, Default)]
pub(crate) struct DatagramInput {
    /// one OpenFlow message per datagram
    pub messages: Vec<Bytes>,
    pub event: Option<DatagramEvent>,
}

/// A 'connection' with a single remote endpoint on a shared UDP socket, optionally secured by
///  DTLS
pub(crate) struct DatagramLink {
    local: SocketAddr,
    remote: SocketAddr,
    sender: DatagramSender,
    dtls: Option<Box<DtlsSession>>,
}

impl DatagramLink {
    pub fn plain(local: SocketAddr, remote: SocketAddr, sender: DatagramSender) -> DatagramLink {
        DatagramLink {
            local,
            remote,
            sender,
            dtls: None,
        }
    }

    pub fn secure(local: SocketAddr, remote: SocketAddr, sender: DatagramSender, identity: Arc<Identity>, ctx: HandshakeContext, mtu: u32) -> anyhow::Result<DatagramLink> {
        let mut ssl = identity.new_ssl(SecureTransport::Dtls, remote)?;
        security_check::before_handshake(&ctx, &identity, &mut ssl)?;
        let adapter = DtlsAdapter::new(ssl, ctx.is_client, mtu)?;

        Ok(DatagramLink {
            local,
            remote,
            sender,
            dtls: Some(Box::new(DtlsSession { adapter, identity, ctx })),
        })
    }

    pub fn kind(&self) -> TransportKind {
        if self.dtls.is_some() { TransportKind::Dtls } else { TransportKind::Udp }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// `true` if OpenFlow traffic can flow, i.e. there is no DTLS or its handshake is done
    pub fn is_ready(&self) -> bool {
        match &self.dtls {
            None => true,
            Some(session) => session.adapter.is_handshake_done(),
        }
    }

    /// Starts the DTLS handshake for client side links
    pub fn start(&mut self) {
        let output = match &mut self.dtls {
            Some(session) if session.adapter.is_client() => session.adapter.connect(),
            _ => return,
        };
        self.transmit(output.to_send);
    }

    pub fn send(&mut self, data: Bytes) {
        for message in split_messages(data) {
            match &mut self.dtls {
                None => self.sender.send(self.remote, message),
                Some(session) => {
                    let DtlsOutput { to_send, .. } = session.adapter.send_datagram(message);
                    self.transmit(to_send);
                }
            }
        }
    }

    pub fn receive(&mut self, datagram: Bytes) -> DatagramInput {
        let session = match &mut self.dtls {
            None => return DatagramInput { messages: vec![datagram], event: None },
            Some(session) => session,
        };

        let output = session.adapter.datagram_received(&datagram);
        let event = match output.event {
            None => None,
            Some(DtlsEvent::HandshakeCompleted) => {
                match security_check::after_handshake(&session.ctx, &session.identity, session.adapter.ssl(), Ok::<(), &str>(())) {
                    Ok(()) => Some(DatagramEvent::Secured),
                    Err(e) => {
                        warn!("rejecting DTLS session: {}", e);
                        Some(DatagramEvent::SecurityFailed)
                    }
                }
            }
            Some(DtlsEvent::HandshakeFailed(msg)) => {
                let _ = security_check::after_handshake(&session.ctx, &session.identity, session.adapter.ssl(), Err(msg));
                Some(DatagramEvent::SecurityFailed)
            }
            Some(DtlsEvent::Closed) => Some(DatagramEvent::PeerClosed),
        };

        self.transmit(output.to_send);
        DatagramInput {
            messages: output.received,
            event,
        }
    }

    /// Sends a DTLS close_notify if there is a session. Returns `true` if the shutdown is
    ///  complete.
    pub fn shutdown(&mut self) -> bool {
        let (to_send, shutdown_done) = match &mut self.dtls {
            None => return true,
            Some(session) => {
                let (to_send, shutdown_done) = session.adapter.shutdown();
                security_check::before_close(&session.ctx, session.adapter.is_handshake_done(), shutdown_done);
                (to_send, shutdown_done)
            }
        };
        self.transmit(to_send);
        shutdown_done
    }

    fn transmit(&self, datagrams: Vec<Bytes>) {
        for datagram in datagrams {
            self.sender.send(self.remote, datagram);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::{eq, function};
    use crate::protocol::header::MessageType;
    use crate::protocol::message::Message;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_plain_send_splits_messages() {
        let hello = Message::build(4, MessageType::Hello, 1, &[]);
        let echo = Message::build(4, MessageType::EchoRequest, 2, b"xyz");
        let hello_data = hello.data().to_vec();
        let echo_data = echo.data().to_vec();

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_datagram()
            .with(eq(addr(6653)), function(move |d: &[u8]| d == hello_data.as_slice()))
            .times(1)
            .return_const(());
        socket.expect_do_send_datagram()
            .with(eq(addr(6653)), function(move |d: &[u8]| d == echo_data.as_slice()))
            .times(1)
            .return_const(());

        let (sender, handle) = DatagramSender::spawn(Arc::new(socket));
        let mut link = DatagramLink::plain(addr(1234), addr(6653), sender);
        assert_eq!(link.kind(), TransportKind::Udp);
        assert!(link.is_ready());

        let mut data = hello.data().to_vec();
        data.extend_from_slice(echo.data());
        link.send(Bytes::from(data));
        drop(link);

        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_plain_receive() {
        let socket = MockSendSocket::new();
        let (sender, _handle) = DatagramSender::spawn(Arc::new(socket));
        let mut link = DatagramLink::plain(addr(1234), addr(6653), sender);

        let hello = Message::build(4, MessageType::Hello, 1, &[]);
        let input = link.receive(Bytes::copy_from_slice(hello.data()));
        assert_eq!(input.messages, vec![Bytes::copy_from_slice(hello.data())]);
        assert_eq!(input.event, None);
        assert!(link.shutdown());
    }
}
