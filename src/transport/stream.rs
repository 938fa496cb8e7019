use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_openssl::SslStream;
use tracing::{debug, info_span, trace, warn, Instrument};
use crate::engine::event::{ConnectRequest, EngineEvent, EventSender};
use crate::ids::{ConnectionId, ServerId};
use crate::protocol::header::Header;
use crate::protocol::message::FrameError;
use crate::security::identity::{Identity, SecureTransport};
use crate::security::security_check;
use crate::security::security_check::HandshakeContext;
use crate::transport::TransportKind;
use crate::util::safe_converter::SafeCast;

/// The engine's handle to a TCP connection's I/O task. Dropping the write queue tells the task
///  to flush what is queued and shut the stream down.
pub(crate) struct StreamLink {
    kind: TransportKind,
    local: SocketAddr,
    remote: SocketAddr,
    writes: Option<mpsc::UnboundedSender<Bytes>>,
}

impl StreamLink {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn send(&self, data: Bytes) {
        match &self.writes {
            Some(writes) => {
                if writes.send(data).is_err() {
                    debug!("stream to {:?} is closed, dropping outgoing data", self.remote);
                }
            }
            None => debug!("stream to {:?} is shutting down, dropping outgoing data", self.remote),
        }
    }

    pub fn shutdown(&mut self) {
        self.writes = None;
    }
}

pub(crate) struct StreamSecurity {
    pub identity: Arc<Identity>,
    pub ctx: HandshakeContext,
}

pub(crate) fn spawn_acceptor(server: ServerId, listener: TcpListener, events: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("accepted connection from {:?}", remote);
                    if events.send(EngineEvent::Accepted { server, stream, remote }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // e.g. running out of file descriptors - back off rather than spin
                    warn!("error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }.instrument(info_span!("acceptor", %server)))
}

pub(crate) fn spawn_connect(request: ConnectRequest, events: EventSender) {
    let remote = request.remote;
    tokio::spawn(async move {
        debug!("connecting");
        let result = TcpStream::connect(request.remote).await;
        let _ = events.send(EngineEvent::Connected { request, result });
    }.instrument(info_span!("connect", ?remote)));
}

/// Starts the I/O task for a TCP connection, with a TLS handshake first if `security` is given.
///  The task reports [EngineEvent::TransportReady] once OpenFlow traffic can flow, and always
///  ends with [EngineEvent::Closed].
pub(crate) fn spawn_stream(conn: ConnectionId, stream: TcpStream, security: Option<StreamSecurity>, events: EventSender) -> anyhow::Result<StreamLink> {
    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;
    stream.set_nodelay(true)?;

    let kind = if security.is_some() { TransportKind::Tls } else { TransportKind::Tcp };
    let (writes, writes_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_stream(conn, stream, security, writes_rx, events)
        .instrument(info_span!("connection", %conn, ?remote)));

    Ok(StreamLink {
        kind,
        local,
        remote,
        writes: Some(writes),
    })
}

async fn run_stream(conn: ConnectionId, stream: TcpStream, security: Option<StreamSecurity>, writes: mpsc::UnboundedReceiver<Bytes>, events: EventSender) {
    let result = match security {
        None => {
            let _ = events.send(EngineEvent::TransportReady { conn });
            serve(conn, stream, BytesMut::new(), writes, &events).await
        }
        Some(security) => run_tls(conn, stream, security, writes, &events).await,
    };

    let (shutdown_done, error) = match result {
        Ok(()) => (true, None),
        Err(e) => {
            debug!("connection ended with error: {}", e);
            (false, Some(e.to_string()))
        }
    };
    let _ = events.send(EngineEvent::Closed { conn, shutdown_done, error });
}

/// The TLS handshake is abandoned as soon as the engine drops the write queue, e.g. when the
///  OpenFlow handshake deadline expires while the peer is silent.
async fn run_tls(conn: ConnectionId, stream: TcpStream, security: StreamSecurity, mut writes: mpsc::UnboundedReceiver<Bytes>, events: &EventSender) -> anyhow::Result<()> {
    let StreamSecurity { identity, ctx } = security;

    let mut ssl = identity.new_ssl(SecureTransport::Tls, ctx.remote)?;
    security_check::before_handshake(&ctx, &identity, &mut ssl)?;

    let mut stream = Box::pin(SslStream::new(ssl, stream)?);
    let mut pending = BytesMut::new();
    let result = {
        let handshake = async {
            if ctx.is_client {
                stream.as_mut().connect().await
            }
            else {
                stream.as_mut().accept().await
            }
        };
        tokio::pin!(handshake);

        loop {
            select! {
                result = &mut handshake => break result,
                data = writes.recv() => match data {
                    Some(data) => pending.extend_from_slice(&data),
                    None => {
                        security_check::before_close(&ctx, false, false);
                        bail!("closed during TLS handshake");
                    }
                }
            }
        }
    };
    security_check::after_handshake(&ctx, &identity, stream.ssl(), result)?;

    let _ = events.send(EngineEvent::TransportReady { conn });
    let result = serve(conn, stream, pending, writes, events).await;
    security_check::before_close(&ctx, true, result.is_ok());
    result
}

/// Moves data until either side closes the connection. Returns `Ok` if the connection was shut
///  down properly, i.e. the peer closed it at a message boundary or we shut it down after
///  flushing everything that was queued. `queued` is written before anything from `writes`.
async fn serve<S: AsyncRead + AsyncWrite>(conn: ConnectionId, stream: S, queued: BytesMut, mut writes: mpsc::UnboundedReceiver<Bytes>, events: &EventSender) -> anyhow::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    select! {
        result = read_messages(conn, &mut reader, events) => {
            debug!("read side closed");
            result
        }
        result = write_messages(&mut writer, queued, &mut writes) => {
            result?;
            debug!("shutting down");
            writer.shutdown().await?;
            Ok(())
        }
    }
}

/// Reads length-delimited messages: the 8 byte header first, then the rest of the message as
///  given by the header's length field
async fn read_messages<R: AsyncRead + Unpin>(conn: ConnectionId, reader: &mut R, events: &EventSender) -> anyhow::Result<()> {
    let mut header = [0u8; Header::SERIALIZED_LEN];
    loop {
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let length: usize = u16::from_be_bytes([header[2], header[3]]).safe_cast();
        if length < Header::SERIALIZED_LEN {
            // there is no way to find the next message boundary
            let _ = events.send(EngineEvent::DecodeError { conn, error: FrameError::TooShort { length } });
            bail!("message too short: header length {}", length);
        }

        let mut buf = BytesMut::with_capacity(length);
        buf.extend_from_slice(&header);
        buf.resize(length, 0);
        reader.read_exact(&mut buf[Header::SERIALIZED_LEN..]).await?;

        trace!("received message of {} bytes", length);
        if events.send(EngineEvent::Received { conn, data: buf }).is_err() {
            return Ok(());
        }
    }
}

/// Writes queued data using two buffers: data arriving while a write is in progress is
///  collected in the inactive buffer, and the buffers are swapped when the write completes.
///  Returns when the queue is closed and everything is written.
async fn write_messages<W: AsyncWrite + Unpin>(writer: &mut W, queued: BytesMut, writes: &mut mpsc::UnboundedReceiver<Bytes>) -> anyhow::Result<()> {
    let mut active = BytesMut::new();
    let mut inactive = queued;
    let mut open = true;

    loop {
        if inactive.is_empty() {
            if !open {
                writer.flush().await?;
                return Ok(());
            }
            match writes.recv().await {
                Some(data) => inactive.extend_from_slice(&data),
                None => {
                    open = false;
                    continue;
                }
            }
        }

        std::mem::swap(&mut active, &mut inactive);
        trace!("writing {} bytes", active.len());
        {
            let write = write_and_flush(writer, &active);
            tokio::pin!(write);
            loop {
                select! {
                    result = &mut write => {
                        result?;
                        break;
                    }
                    data = writes.recv(), if open => match data {
                        Some(data) => inactive.extend_from_slice(&data),
                        None => open = false,
                    }
                }
            }
        }
        active.clear();
    }
}

async fn write_and_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
