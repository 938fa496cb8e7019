use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use bytes::Bytes;
use openssl::ssl::{ErrorCode, ShutdownState, Ssl, SslRef, SslStream};
use tracing::{debug, trace, warn};
use crate::security::dtls_record::{describe_record, records};

const MAX_DATAGRAM_SIZE: usize = 65535;

/// In-memory datagram 'socket' underneath the DTLS state machine: every read returns one
///  received datagram, and every write produces one datagram to send.
#[derive(Default)]
struct DatagramChannel {
    inbound: VecDeque<Bytes>,
    outbound: Vec<Bytes>,
}

impl Read for DatagramChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for DatagramChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.push(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtlsEvent {
    HandshakeCompleted,
    HandshakeFailed(String),
    /// The peer sent a close_notify alert
    Closed,
}

/// Everything that resulted from feeding data into a [DtlsAdapter]
#[derive(Debug, Default)]
pub struct DtlsOutput {
    /// encrypted datagrams to send to the peer
    pub to_send: Vec<Bytes>,
    /// decrypted datagrams from the peer
    pub received: Vec<Bytes>,
    pub event: Option<DtlsEvent>,
}

/// Bridges datagrams to an OpenSSL DTLS session. The adapter does no I/O itself: encrypted
///  datagrams received from the peer are passed in, and the resulting encrypted datagrams to
///  send and decrypted plaintext datagrams are returned.
///
/// Plaintext datagrams sent before the handshake completes are queued and sent once it does.
pub struct DtlsAdapter {
    stream: SslStream<DatagramChannel>,
    is_client: bool,
    handshake_done: bool,
    failed: bool,
    pending: VecDeque<Bytes>,
}

impl DtlsAdapter {
    /// `ssl` must be created from a DTLS context. `mtu` limits the size of the datagrams the
    ///  adapter produces.
    pub fn new(mut ssl: Ssl, is_client: bool, mtu: u32) -> anyhow::Result<DtlsAdapter> {
        ssl.set_mtu(mtu)?;
        if is_client {
            ssl.set_connect_state();
        }
        else {
            ssl.set_accept_state();
        }

        Ok(DtlsAdapter {
            stream: SslStream::new(ssl, DatagramChannel::default())?,
            is_client,
            handshake_done: false,
            failed: false,
            pending: VecDeque::new(),
        })
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    pub fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// Starts the handshake on the client side, producing the ClientHello
    pub fn connect(&mut self) -> DtlsOutput {
        let mut output = DtlsOutput::default();
        self.drive_handshake(&mut output);
        self.collect_outbound(&mut output);
        output
    }

    pub fn datagram_received(&mut self, datagram: &[u8]) -> DtlsOutput {
        let mut output = DtlsOutput::default();
        if self.failed {
            return output;
        }

        for record in records(datagram) {
            trace!("DTLS received: {}", describe_record(record));
        }
        self.stream.get_mut().inbound.push_back(Bytes::copy_from_slice(datagram));

        if !self.handshake_done {
            self.drive_handshake(&mut output);
        }
        if self.handshake_done {
            self.read_plaintext(&mut output);
            self.send_pending();
        }

        self.collect_outbound(&mut output);
        output
    }

    /// Encrypts a plaintext datagram, or queues it until the handshake is done
    pub fn send_datagram(&mut self, datagram: Bytes) -> DtlsOutput {
        let mut output = DtlsOutput::default();
        if self.failed {
            return output;
        }

        self.pending.push_back(datagram);
        if self.handshake_done {
            self.send_pending();
        }
        self.collect_outbound(&mut output);
        output
    }

    /// Sends a close_notify alert to the peer. Returns the resulting datagrams and whether
    ///  the shutdown completed from our side.
    pub fn shutdown(&mut self) -> (Vec<Bytes>, bool) {
        let mut output = DtlsOutput::default();
        if self.handshake_done && !self.failed {
            if let Err(e) = self.stream.shutdown() {
                debug!("DTLS shutdown: {}", e);
            }
        }
        self.collect_outbound(&mut output);

        let done = self.stream.get_shutdown().contains(ShutdownState::SENT);
        (output.to_send, done)
    }

    fn drive_handshake(&mut self, output: &mut DtlsOutput) {
        match self.stream.do_handshake() {
            Ok(()) => {
                debug!("DTLS handshake completed: {} {}", self.ssl().version_str(),
                    self.ssl().current_cipher().map(|c| c.name()).unwrap_or("-"));
                self.handshake_done = true;
                output.event = Some(DtlsEvent::HandshakeCompleted);
            }
            Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {}
            Err(e) => {
                warn!("DTLS handshake failed: {}", e);
                self.failed = true;
                output.event = Some(DtlsEvent::HandshakeFailed(e.to_string()));
            }
        }
    }

    fn read_plaintext(&mut self, output: &mut DtlsOutput) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.stream.ssl_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.received.push(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    debug!("DTLS peer sent close_notify");
                    output.event = Some(DtlsEvent::Closed);
                    break;
                }
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(e) => {
                    // a single corrupt or replayed record must not end the session
                    debug!("DTLS read error: {}", e);
                    if self.stream.get_ref().inbound.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    fn send_pending(&mut self) {
        while let Some(datagram) = self.pending.pop_front() {
            if let Err(e) = self.stream.ssl_write(&datagram) {
                warn!("DTLS write of {} bytes failed: {}", datagram.len(), e);
            }
        }
    }

    fn collect_outbound(&mut self, output: &mut DtlsOutput) {
        for datagram in self.stream.get_mut().outbound.drain(..) {
            for record in records(&datagram) {
                trace!("DTLS sending: {}", describe_record(record));
            }
            output.to_send.push(datagram);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use crate::ids::SecurityId;
    use crate::security::dtls_record::is_handshake_start;
    use crate::security::identity::{Identity, SecureTransport};
    use crate::test_util::security::TestPki;

    const MTU: u32 = 1400;

    fn adapter(identity: &Identity, peer: SocketAddr, is_client: bool) -> DtlsAdapter {
        let ssl = identity.new_ssl(SecureTransport::Dtls, peer).unwrap();
        DtlsAdapter::new(ssl, is_client, MTU).unwrap()
    }

    /// Passes datagrams back and forth until neither side has anything left to send
    fn pump(client: &mut DtlsAdapter, server: &mut DtlsAdapter, mut to_server: Vec<Bytes>) -> (Vec<DtlsOutput>, Vec<DtlsOutput>) {
        let mut client_outputs = Vec::new();
        let mut server_outputs = Vec::new();
        for _ in 0..20 {
            if to_server.is_empty() {
                break;
            }
            let mut to_client = Vec::new();
            for d in to_server.drain(..) {
                let output = server.datagram_received(&d);
                to_client.extend(output.to_send.iter().cloned());
                server_outputs.push(output);
            }
            for d in to_client {
                let output = client.datagram_received(&d);
                to_server.extend(output.to_send.iter().cloned());
                client_outputs.push(output);
            }
        }
        (client_outputs, server_outputs)
    }

    #[test]
    fn test_handshake_and_data() {
        let pki = TestPki::new();
        let client_identity = pki.identity(SecurityId(1), "switch");
        let server_identity = pki.identity(SecurityId(2), "controller");
        let client_addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:6653".parse().unwrap();

        let mut client = adapter(&client_identity, server_addr, true);
        let mut server = adapter(&server_identity, client_addr, false);

        // queued until the handshake is done
        let early = client.send_datagram(Bytes::from_static(b"early"));
        assert!(early.to_send.is_empty());

        let hello = client.connect();
        assert_eq!(hello.to_send.len(), 1);
        assert!(is_handshake_start(&hello.to_send[0]));

        let (client_outputs, server_outputs) = pump(&mut client, &mut server, hello.to_send);
        assert!(client.is_handshake_done());
        assert!(server.is_handshake_done());
        assert!(client_outputs.iter().any(|o| o.event == Some(DtlsEvent::HandshakeCompleted)));
        assert!(server_outputs.iter().any(|o| o.event == Some(DtlsEvent::HandshakeCompleted)));
        assert!(server_outputs.iter().any(|o| o.received.iter().any(|d| d.as_ref() == b"early")));

        let sent = server.send_datagram(Bytes::from_static(b"reply"));
        assert_eq!(sent.to_send.len(), 1);
        let received = client.datagram_received(&sent.to_send[0]);
        assert_eq!(received.received, vec![Bytes::from_static(b"reply")]);

        let (close, done) = client.shutdown();
        assert!(done);
        let closed = server.datagram_received(&close[0]);
        assert_eq!(closed.event, Some(DtlsEvent::Closed));
    }

    #[test]
    fn test_untrusted_peer() {
        let pki = TestPki::new();
        let other_pki = TestPki::new();
        let client_identity = other_pki.identity(SecurityId(1), "switch");
        let server_identity = pki.identity(SecurityId(2), "controller");

        let mut client = adapter(&client_identity, "127.0.0.1:6653".parse().unwrap(), true);
        let mut server = adapter(&server_identity, "127.0.0.1:40000".parse().unwrap(), false);

        let hello = client.connect();
        let (client_outputs, server_outputs) = pump(&mut client, &mut server, hello.to_send);

        assert!(!client.is_handshake_done() || !server.is_handshake_done());
        let failed = |o: &DtlsOutput| matches!(o.event, Some(DtlsEvent::HandshakeFailed(_)));
        assert!(client_outputs.iter().any(failed) || server_outputs.iter().any(failed));
    }
}
