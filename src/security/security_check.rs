//! Hooks around the TLS / DTLS handshake and shutdown of a connection. They are called with an
//!  explicit [HandshakeContext] identifying the connection, rather than recovering connection
//!  state from data attached to the crypto session.

use std::fmt::Display;
use std::net::SocketAddr;
use anyhow::bail;
use openssl::ssl::{SslRef, SslVerifyMode};
use openssl::x509::{X509NameRef, X509StoreContextRef};
use tracing::{debug, info, warn};
use crate::ids::{ConnectionId, SecurityId};
use crate::security::dtls_record::to_hex;
use crate::security::identity::{Identity, SecureTransport};

#[derive(Clone, Debug)]
pub struct HandshakeContext {
    pub conn_id: ConnectionId,
    pub security_id: SecurityId,
    pub transport: SecureTransport,
    pub remote: SocketAddr,
    pub is_client: bool,
}

/// Prepares a session object before the handshake: installs certificate verification logging,
///  and for clients tries to resume a previous session with the same peer.
pub fn before_handshake(ctx: &HandshakeContext, identity: &Identity, ssl: &mut SslRef) -> anyhow::Result<()> {
    let verify_ctx = ctx.clone();
    ssl.set_verify_callback(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT, move |preverify_ok, store| {
        log_verification(&verify_ctx, preverify_ok, store);
        preverify_ok
    });

    if ctx.is_client {
        if let Some(session) = identity.find_client_session(ctx.remote, ctx.transport) {
            debug!(conn = %ctx.conn_id, security_id = %ctx.security_id, "attempting to resume session with {:?}", ctx.remote);
            // SAFETY: cached sessions are keyed by identity and transport, so this session was
            //  created from the same context as `ssl`
            unsafe { ssl.set_session(&session)?; }
        }
    }
    Ok(())
}

/// Logs the outcome of a handshake and caches the session of successful client handshakes.
///  A failed handshake is returned as an error, which is fatal for the connection.
pub fn after_handshake<E: Display>(ctx: &HandshakeContext, identity: &Identity, ssl: &SslRef, result: Result<(), E>) -> anyhow::Result<()> {
    if let Err(e) = result {
        warn!(conn = %ctx.conn_id, security_id = %ctx.security_id, "{:?} handshake with {:?} failed: {}", ctx.transport, ctx.remote, e);
        bail!("{:?} handshake with {:?} failed: {}", ctx.transport, ctx.remote, e);
    }

    let cipher = ssl.current_cipher()
        .map(|c| c.name())
        .unwrap_or("none");
    let session_id = ssl.session()
        .map(|s| to_hex(s.id()))
        .unwrap_or_default();

    info!(conn = %ctx.conn_id, security_id = %ctx.security_id, version = ssl.version_str(), cipher,
        "{:?} session with {:?} {} {}", ctx.transport, ctx.remote, if ssl.session_reused() { "resumed" } else { "started" }, session_id);

    if ctx.is_client {
        if let Some(session) = ssl.session() {
            identity.save_client_session(ctx.remote, ctx.transport, session.to_owned());
        }
    }
    Ok(())
}

/// Called before the transport of a secure connection is released
pub fn before_close(ctx: &HandshakeContext, handshake_done: bool, shutdown_done: bool) {
    if handshake_done && !shutdown_done {
        warn!(conn = %ctx.conn_id, security_id = %ctx.security_id, "incomplete shutdown of {:?} session with {:?}", ctx.transport, ctx.remote);
    }
    else {
        debug!(conn = %ctx.conn_id, security_id = %ctx.security_id, "closing {:?} session with {:?}", ctx.transport, ctx.remote);
    }
}

fn log_verification(ctx: &HandshakeContext, preverify_ok: bool, store: &X509StoreContextRef) {
    let depth = store.error_depth();
    let subject = store.current_cert()
        .map(|cert| format_name(cert.subject_name()))
        .unwrap_or_default();

    if preverify_ok {
        debug!(conn = %ctx.conn_id, security_id = %ctx.security_id, depth, "verified certificate {}", subject);
    }
    else {
        warn!(conn = %ctx.conn_id, security_id = %ctx.security_id, depth, "certificate {} rejected: {}", subject, store.error().error_string());
    }
}

/// `CN=switch, O=example` style rendering of a certificate name
pub fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry.data().as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}


#[cfg(test)]
mod tests {
    use super::*;
    use openssl::x509::X509NameBuilder;

    fn ctx() -> HandshakeContext {
        HandshakeContext {
            conn_id: ConnectionId(1),
            security_id: SecurityId(2),
            transport: SecureTransport::Tls,
            remote: "127.0.0.1:6653".parse().unwrap(),
            is_client: true,
        }
    }

    #[test]
    fn test_format_name() {
        let mut builder = X509NameBuilder::new().unwrap();
        builder.append_entry_by_text("CN", "switch").unwrap();
        builder.append_entry_by_text("O", "example").unwrap();
        let name = builder.build();

        assert_eq!(format_name(&name), "CN=switch, O=example");
    }

    #[test]
    fn test_after_handshake_failure() {
        let pki = crate::test_util::security::TestPki::new();
        let identity = pki.identity(SecurityId(2), "controller");
        let ssl = identity.new_ssl(SecureTransport::Tls, ctx().remote).unwrap();

        let result = after_handshake(&ctx(), &identity, &ssl, Err("no shared cipher"));
        assert!(result.is_err());
        assert!(identity.find_client_session(ctx().remote, SecureTransport::Tls).is_none());
    }

    #[test]
    fn test_before_handshake_without_cached_session() {
        let pki = crate::test_util::security::TestPki::new();
        let identity = pki.identity(SecurityId(2), "controller");
        let mut ssl = identity.new_ssl(SecureTransport::Tls, ctx().remote).unwrap();

        before_handshake(&ctx(), &identity, &mut ssl).unwrap();
        assert!(!ssl.session_reused());
    }

    #[test]
    fn test_before_close() {
        // only logs - must not panic in any combination
        before_close(&ctx(), true, true);
        before_close(&ctx(), true, false);
        before_close(&ctx(), false, false);
    }
}
