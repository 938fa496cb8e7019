use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};
use anyhow::anyhow;
use openssl::ex_data::Index;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslRef, SslSession, SslVerifyMode};
use openssl::x509::X509;
use rand::RngCore;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use crate::ids::SecurityId;

const COOKIE_LEN: usize = 16;

/// The two flavors of secure transport an [Identity] provides contexts for. Sessions are not
///  interchangeable between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecureTransport {
    Tls,
    Dtls,
}

/// A local certificate and key, together with the CAs trusted for verifying peers, and
///  everything derived from them: TLS and DTLS contexts, a secret for DTLS cookies and a cache
///  of client sessions for resumption.
pub struct Identity {
    security_id: SecurityId,
    tls: SslContext,
    dtls: SslContext,
    peer_index: Index<Ssl, SocketAddr>,
    client_sessions: RwLock<FxHashMap<(SocketAddr, SecureTransport), SslSession>>,
}

impl Identity {
    /// Creates an identity from PEM encoded data: `cert_chain_pem` starts with the local
    ///  certificate, optionally followed by intermediate certificates. `trusted_ca_pem` contains
    ///  the certificates of CAs that peers' certificates must chain up to.
    pub fn new(security_id: SecurityId, cert_chain_pem: &[u8], private_key_pem: &[u8], trusted_ca_pem: &[u8]) -> anyhow::Result<Identity> {
        let chain = X509::stack_from_pem(cert_chain_pem)?;
        let key = PKey::private_key_from_pem(private_key_pem)?;
        let trusted = X509::stack_from_pem(trusted_ca_pem)?;
        if trusted.is_empty() {
            return Err(anyhow!("no trusted CA certificate"));
        }

        let mut cookie_secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut cookie_secret);
        let peer_index = Ssl::new_ex_index::<SocketAddr>()?;

        let tls = Self::build_context(SslMethod::tls(), &chain, &key, &trusted)?
            .build();

        let mut dtls = Self::build_context(SslMethod::dtls(), &chain, &key, &trusted)?;
        dtls.set_options(SslOptions::COOKIE_EXCHANGE | SslOptions::NO_QUERY_MTU);
        dtls.set_cookie_generate_cb(move |ssl, buf| {
            let cookie = Self::cookie(&cookie_secret, ssl.ex_data(peer_index));
            let len = cookie.len().min(buf.len());
            buf[..len].copy_from_slice(&cookie[..len]);
            Ok(len)
        });
        dtls.set_cookie_verify_cb(move |ssl, cookie| {
            cookie == Self::cookie(&cookie_secret, ssl.ex_data(peer_index))
        });
        let dtls = dtls.build();

        info!("created identity {} for {:?}", security_id, chain[0].subject_name());

        Ok(Identity {
            security_id,
            tls,
            dtls,
            peer_index,
            client_sessions: Default::default(),
        })
    }

    fn build_context(method: SslMethod, chain: &[X509], key: &PKeyRef<Private>, trusted: &[X509]) -> anyhow::Result<SslContextBuilder> {
        let (certificate, intermediates) = chain.split_first()
            .ok_or_else(|| anyhow!("certificate chain is empty"))?;

        let mut builder = SslContextBuilder::new(method)?;
        builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3 | SslOptions::NO_COMPRESSION);
        builder.set_certificate(certificate)?;
        for intermediate in intermediates {
            builder.add_extra_chain_cert(intermediate.clone())?;
        }
        builder.set_private_key(key)?;
        builder.check_private_key()?;
        for ca in trusted {
            builder.cert_store_mut().add_cert(ca.clone())?;
        }
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        Ok(builder)
    }

    /// DTLS cookies bind the client's address to a local secret, so a HelloVerifyRequest
    ///  round trip proves that the client can receive at the address it claims
    fn cookie(secret: &[u8], peer: Option<&SocketAddr>) -> [u8; COOKIE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        if let Some(peer) = peer {
            hasher.update(peer.to_string().as_bytes());
        }
        let digest = hasher.finalize();

        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&digest[..COOKIE_LEN]);
        cookie
    }

    pub fn security_id(&self) -> SecurityId {
        self.security_id
    }

    pub fn context(&self, transport: SecureTransport) -> &SslContext {
        match transport {
            SecureTransport::Tls => &self.tls,
            SecureTransport::Dtls => &self.dtls,
        }
    }

    /// Creates a session object for a new connection to or from `peer`
    pub fn new_ssl(&self, transport: SecureTransport, peer: SocketAddr) -> anyhow::Result<Ssl> {
        let mut ssl = Ssl::new(self.context(transport))?;
        self.attach_peer(&mut ssl, peer);
        Ok(ssl)
    }

    fn attach_peer(&self, ssl: &mut SslRef, peer: SocketAddr) {
        ssl.set_ex_data(self.peer_index, peer);
    }

    pub fn find_client_session(&self, peer: SocketAddr, transport: SecureTransport) -> Option<SslSession> {
        self.client_sessions.read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(peer, transport))
            .cloned()
    }

    pub fn save_client_session(&self, peer: SocketAddr, transport: SecureTransport, session: SslSession) {
        debug!("caching {:?} client session for {:?}", transport, peer);
        self.client_sessions.write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((peer, transport), session);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::security::TestPki;

    #[test]
    fn test_new_identity() {
        let pki = TestPki::new();
        let identity = pki.identity(SecurityId(1), "switch");
        assert_eq!(identity.security_id(), SecurityId(1));

        let peer: SocketAddr = "127.0.0.1:6653".parse().unwrap();
        let ssl = identity.new_ssl(SecureTransport::Dtls, peer).unwrap();
        assert_eq!(ssl.ex_data(identity.peer_index), Some(&peer));
    }

    #[test]
    fn test_new_identity_mismatched_key() {
        let pki = TestPki::new();
        let (cert, _) = pki.issue("a");
        let (_, key) = pki.issue("b");
        assert!(Identity::new(SecurityId(1), &cert, &key, &pki.ca_pem()).is_err());
    }

    #[test]
    fn test_new_identity_without_trusted_ca() {
        let pki = TestPki::new();
        let (cert, key) = pki.issue("a");
        assert!(Identity::new(SecurityId(1), &cert, &key, b"").is_err());
    }

    #[test]
    fn test_cookie() {
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:1001".parse().unwrap();

        assert_eq!(Identity::cookie(b"secret", Some(&a)), Identity::cookie(b"secret", Some(&a)));
        assert_ne!(Identity::cookie(b"secret", Some(&a)), Identity::cookie(b"secret", Some(&b)));
        assert_ne!(Identity::cookie(b"secret", Some(&a)), Identity::cookie(b"other", Some(&a)));
    }

    #[test]
    fn test_session_cache_miss() {
        let pki = TestPki::new();
        let identity = pki.identity(SecurityId(1), "switch");
        let peer: SocketAddr = "127.0.0.1:6653".parse().unwrap();
        assert!(identity.find_client_session(peer, SecureTransport::Tls).is_none());
    }
}
