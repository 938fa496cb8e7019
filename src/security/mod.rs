//! Transport security: certificate identities, hooks around TLS / DTLS handshakes, and the
//!  adapter that runs DTLS over the driver's UDP sockets.

pub mod dtls_adapter;
pub mod dtls_record;
pub mod identity;
pub mod security_check;

pub use identity::{Identity, SecureTransport};
