//! Utilities for testing code built on the driver: a listener that records what it sees, and a
//!  throwaway PKI for TLS and DTLS. They are used by the driver's own tests, and they are
//!  exported for application testing.

pub mod listener;
pub mod security;
