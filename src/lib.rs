//! A connection driver for OpenFlow: it accepts and opens channels over TCP, TLS, UDP and DTLS,
//!  runs the OpenFlow handshake, binds auxiliary connections to their datapath's main connection
//!  and keeps idle channels alive. Applications plug in through [engine::ChannelListener].

pub mod engine;
pub mod ids;
pub mod protocol;
pub mod security;
pub mod test_util;
pub mod transport;
pub mod util;
