//! The connection engine: a single event loop owning all connections and servers, with the
//!  OpenFlow handshake, auxiliary connection binding and keep-alive.

pub mod channel;
pub mod config;
pub(crate) mod connection;
pub(crate) mod engine_core;
pub mod engine;
pub(crate) mod event;
pub(crate) mod handshake;
pub(crate) mod registry;
pub mod server;
pub(crate) mod timers;

pub use channel::{AlertMonitor, Channel, ChannelListener, ListenerFactory, LoggingAlertMonitor};
pub use config::{ChannelOptions, ChannelSettings, EngineConfig};
pub use engine::{ConnectionInfo, Engine, EngineHandle};
pub use server::ServerInfo;

