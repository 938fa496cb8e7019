use std::net::SocketAddr;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use crate::engine::config::ChannelSettings;
use crate::ids::{ConnectionId, ServerId};
use crate::transport::datagram::DatagramSender;

/// A UDP socket and the remote endpoints that have a connection on it
pub(crate) struct UdpEndpoint {
    pub local: SocketAddr,
    pub sender: DatagramSender,
    pub connections: FxHashMap<SocketAddr, ConnectionId>,
    /// listening sockets create connections for unknown endpoints, sockets of outgoing UDP
    ///  connections do not
    pub accepts_new: bool,
}

/// A listening endpoint (TCP, optionally with UDP on the same address), or the UDP socket of an
///  outgoing UDP connection. Dropping a server stops its I/O tasks.
pub(crate) struct Server {
    pub id: ServerId,
    pub settings: ChannelSettings,
    pub tcp_addr: Option<SocketAddr>,
    pub udp: Option<UdpEndpoint>,
    /// the outgoing connection this socket belongs to, if any
    pub owner: Option<ConnectionId>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(id: ServerId, settings: ChannelSettings, tcp_addr: Option<SocketAddr>, udp: Option<UdpEndpoint>, owner: Option<ConnectionId>, tasks: Vec<JoinHandle<()>>) -> Server {
        Server {
            id,
            settings,
            tcp_addr,
            udp,
            owner,
            tasks,
        }
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id,
            tcp_addr: self.tcp_addr,
            udp_addr: self.udp.as_ref().map(|u| u.local),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: ServerId,
    pub tcp_addr: Option<SocketAddr>,
    pub udp_addr: Option<SocketAddr>,
}
