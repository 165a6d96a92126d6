//! Outbound legs towards real destinations
//!
//! [`DirectConnector`] resolves the requested address, opens a TCP stream
//! or a connected UDP socket, and wraps it in a peer object that relays
//! responses back to the owning connection handler.

mod tcp;
mod udp;

pub use tcp::RemoteTcp;
pub use udp::RemoteUdp;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};

use crate::config::ConnConfig;
use crate::core::hooks::{OutboundConnector, OutboundError, OutboundPeer, OutboundRequest};
use crate::logger::log;

/// Connects straight to the destination
pub struct DirectConnector {
    config: ConnConfig,
}

impl DirectConnector {
    pub fn new(config: &ConnConfig) -> Self {
        Self { config: *config }
    }
}

#[async_trait]
impl OutboundConnector for DirectConnector {
    async fn connect_tcp(&self, req: OutboundRequest) -> Result<Arc<dyn OutboundPeer>, OutboundError> {
        let addr = req.target.to_socket_addr().await?;
        let stream = TcpStream::connect(addr).await?;
        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        log::debug!(dest = %req.target, remote = %addr, "Remote TCP connected");
        Ok(RemoteTcp::spawn(stream, req, &self.config))
    }

    async fn open_udp(&self, req: OutboundRequest) -> Result<Arc<dyn OutboundPeer>, OutboundError> {
        let addr = req.target.to_socket_addr().await?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        log::debug!(dest = %req.target, remote = %addr, "Remote UDP endpoint open");
        Ok(RemoteUdp::spawn(socket, req, &self.config))
    }
}
