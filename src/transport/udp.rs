use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::{DatagramTransport, TransportError};

/// Datagram transport over a shared UDP socket.
///
/// Sends never suspend: a full kernel buffer surfaces as `Exhausted`.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, TransportError> {
        match self.socket.try_send_to(data, target) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::Exhausted),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}
