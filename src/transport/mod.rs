//! Client-side transport handles
//!
//! The connection handler never awaits on I/O when writing to a client:
//! - stream transports queue into a bounded channel drained by a writer task
//! - datagram transports use non-blocking sends on a shared socket

mod tcp;
mod udp;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport kind, fixed for the lifetime of a connection handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// Write-side failures of a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Write queue is full: the peer is not draining fast enough
    #[error("write queue exhausted")]
    Exhausted,
    /// Transport already closed
    #[error("transport closed")]
    Closed,
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-oriented transport to a client or destination
pub trait StreamTransport: Send + Sync {
    /// Queue `data` for writing without suspending
    fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the transport. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Datagram transport shared by every flow on one socket
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram without suspending
    fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(format!("{}", TransportKind::Tcp), "tcp");
        assert_eq!(format!("{}", TransportKind::Udp), "udp");
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            format!("{}", TransportError::Exhausted),
            "write queue exhausted"
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(format!("{}", TransportError::from(io)).contains("pipe"));
    }
}
