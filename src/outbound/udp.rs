use bytes::Bytes;
use std::io;
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::ConnConfig;
use crate::core::hooks::{OutboundPeer, OutboundRequest};
use crate::core::timeout::{self, IdleClose, IdleTimer};
use crate::core::{Address, ConnectionHandler};
use crate::logger::log;

/// Outbound datagram leg over a connected socket.
///
/// Every response is prefixed with the address header of its source before
/// it is handed to the owning handler, so the client can tell flows apart.
pub struct RemoteUdp {
    target: Address,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    timer: IdleTimer,
    owner: Weak<ConnectionHandler>,
}

impl RemoteUdp {
    /// `socket` must already be connected to the destination
    pub fn spawn(socket: UdpSocket, req: OutboundRequest, cfg: &ConnConfig) -> Arc<Self> {
        let remote = Arc::new(Self {
            target: req.target,
            socket: Arc::new(socket),
            cancel: CancellationToken::new(),
            timer: IdleTimer::new(cfg.idle_timeout, cfg.idle_tick),
            owner: req.owner,
        });

        timeout::open_supervision(&remote);
        tokio::spawn(recv_loop(remote.clone(), req.payload, cfg.buffer_size));
        remote
    }
}

/// Address header of `source` followed by `data`
fn with_source_header(source: &Address, data: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(1 + 16 + 2 + data.len());
    source.encode(&mut framed);
    framed.extend_from_slice(data);
    Bytes::from(framed)
}

async fn recv_loop(remote: Arc<RemoteUdp>, payload: Bytes, buffer_size: usize) {
    if !payload.is_empty() {
        if let Err(e) = remote.socket.send(&payload).await {
            log::debug!(dest = %remote.target, error = %e, "Remote UDP send failed");
            remote.cancel.cancel();
            return;
        }
    }

    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        tokio::select! {
            _ = remote.cancel.cancelled() => break,
            res = remote.socket.recv_from(&mut buf) => match res {
                Ok((n, source)) => {
                    remote.timer.mark_active();
                    let Some(owner) = remote.owner.upgrade() else { break };
                    owner.write(with_source_header(&Address::from(source), &buf[..n]));
                }
                // ICMP unreachable on a connected socket; keep listening
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    log::trace!(dest = %remote.target, "Remote UDP refused");
                }
                Err(e) => {
                    log::debug!(dest = %remote.target, error = %e, "Remote UDP receive failed");
                    break;
                }
            }
        }
    }
    remote.cancel.cancel();
}

impl OutboundPeer for RemoteUdp {
    fn write(&self, data: Bytes) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.socket.try_send(&data) {
            log::debug!(dest = %self.target, error = %e, "Remote UDP send dropped");
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl IdleClose for RemoteUdp {
    fn idle_timer(&self) -> &IdleTimer {
        &self.timer
    }

    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn close(&self) {
        OutboundPeer::close(self);
    }

    fn name(&self) -> &'static str {
        "remote udp"
    }
}
