use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ConnConfig;
use crate::core::hooks::{OutboundPeer, OutboundRequest};
use crate::core::timeout::{self, IdleClose, IdleTimer};
use crate::core::{Address, ConnectionHandler};
use crate::logger::log;
use crate::transport::{StreamTransport, TcpTransport, TransportError};

/// Outbound stream leg.
///
/// Writes go through a [`TcpTransport`]; a reader task hands every chunk
/// from the destination to the owning handler. Either side ending tears
/// down both.
pub struct RemoteTcp {
    target: Address,
    transport: Arc<TcpTransport>,
    cancel: CancellationToken,
    timer: IdleTimer,
    owner: Weak<ConnectionHandler>,
}

impl RemoteTcp {
    pub fn spawn(stream: TcpStream, req: OutboundRequest, cfg: &ConnConfig) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::spawn_split(reader, writer, peer, req, cfg)
    }

    /// Start relaying over an already split stream and flush the request payload
    pub fn spawn_split<R, W>(
        reader: R,
        writer: W,
        peer: Option<SocketAddr>,
        req: OutboundRequest,
        cfg: &ConnConfig,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let transport = TcpTransport::spawn(writer, peer, cancel.clone(), cfg.write_queue_capacity);
        let remote = Arc::new(Self {
            target: req.target,
            transport,
            cancel,
            timer: IdleTimer::new(cfg.idle_timeout, cfg.idle_tick),
            owner: req.owner,
        });

        if !req.payload.is_empty() {
            remote.write(req.payload);
        }
        timeout::open_supervision(&remote);
        tokio::spawn(read_loop(remote.clone(), reader, cfg.buffer_size));
        remote
    }

    pub fn target(&self) -> &Address {
        &self.target
    }
}

async fn read_loop<R>(remote: Arc<RemoteTcp>, mut reader: R, buffer_size: usize)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        tokio::select! {
            _ = remote.cancel.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    log::trace!(dest = %remote.target, "Remote EOF");
                    break;
                }
                Ok(n) => {
                    remote.timer.mark_active();
                    let Some(owner) = remote.owner.upgrade() else { break };
                    owner.write(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    log::debug!(dest = %remote.target, error = %e, "Remote read failed");
                    break;
                }
            }
        }
    }

    OutboundPeer::close(remote.as_ref());
    if let Some(owner) = remote.owner.upgrade() {
        owner.close();
    }
}

impl OutboundPeer for RemoteTcp {
    fn write(&self, data: Bytes) {
        let len = data.len() as u64;
        match self.transport.write(data) {
            Ok(()) => {}
            Err(TransportError::Exhausted) => {
                if let Some(owner) = self.owner.upgrade() {
                    log::warn!(user_id = owner.user().id, dest = %self.target, "Remote write queue exhausted");
                    owner.user().sub_upload(len);
                }
                OutboundPeer::close(self);
            }
            Err(e) => log::trace!(dest = %self.target, error = %e, "Remote write dropped"),
        }
    }

    fn close(&self) {
        self.transport.close();
    }
}

impl IdleClose for RemoteTcp {
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
        "remote tcp"
    }
}
