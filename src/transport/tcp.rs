use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::{StreamTransport, TransportError};
use crate::logger::log;

/// Stream transport backed by a writer task.
///
/// `close` cancels the connection token, which stops the writer and is
/// also observed by whoever reads the other half.
pub struct TcpTransport {
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Spawn the writer task for `writer` and return the handle
    pub fn spawn<W>(
        writer: W,
        peer_addr: Option<SocketAddr>,
        cancel: CancellationToken,
        queue_capacity: usize,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(write_loop(writer, rx, cancel.clone(), peer_addr));
        Arc::new(Self {
            tx,
            cancel,
            peer_addr,
        })
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    peer_addr: Option<SocketAddr>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(data) = msg else { break };
                if let Err(e) = writer.write_all(&data).await {
                    log::debug!(peer = ?peer_addr, error = %e, "Transport write failed");
                    cancel.cancel();
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    let _ = writer.shutdown().await;
}

impl StreamTransport for TcpTransport {
    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Exhausted),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}
