//! Hook traits for extensibility
//!
//! Defines the extension points the connection handler consults: admission
//! control, failure reporting and outbound peer construction.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

use super::handler::ConnectionHandler;
use super::protocol::Address;
use super::user::User;
use crate::logger::log;

/// User ID type used throughout the system.
pub type UserId = i64;

/// Admission control, consulted on establishment and on every client write.
///
/// Synchronous: both calls are map lookups and run on the hot path.
pub trait AdmissionControl: Send + Sync {
    /// Whether the user's traffic may currently be served
    fn filter_user(&self, user: &User) -> bool;
    /// Place the user in temporary penalty
    fn add_user_to_jail(&self, user_id: UserId);
}

/// Sink for failures contained at a callback boundary. Must never fail.
pub trait ExceptionSentinel: Send + Sync {
    fn capture(&self, context: &str, error: &dyn std::error::Error);
}

/// Sentinel that logs and counts captures
#[derive(Debug, Default)]
pub struct LogSentinel {
    captured: AtomicU64,
}

impl LogSentinel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }
}

impl ExceptionSentinel for LogSentinel {
    fn capture(&self, context: &str, error: &dyn std::error::Error) {
        self.captured.fetch_add(1, Ordering::Relaxed);
        log::error!(context = context, error = %error, "Contained connection failure");
    }
}

/// Outbound leg towards the real destination
pub trait OutboundPeer: Send + Sync {
    /// Forward decrypted client bytes
    fn write(&self, data: Bytes);
    /// Release the outbound leg. Idempotent.
    fn close(&self);
}

/// Everything needed to open an outbound leg
pub struct OutboundRequest {
    pub target: Address,
    /// Application bytes that followed the header, flushed once connected
    pub payload: Bytes,
    /// Receives response bytes through [`ConnectionHandler::write`]
    pub owner: Weak<ConnectionHandler>,
}

/// Establishment failures, split by how they are reported
#[derive(Error, Debug)]
pub enum OutboundError {
    /// Expected network failure: refused, unreachable, timed out
    #[error("outbound I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Anything else
    #[error("outbound setup failed: {0}")]
    Unexpected(String),
}

/// Constructs outbound peers
#[async_trait]
pub trait OutboundConnector: Send + Sync {
    /// Connect a stream leg and flush the request payload
    async fn connect_tcp(&self, req: OutboundRequest) -> Result<Arc<dyn OutboundPeer>, OutboundError>;

    /// Open a datagram endpoint and send the request payload
    async fn open_udp(&self, req: OutboundRequest) -> Result<Arc<dyn OutboundPeer>, OutboundError>;
}
