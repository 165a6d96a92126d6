//! Core proxy server module
//!
//! This module contains the connection-handling core:
//! - Addressing header parsing
//! - Per-connection state machine
//! - Idle-timeout supervision
//! - Hook traits for admission, failure reporting and outbound peers

mod connection;
mod handler;
pub mod hooks;
mod protocol;
mod server;
pub mod timeout;
mod user;

pub use connection::{ConnectionId, ConnectionManager};
pub use handler::{ConnectionHandler, Stage};
pub use hooks::UserId;
pub use protocol::{parse_header, Address, DecodeResult};
pub use server::{Server, ServerBuilder};
pub use user::User;
