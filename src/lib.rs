//! Multi-user shadowsocks server with per-user accounting
//!
//! Architecture:
//! - `core/`: Connection state machine, idle supervision and hook traits
//! - `crypto/`: Cipher registry and stream cipher families
//! - `transport/`: Client-side stream and datagram transports
//! - `outbound/`: Outbound legs towards destinations
//! - `business/`: Admission pool, user store and background tasks
//! - `server_runner`: Per-user listeners and accept loops

pub mod business;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod logger;
pub mod outbound;
pub mod server_runner;
pub mod transport;
