use std::io;
use thiserror::Error;

use crate::core::hooks::OutboundError;
use crate::transport::TransportError;

/// Process-level error type
#[derive(Error, Debug)]
pub enum ServerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cipher setup error
    #[error("Cipher error: {0}")]
    Cipher(#[from] CryptoError),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// Result alias for process-level operations
pub type Result<T> = std::result::Result<T, ServerError>;

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for ServerError {
    fn from(err: toml::de::Error) -> Self {
        ServerError::Config(format!("TOML parse error: {}", err))
    }
}

/// Cipher selection and transform failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No registered cipher family claims the method
    #[error("unsupported cipher method: {0}")]
    UnsupportedCipher(String),

    /// Authentication or framing failure on inbound ciphertext
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Failure of a single connection callback.
///
/// Returned by every `try_*` callback of the connection handler and
/// contained at the callback boundary; never propagates to the server.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("invalid header: {0}")]
    Header(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error("no outbound peer in stage {0}")]
    MissingPeer(crate::core::Stage),
}
