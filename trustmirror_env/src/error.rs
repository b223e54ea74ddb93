//! Error types for the trustmirror environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Connection could not be established (refused, DNS, handshake, ...)
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Send or receive failed on an established connection
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Operation attempted on a connection that is no longer open
    #[error("Connection closed")]
    ConnectionClosed,

    /// Endpoint URL could not be parsed or is unsupported
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a connect error.
    pub fn connect(msg: impl std::fmt::Display) -> Self {
        Self::ConnectFailed(msg.to_string())
    }

    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidEndpoint(_))
    }
}
