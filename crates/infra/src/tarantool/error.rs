use std::time::Duration;

use thiserror::Error;

/// Failures of the Tarantool transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IprotoError {
    /// Dialing (including authentication) failed on every allowed attempt.
    #[error("could not connect to {address} after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        address: String,
        attempts: u32,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server { code: u64, message: String },

    #[error("encode error: {0}")]
    Encode(String),

    /// The session died while the request was in flight.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The connection was closed by its owner; no further calls are accepted.
    #[error("connection closed")]
    Shutdown,
}

impl IprotoError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<std::io::Error> for IprotoError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
