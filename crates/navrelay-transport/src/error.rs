use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("address {addr} is already in use")]
    AddrInUse { addr: String },

    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("channel is not connected")]
    NotConnected,

    #[error("failed to encode frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no reply to {kind} {request_id} within {timeout:?}")]
    Timeout {
        kind: &'static str,
        request_id: String,
        timeout: Duration,
    },

    #[error("connection lost before {request_id} completed")]
    ConnectionLost { request_id: String },
}

impl TransportError {
    /// Errors that mean the backend is unreachable rather than misbehaving.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::NotConnected | Self::ConnectionLost { .. }
        )
    }
}
