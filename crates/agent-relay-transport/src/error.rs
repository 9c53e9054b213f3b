//! Relay transport errors.

use thiserror::Error;

/// Relay server or client failure.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to relay at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Relay connection closed")]
    Closed,

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
