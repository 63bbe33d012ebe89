//! Error types for client operations.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by client operations.
///
/// The type is `Clone` so a failure settled inside the single-flight guard
/// can be handed to every coalesced caller; I/O errors are carried as their
/// display string for the same reason.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// The relay did not report an identity within the configured timeout.
    /// The half-open transport is discarded before this is returned.
    #[error("handshake did not complete within {timeout:?}")]
    HandshakeTimeout {
        /// The configured handshake deadline.
        timeout: Duration,
    },

    /// `connect()` was invoked while a connection is already live.
    #[error("client is already connected")]
    AlreadyConnected,

    /// `call()` was invoked without a live connection.
    #[error("client is not connected")]
    NotConnected,

    /// No ACK arrived for a call within the configured timeout.
    #[error("call timed out after {timeout:?}")]
    CallTimeout {
        /// The configured call deadline.
        timeout: Duration,
    },

    /// The peer acknowledged the call with an error indicator: the named
    /// handler was missing or its execution failed.
    #[error("remote call failed: {message}")]
    CallFailed {
        /// Error description reported by the peer.
        message: String,
    },

    /// Transport-level failure while connecting or on a live connection.
    #[error("transport error: {message}")]
    Transport {
        /// Details about the transport failure.
        message: String,
    },
}

impl From<io::Error> for ClientError {
    fn from(error: io::Error) -> Self {
        ClientError::Transport {
            message: error.to_string(),
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
