//! Error handling for tic-remote
//!
//! This module defines the error taxonomy for the remoting protocol client
//! and a Result alias used throughout the crate.

use thiserror::Error;

/// Main error type for remote session operations
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transport-level I/O failure (connect, read, write)
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A connect attempt exceeded its deadline
    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),

    /// A specific request's response never arrived within its timeout window
    #[error("request {id} ({command}) timed out")]
    RequestTimeout {
        /// Request id that expired
        id: u64,
        /// Command verb of the expired request
        command: String,
    },

    /// An operation was attempted without an established session
    #[error("not connected")]
    NotConnected,

    /// The transport closed while requests were outstanding
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The hello response did not match the expected protocol banner
    #[error("protocol mismatch, unexpected hello banner: {0:?}")]
    ProtocolMismatch(String),

    /// Host-side command failure (an `ERR` response line)
    #[error("remote error: {0}")]
    Remote(String),

    /// Errors related to configuration loading/saving
    #[error("configuration error: {0}")]
    Config(String),
}

impl RemoteError {
    /// True for errors that indicate the underlying transport is unusable
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::Io(_) | RemoteError::ConnectTimeout(_) | RemoteError::ConnectionClosed(_)
        )
    }
}

/// Result type alias for remote session operations
pub type Result<T> = std::result::Result<T, RemoteError>;
