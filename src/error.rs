//! Error types for the tnnlr tunnel agent.
//!
//! This module defines the error types that can occur while acquiring an
//! endpoint and running tunnel connections:
//!
//! - [`TunnelError`]: The main error type encompassing all possible errors
//! - [`Result<T>`]: A convenience type alias for `std::result::Result<T, TunnelError>`

use std::sync::Arc;
use thiserror::Error;

/// A convenience type alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while running a tunnel.
///
/// This enum uses `Arc<str>` for string fields to make cloning cheap,
/// since errors are frequently cloned in async code paths.
///
/// # Stability
///
/// This enum is marked `#[non_exhaustive]`, meaning new variants may be added
/// in future versions without a breaking change. When matching on this enum,
/// always include a wildcard arm (`_`) to handle unknown variants.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TunnelError {
    /// Failed to obtain an endpoint from the control-plane service.
    ///
    /// This can happen if:
    /// - The service is unreachable
    /// - The API key was rejected
    /// - The response body was not a valid endpoint record
    #[error("Endpoint acquisition failed: {0}")]
    EndpointAcquisition(Arc<str>),

    /// Could not reach the remote rendezvous endpoint.
    ///
    /// `refused` is set when the underlying cause was `ECONNREFUSED`.
    #[error("Remote dial failed: {message}")]
    RemoteDial {
        /// Description of the underlying failure
        message: Arc<str>,
        /// Whether the remote actively refused the connection
        refused: bool,
    },

    /// No authentication indicator arrived within the deadline.
    #[error("Authentication timed out")]
    AuthTimeout,

    /// The remote rejected the authentication frame.
    #[error("Authentication rejected by remote")]
    AuthRejected,

    /// The connection failed or closed before authentication resolved.
    #[error("Authentication transport failure: {0}")]
    AuthTransport(Arc<str>),

    /// The remote violated the control sub-protocol.
    ///
    /// Currently this means more than 64 KiB of data arrived before a
    /// `READY` line resolved the handshake.
    #[error("Protocol error: {0}")]
    Protocol(Arc<str>),

    /// The remote closed the connection before reaching a required state.
    #[error("Connection closed prematurely")]
    PrematureClose,

    /// Could not reach the local server.
    ///
    /// `refused` is set when the underlying cause was `ECONNREFUSED`,
    /// which usually means nothing is listening on the local port.
    #[error("Local dial failed: {message}")]
    LocalDial {
        /// Description of the underlying failure
        message: Arc<str>,
        /// Whether the local side actively refused the connection
        refused: bool,
    },

    /// The local TLS configuration is invalid.
    ///
    /// Certificate, key, or CA bundle files could not be read or parsed.
    #[error("Local TLS configuration error: {0}")]
    LocalConfig(Arc<str>),

    /// I/O error.
    ///
    /// An underlying I/O operation failed mid-splice.
    #[error("I/O error: {0}")]
    Io(Arc<str>),
}

impl TunnelError {
    /// Builds a [`TunnelError::RemoteDial`], distinguishing `ECONNREFUSED`.
    pub(crate) fn remote_dial(err: &std::io::Error) -> Self {
        TunnelError::RemoteDial {
            message: Arc::from(err.to_string()),
            refused: err.kind() == std::io::ErrorKind::ConnectionRefused,
        }
    }

    /// Builds a [`TunnelError::LocalDial`], distinguishing `ECONNREFUSED`.
    pub(crate) fn local_dial(err: &std::io::Error) -> Self {
        TunnelError::LocalDial {
            message: Arc::from(err.to_string()),
            refused: err.kind() == std::io::ErrorKind::ConnectionRefused,
        }
    }

    /// Whether the error was an actively refused connection on either leg.
    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            TunnelError::RemoteDial { refused: true, .. }
                | TunnelError::LocalDial { refused: true, .. }
        )
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::Io(Arc::from(err.to_string()))
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        TunnelError::EndpointAcquisition(Arc::from(err.to_string()))
    }
}
