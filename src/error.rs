//! Error types

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a connection
///
/// Fatal conditions are delivered once through the matching
/// [`ConnectionHandler`](crate::connection::ConnectionHandler) callback; the
/// same value is never surfaced twice.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete server configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Host name could not be resolved
    #[error("cannot resolve server '{host}': {source}")]
    Resolve {
        /// Host that failed to resolve
        host: String,
        /// Underlying resolver error
        #[source]
        source: io::Error,
    },

    /// Every resolved address was tried and none accepted the connection
    #[error("no working address found for {0}")]
    NoAddress(String),

    /// Tunnel subprocess could not be started
    #[error("cannot start tunnel '{command}': {source}")]
    Tunnel {
        /// Shell command of the tunnel
        command: String,
        /// Spawn error
        #[source]
        source: io::Error,
    },

    /// Connecting to a single candidate address failed
    #[error("cannot connect to {name}: {source}")]
    Connect {
        /// Display name of the candidate
        name: String,
        /// Socket error
        #[source]
        source: io::Error,
    },

    /// Transport I/O failure
    #[error("socket error: {op} {name}: {source}")]
    Io {
        /// Operation that failed, e.g. `read from`
        op: &'static str,
        /// Connection display name
        name: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Peer closed the stream while we still expected data
    #[error("socket error: {op} {name}: unexpected EOF")]
    UnexpectedEof {
        /// Operation that observed the EOF
        op: &'static str,
        /// Connection display name
        name: String,
    },

    /// A single logical line did not fit into the receive buffer
    #[error("socket error: receive buffer full. Probably protocol error")]
    BufferFull,

    /// TLS setup, handshake or record-layer failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server certificate did not pass verification
    #[error("certificate verification failed: {0}")]
    Verify(String),

    /// Deflate or inflate failure
    #[error("compression error: {0}")]
    Compression(String),

    /// Operation not allowed in the current connection state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// What the operation required
        expected: String,
        /// What the connection was in
        actual: String,
    },
}

impl Error {
    /// Short, stable label for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Resolve { .. } => "resolve",
            Self::NoAddress(_) => "no_address",
            Self::Tunnel { .. } => "tunnel",
            Self::Connect { .. } => "connect",
            Self::Io { .. } => "io",
            Self::UnexpectedEof { .. } => "eof",
            Self::BufferFull => "buffer_full",
            Self::Tls(_) => "tls",
            Self::Verify(_) => "verify",
            Self::Compression(_) => "compression",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}
