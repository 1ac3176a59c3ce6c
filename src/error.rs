//! Error types for mysql-auth-proxy

use thiserror::Error;

/// Main error type for the authentication core
#[derive(Error, Debug)]
pub enum AuthProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client handshake packet could not be decoded
    #[error("Handshake parse error: {0}")]
    Parse(#[from] ParseError),

    /// Backend user account query failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Result type alias for AuthProxyError
pub type Result<T> = std::result::Result<T, AuthProxyError>;

impl From<serde_yaml::Error> for AuthProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        AuthProxyError::Config(err.to_string())
    }
}

/// Failure modes of the client handshake-response parser.
///
/// Every variant is per-packet and non-fatal; the accept path converts it
/// into a wire-level protocol error and refuses the connection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer ended in the middle of a field
    #[error("packet truncated")]
    Truncated,

    /// A length header claims more bytes than the packet holds
    #[error("invalid length encoding")]
    Invalid,

    /// Client uses the pre-4.1 authentication protocol
    #[error("client protocol version is too old")]
    OldProtocol,
}

/// Per-backend failure classification during a user account refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Could not open a connection to the backend
    #[error("could not connect to '{server}': {reason}")]
    ConnectFailed { server: String, reason: String },

    /// A grant table query failed mid-refresh
    #[error("failed to query server '{server}' for user account info: {reason}")]
    QueryFailed { server: String, reason: String },

    /// The backend returned rows missing required columns
    #[error("received invalid user account data from '{server}'")]
    InvalidData { server: String },
}
