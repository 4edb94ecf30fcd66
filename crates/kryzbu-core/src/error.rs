//! Error types for Kryzbu.
//!
//! Variants map one-to-one onto the failure classes the connection handler
//! distinguishes when choosing a wire reply. Display strings stay generic so
//! that nothing about keys or credentials leaks into replies or logs; the
//! attached detail is meant for operator diagnostics only.

use thiserror::Error;

/// Core error type for Kryzbu operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame, unknown command or invalid file name.
    #[error("protocol error")]
    Protocol(String),

    /// Bad tag, pad mismatch, unknown user or nonce mismatch.
    #[error("not authenticated")]
    Authentication(String),

    /// Requested file does not exist for the caller.
    #[error("not found")]
    NotFound(String),

    /// The peer went away or the stream failed mid-operation.
    #[error("transport error")]
    Transport(String),

    /// Audit log integrity tag mismatch.
    #[error("integrity check failed")]
    Integrity(String),

    /// Record store or filesystem operation failed.
    #[error("storage error")]
    Storage(String),

    /// Cryptographic operation failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Key validation or parsing failed.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error")]
    Config(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using Kryzbu's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the connection handler answers this error with
    /// `ERROR;NotAuthenticatedError`.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication(_) | Error::Crypto(_))
    }

    /// Errors caused by the peer disappearing; these end the connection
    /// without a reply.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout)
    }

    /// Diagnostic detail attached to the error, if any.
    pub fn detail(&self) -> &str {
        match self {
            Error::Protocol(d)
            | Error::Authentication(d)
            | Error::NotFound(d)
            | Error::Transport(d)
            | Error::Integrity(d)
            | Error::Storage(d)
            | Error::Crypto(d)
            | Error::InvalidKey(d)
            | Error::Encoding(d)
            | Error::Config(d) => d,
            Error::Timeout => "timeout",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => Error::Transport(e.to_string()),
            std::io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Storage(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
