//! Error types for the chat server
//!
//! Defines startup (configuration) errors, which are fatal, and the
//! per-connection error taxonomy, which never escapes the event loop.
//! Uses thiserror for ergonomic error definitions.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::schema::SchemaKind;

/// Fatal startup errors
///
/// Reported before the loop starts; the process does not begin serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// Config file is not valid JSON for `Config`
    #[error("config file {path} is invalid: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Bind address is neither an IP address nor `localhost`
    #[error("'{0}' is not an IP address or 'localhost'")]
    InvalidAddress(String),

    /// Port outside the operational range
    #[error("port {0} not in range 1024-49151")]
    PortOutOfRange(u16),

    /// A timeout or interval configured as zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Handshake window not shorter than the steady-state poll interval
    #[error("handshake timeout {handshake:?} must be shorter than poll interval {poll:?}")]
    HandshakeTooLong { handshake: Duration, poll: Duration },

    /// Maximum message size configured as zero
    #[error("input limit must be greater than zero")]
    ZeroInputLimit,

    /// Unknown text encoding name
    #[error("unsupported text encoding '{0}'")]
    UnsupportedEncoding(String),

    /// Missing or invalid schema
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Listening socket could not be set up
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

/// Schema loading errors (wrapped by `ConfigError::Schema`)
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Schema file could not be read
    #[error("{kind} schema not found in {path}: {source}")]
    Read {
        kind: SchemaKind,
        path: PathBuf,
        source: io::Error,
    },

    /// Schema document is not valid JSON
    #[error("{kind} schema is not valid JSON: {source}")]
    Parse {
        kind: SchemaKind,
        source: serde_json::Error,
    },

    /// A known keyword carries a value of the wrong shape
    #[error("{kind} schema is invalid at {path}: {reason}")]
    Invalid {
        kind: SchemaKind,
        path: String,
        reason: String,
    },
}

/// Payload decode errors
///
/// Raised before validation, always answered with a 400.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Zero-length payload
    #[error("empty payload")]
    Empty,

    /// Read filled past the configured input limit
    #[error("payload exceeds {limit} bytes")]
    Oversized { limit: usize },

    /// Bytes not representable in the configured encoding
    #[error("payload is not valid {encoding} text")]
    Encoding { encoding: &'static str },

    /// Malformed or truncated JSON
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON that is not an object
    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Schema validation failure
///
/// Carries only the first offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field [{path}] {reason}")]
pub struct ValidationError {
    /// JSON-pointer style path of the offending field (`/` for the root)
    pub path: String,
    /// Human-readable reason
    pub reason: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Per-connection errors
///
/// Each one closes and deregisters exactly one connection.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Undecodable payload (400)
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Schema mismatch (400)
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// No presence within the handshake window (400)
    #[error("no presence within handshake window")]
    HandshakeTimeout,

    /// Peer closed or reset the transport (no response)
    #[error("peer disconnected")]
    Disconnected,

    /// Only part of a payload reached the socket, framing is lost (no response)
    #[error("short write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },

    /// Anything else the transport reports (500)
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => ConnError::Disconnected,
            _ => ConnError::Io(err),
        }
    }
}

impl ConnError {
    /// Whether this is an ordinary peer departure rather than a fault
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConnError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_is_disconnect() {
        let err: ConnError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(err.is_disconnect());

        let err: ConnError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_other_io_is_internal() {
        let err: ConnError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, ConnError::Io(_)));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("/user/account_name", "is a required property");
        assert_eq!(
            err.to_string(),
            "field [/user/account_name] is a required property"
        );
    }
}
