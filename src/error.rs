//! Error types for viaduct.
//!
//! Every rejection a caller can observe carries a human-readable message
//! and, where one applies, a stable symbolic [`ErrorCode`] so callers can
//! branch programmatically without matching on strings.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for viaduct operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable symbolic codes attached to client-side rejections.
///
/// These mirror the POSIX errno names callers already know how to branch
/// on. Server error replies carry no code; their leading word
/// (`WRONGTYPE`, `ERR`, ...) is the discriminator there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Session is not open (closed, or closing and draining).
    NotConnected,
    /// Connection torn down by the local side, or a connect attempt
    /// cancelled before completion.
    ConnectionAborted,
    /// Connection torn down by the peer.
    ConnectionReset,
    /// Authentication failed during the handshake.
    AccessDenied,
    /// The requested logical database does not exist.
    NoEntry,
    /// The handshake exceeded its configured timeout.
    TimedOut,
    /// Invalid call shape (argument count, malformed target URI).
    InvalidArgument,
    /// The operation is intentionally unsupported by this client.
    NotSupported,
    /// Malformed wire data.
    BadMessage,
    /// The server sent a reply no pending request was waiting for.
    NoMessage,
}

impl ErrorCode {
    /// The symbolic name for this code.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotConnected => "ENOTCONN",
            ErrorCode::ConnectionAborted => "ECONNABORTED",
            ErrorCode::ConnectionReset => "ECONNRESET",
            ErrorCode::AccessDenied => "EACCES",
            ErrorCode::NoEntry => "ENOENT",
            ErrorCode::TimedOut => "ETIMEDOUT",
            ErrorCode::InvalidArgument => "EINVAL",
            ErrorCode::NotSupported => "ENOTSUP",
            ErrorCode::BadMessage => "EBADMSG",
            ErrorCode::NoMessage => "ENOMSG",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for viaduct.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed wire data. Fatal to the stream: the session closes.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server sent more replies than there were pending requests.
    /// Fatal to the stream: the session closes.
    #[error("server sent a reply with no pending request")]
    ReplyUnderflow,

    /// The server returned a typed error reply. Local to one request;
    /// the connection stays usable.
    #[error("{0}")]
    Server(String),

    /// The session is closed.
    #[error("connection is not open")]
    NotConnected,

    /// The session is draining after `end()` and accepts no new commands.
    #[error("connection is shutting down")]
    Closing,

    /// The peer closed the stream while requests were outstanding.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The local side closed the stream while requests were outstanding.
    #[error("connection aborted")]
    ConnectionAborted,

    /// A connect attempt was cancelled before completion.
    #[error("connect attempt cancelled")]
    ConnectCancelled,

    /// The handshake did not complete within the configured timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimedOut(Duration),

    /// AUTH was rejected during the handshake.
    #[error("AUTH failed: {0}")]
    AuthFailed(String),

    /// SELECT was rejected during the handshake.
    #[error("SELECT failed: {0}")]
    SelectFailed(String),

    /// SELECT named a database index the server does not have.
    #[error("unknown database index {0}")]
    UnknownDatabase(i64),

    /// A command was invoked with an argument count this client rejects
    /// before touching the wire.
    #[error("wrong number of arguments for '{0}'")]
    WrongArity(String),

    /// The command is intentionally unsupported (e.g. `monitor`).
    #[error("'{0}' is not supported by this client")]
    Unsupported(String),

    /// The target URI could not be parsed.
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget {
        /// The URI as given.
        target: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A reply arrived whose shape does not match what the command
    /// contract promises.
    #[error("unexpected reply to '{0}'")]
    UnexpectedReply(String),

    /// Every discovery endpoint failed to produce a primary address.
    #[error("no sentinel produced a primary for '{name}': {detail}")]
    NoPrimaryFound {
        /// Logical primary name that was being resolved.
        name: String,
        /// Per-endpoint failure summary.
        detail: String,
    },

    /// The resolved node connected but does not identify as a primary.
    #[error("node at {addr} has role '{role}', expected 'master'")]
    InvalidRole {
        /// Address of the node that failed validation.
        addr: String,
        /// The role it reported.
        role: String,
    },

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The symbolic code for this rejection, if one applies.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Protocol(_) => Some(ErrorCode::BadMessage),
            Error::ReplyUnderflow => Some(ErrorCode::NoMessage),
            Error::Server(_) => None,
            Error::NotConnected | Error::Closing => Some(ErrorCode::NotConnected),
            Error::ConnectionReset => Some(ErrorCode::ConnectionReset),
            Error::ConnectionAborted | Error::ConnectCancelled => {
                Some(ErrorCode::ConnectionAborted)
            }
            Error::ConnectTimedOut(_) => Some(ErrorCode::TimedOut),
            Error::AuthFailed(_) | Error::SelectFailed(_) => Some(ErrorCode::AccessDenied),
            Error::UnknownDatabase(_) => Some(ErrorCode::NoEntry),
            Error::WrongArity(_) | Error::InvalidTarget { .. } => {
                Some(ErrorCode::InvalidArgument)
            }
            Error::Unsupported(_) => Some(ErrorCode::NotSupported),
            Error::UnexpectedReply(_) => Some(ErrorCode::BadMessage),
            Error::NoPrimaryFound { .. } | Error::InvalidRole { .. } | Error::Io(_) => None,
        }
    }

    /// True when the failure may succeed on a fresh connection.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionReset
                | Error::ConnectionAborted
                | Error::ConnectTimedOut(_)
                | Error::Io(_)
        )
    }
}

/// Protocol-level errors during RESP decoding.
///
/// All of these are fatal to the stream; the decoder does not attempt to
/// resynchronize and the owning session closes the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid RESP reply type marker.
    #[error("invalid type marker: {0:?}")]
    InvalidTypeMarker(u8),

    /// Invalid UTF-8 in a status or error line.
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    /// Non-numeric integer or declared length.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Bulk string larger than the configured limit.
    #[error("bulk string too large: {len} bytes (max: {max})")]
    BulkTooLarge {
        /// Declared bulk length in bytes.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Array with more elements than the configured limit.
    #[error("too many array elements: {count} (max: {max})")]
    TooManyElements {
        /// Declared element count.
        count: usize,
        /// Maximum allowed count.
        max: usize,
    },

    /// Missing CRLF terminator after a bulk payload.
    #[error("missing CRLF terminator")]
    MissingCrlf,
}
