//! RESP reply values.
//!
//! A `Reply` is one complete decoded frame received from the server.

use bytes::Bytes;
use std::fmt;

/// A decoded RESP reply.
///
/// # Design
///
/// Replies are cheap to clone (`Bytes` for bulk payloads) and immutable
/// once decoded: the decoder creates them, the session routes them, the
/// caller consumes them.
#[derive(Clone, PartialEq)]
pub enum Reply {
    /// Status line, e.g. `+OK` or `+PONG`.
    Status(String),

    /// Error line, e.g. `-ERR no such key`.
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Bulk string (binary-safe).
    Bulk(Bytes),

    /// Nil bulk string (`$-1`) or nil array (`*-1`).
    Null,

    /// Array of nested replies.
    Array(Vec<Reply>),
}

impl Reply {
    /// Check if this is a nil reply.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error reply.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Try to view the reply as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Status(s) | Self::Error(s) => Some(s),
            Self::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to view the reply as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Status(s) => Some(s.as_bytes()),
            Self::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Try to interpret the reply as an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Bulk(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            Self::Status(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to view the reply as an array of replies.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Self::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Convert a bulk or status reply into owned bytes.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Bulk(b) => Some(b),
            Self::Status(s) => Some(Bytes::from(s)),
            _ => None,
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(s) => write!(f, "Status({s:?})"),
            Self::Error(s) => write!(f, "Error({s:?})"),
            Self::Integer(n) => write!(f, "Integer({n})"),
            Self::Bulk(b) => {
                if let Ok(s) = std::str::from_utf8(b) {
                    write!(f, "Bulk({s:?})")
                } else {
                    write!(f, "Bulk({b:?})")
                }
            }
            Self::Null => write!(f, "Null"),
            Self::Array(arr) => {
                write!(f, "Array[")?;
                for (i, reply) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{reply:?}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(s) => write!(f, "+{s}"),
            Self::Error(s) => write!(f, "-{s}"),
            Self::Integer(n) => write!(f, ":{n}"),
            Self::Bulk(b) => {
                if let Ok(s) = std::str::from_utf8(b) {
                    write!(f, "{s}")
                } else {
                    write!(f, "<{} bytes>", b.len())
                }
            }
            Self::Null => write!(f, "(nil)"),
            Self::Array(arr) => {
                for (i, reply) in arr.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {reply}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Self::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Bytes> for Reply {
    fn from(b: Bytes) -> Self {
        Self::Bulk(b)
    }
}

impl From<i64> for Reply {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}
