//! Redis Serialization Protocol (RESP) implementation, client side.
//!
//! Commands are serialized as arrays of bulk strings; replies are decoded
//! from the five RESP2 reply types (plus the nil bulk/array forms).

mod codec;
mod reply;

pub use codec::{encode_command, ReplyDecoder};
pub use reply::Reply;

/// CRLF terminator bytes.
pub const CRLF: &[u8] = b"\r\n";

/// Type markers for RESP replies.
pub mod markers {
    /// Status (simple string): +
    pub const STATUS: u8 = b'+';
    /// Error: -
    pub const ERROR: u8 = b'-';
    /// Integer: :
    pub const INTEGER: u8 = b':';
    /// Bulk string: $
    pub const BULK: u8 = b'$';
    /// Array: *
    pub const ARRAY: u8 = b'*';
}
