//! # Viaduct
//!
//! An asynchronous client for RESP key-value stores.
//!
//! Viaduct speaks the classic typed request/reply wire protocol (status,
//! error, integer, bulk and array replies over one duplex stream) and
//! provides:
//! - Pipelined command dispatch with strict FIFO reply correlation
//! - Pub/sub push-message demultiplexing on the same connection
//! - A lazily-connecting client with idle disconnect and transparent
//!   reconnect
//! - Sentinel-based discovery of the current primary with role validation
//!
//! ## Example
//!
//! ```no_run
//! use viaduct::{Client, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::connect("plain://127.0.0.1:6379/0?idle=60")?;
//!     client.set("greeting", "hello").await?;
//!     let value = client.get("greeting").await?;
//!     assert_eq!(value.as_deref(), Some(&b"hello"[..]));
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/viaduct/0.1.0")]
#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications
)]
#![allow(clippy::module_name_repetitions)]

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

/// Connection, session and discovery layers.
pub mod client;
/// Error types and result aliases.
pub mod error;
/// RESP2 protocol implementation.
pub mod protocol;

// ─────────────────────────────────────────────────────────────────────────────
// Common Re-exports
// ─────────────────────────────────────────────────────────────────────────────

// Error handling
pub use error::{Error, ErrorCode, Result};

// Protocol
pub use protocol::{Reply, ReplyDecoder};

// Client layers
pub use client::{Client, Event, SentinelResolver, Session, Target};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Crate version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Maximum bulk string size accepted from the server (512 MiB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements accepted in an array reply.
pub const MAX_ARRAY_ELEMENTS: usize = 1_000_000;

/// Default idle period before a quiescent lazy connection is recycled.
pub const DEFAULT_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
