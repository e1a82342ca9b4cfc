//! Connection, session and discovery layers.
//!
//! From the bottom up: a [`Connector`] produces connected streams, a
//! [`Session`] speaks the protocol over one of them, [`establish`] runs
//! the AUTH/SELECT handshake, [`Client`] adds lazy connection management
//! on top, and [`SentinelResolver`] discovers where to connect in the
//! first place.

mod event;
mod handshake;
mod lazy;
mod sentinel;
mod session;
mod target;
mod transport;

pub use event::{Event, EventHub};
pub use handshake::establish;
pub use lazy::Client;
pub use sentinel::SentinelResolver;
pub use session::Session;
pub use target::Target;
pub use transport::{BoxedStream, ConnectFuture, Connector, DefaultConnector, Endpoint, Stream};

#[cfg(feature = "tls")]
pub use transport::TlsConnector;
