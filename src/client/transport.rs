//! Transport acquisition.
//!
//! A [`Connector`] turns an [`Endpoint`] into a connected duplex byte
//! stream. The rest of the client only ever sees the stream; swapping the
//! connector is how tests inject in-memory transports and how callers
//! bring their own TLS policy.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A connected duplex byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Owned, type-erased stream handed to a session.
pub type BoxedStream = Box<dyn Stream>;

/// Future returned by [`Connector::connect`]. Dropping it cancels the
/// underlying connect attempt.
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'a>>;

/// A resolved transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP address, optionally expecting TLS.
    Tcp {
        /// Remote host name or IP literal.
        host: String,
        /// Remote port.
        port: u16,
        /// Whether the target URI asked for TLS.
        tls: bool,
    },
    /// Unix-domain socket path.
    Unix {
        /// Filesystem path of the socket.
        path: PathBuf,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port, tls } => {
                let scheme = if *tls { "tls" } else { "plain" };
                write!(f, "{scheme}://{host}:{port}")
            }
            Endpoint::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Supplies connected streams for endpoints.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a duplex stream to `endpoint`.
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> ConnectFuture<'a>;
}

/// Default connector: plain TCP and Unix-domain sockets.
///
/// TLS endpoints are rejected here; use [`TlsConnector`] (feature `tls`)
/// or a custom [`Connector`] for those.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> ConnectFuture<'a> {
        Box::pin(async move {
            match endpoint {
                Endpoint::Tcp {
                    host,
                    port,
                    tls: false,
                } => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    // Disable Nagle's algorithm for low latency
                    let _ = stream.set_nodelay(true);
                    debug!("connected to {endpoint}");
                    Ok(Box::new(stream) as BoxedStream)
                }
                Endpoint::Tcp { tls: true, .. } => Err(unsupported(format!(
                    "{endpoint} requires a TLS-capable connector"
                ))),
                Endpoint::Unix { path } => connect_unix(path).await,
            }
        })
    }
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> io::Result<BoxedStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    debug!("connected to unix://{}", path.display());
    Ok(Box::new(stream) as BoxedStream)
}

#[cfg(not(unix))]
async fn connect_unix(path: &std::path::Path) -> io::Result<BoxedStream> {
    Err(unsupported(format!(
        "unix-domain sockets are unavailable on this platform: {}",
        path.display()
    )))
}

fn unsupported(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, msg)
}

#[cfg(feature = "tls")]
pub use tls::TlsConnector;

#[cfg(feature = "tls")]
mod tls {
    use super::*;
    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    /// TLS-capable connector built on rustls.
    ///
    /// Plain endpoints are passed through untouched, so one `TlsConnector`
    /// can serve mixed `plain://`/`tls://` targets.
    #[derive(Clone)]
    pub struct TlsConnector {
        config: Arc<ClientConfig>,
    }

    impl TlsConnector {
        /// Use a caller-built rustls client configuration.
        pub fn new(config: Arc<ClientConfig>) -> Self {
            Self { config }
        }

        /// Build a connector trusting the CA certificates in a PEM file.
        pub fn from_ca_file(path: &std::path::Path) -> io::Result<Self> {
            let file = std::fs::File::open(path)?;
            let mut reader = std::io::BufReader::new(file);
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut reader) {
                roots
                    .add(cert?)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Self::new(Arc::new(config)))
        }
    }

    impl fmt::Debug for TlsConnector {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TlsConnector").finish_non_exhaustive()
        }
    }

    impl Connector for TlsConnector {
        fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> ConnectFuture<'a> {
            Box::pin(async move {
                match endpoint {
                    Endpoint::Tcp {
                        host,
                        port,
                        tls: true,
                    } => {
                        let stream = TcpStream::connect((host.as_str(), *port)).await?;
                        let _ = stream.set_nodelay(true);
                        let name = ServerName::try_from(host.clone())
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
                        let stream = connector.connect(name, stream).await?;
                        debug!("connected to {endpoint}");
                        Ok(Box::new(stream) as BoxedStream)
                    }
                    other => DefaultConnector.connect(other).await,
                }
            })
        }
    }
}
