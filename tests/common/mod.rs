//! Shared helpers for integration tests: scripted single-connection
//! servers speaking raw RESP over loopback TCP.

#![allow(dead_code, clippy::unused_io_amount)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Once;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

/// Route client log output through the test harness. Controlled by
/// `RUST_LOG` as usual.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Bind an ephemeral loopback port and serve exactly one connection with
/// `handler`. The returned handle resolves when the handler finishes.
pub async fn spawn_server<F, Fut>(handler: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        handler(stream).await;
    });
    (addr, handle)
}

/// Read whatever is currently available on the stream. Commands in these
/// tests are short and submitted one at a time, so one read sees one
/// complete command.
pub async fn read_chunk(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    buf.truncate(n);
    buf
}

/// An address guaranteed to refuse connections: bind a port, then free it.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
