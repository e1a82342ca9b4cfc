//! End-to-end client tests against scripted servers on loopback TCP.

mod common;

use bytes::Bytes;
use common::{read_chunk, spawn_server};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use viaduct::{Client, Error};

#[tokio::test]
async fn test_set_get_del_roundtrip() {
    let (addr, server) = spawn_server(|mut stream| async move {
        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n");
        stream.write_all(b"+OK\r\n").await.unwrap();

        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        stream.write_all(b"$5\r\nhello\r\n").await.unwrap();

        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n");
        stream.write_all(b":1\r\n").await.unwrap();

        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        stream.write_all(b"$-1\r\n").await.unwrap();
    })
    .await;

    let client = Client::connect(&format!("plain://{addr}?idle=-1")).unwrap();
    client.set("k", "hello").await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), Some(Bytes::from("hello")));
    assert_eq!(client.del("k").await.unwrap(), 1);
    assert_eq!(client.get("k").await.unwrap(), None);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_handshake_runs_before_first_command() {
    let (addr, server) = spawn_server(|mut stream| async move {
        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*2\r\n$4\r\nAUTH\r\n$2\r\npw\r\n");
        stream.write_all(b"+OK\r\n").await.unwrap();

        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*2\r\n$6\r\nSELECT\r\n$1\r\n4\r\n");
        stream.write_all(b"+OK\r\n").await.unwrap();

        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*1\r\n$4\r\nPING\r\n");
        stream.write_all(b"+PONG\r\n").await.unwrap();
    })
    .await;

    let client = Client::connect(&format!("plain://:pw@{addr}/4?idle=-1")).unwrap();
    assert_eq!(client.ping(None).await.unwrap(), Bytes::from("PONG"));

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_local_to_one_command() {
    let (addr, server) = spawn_server(|mut stream| async move {
        read_chunk(&mut stream).await;
        stream
            .write_all(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n")
            .await
            .unwrap();

        // Same connection still answers the next command.
        let cmd = read_chunk(&mut stream).await;
        assert_eq!(cmd, b"*1\r\n$4\r\nPING\r\n");
        stream.write_all(b"+PONG\r\n").await.unwrap();
    })
    .await;

    let client = Client::connect(&format!("plain://{addr}?idle=-1")).unwrap();
    let err = client.get("mylist").await.unwrap_err();
    assert!(matches!(err, Error::Server(ref m) if m.starts_with("WRONGTYPE")));
    assert!(err.code().is_none());

    assert_eq!(client.ping(None).await.unwrap(), Bytes::from("PONG"));
    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_after_server_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_chunk(&mut stream).await;
        stream.write_all(b"+PONG\r\n").await.unwrap();
        drop(stream);

        let (mut stream, _) = listener.accept().await.unwrap();
        read_chunk(&mut stream).await;
        stream.write_all(b"+PONG\r\n").await.unwrap();
    });

    let client = Client::connect(&format!("plain://{addr}?idle=-1")).unwrap();
    client.ping(None).await.unwrap();

    // Give the client time to observe the dropped connection.
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.ping(None).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_refused_surfaces_as_io_error() {
    let addr = common::refused_addr().await;
    let client = Client::connect(&format!("plain://{addr}")).unwrap();
    let err = client.ping(None).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_closed_client_reports_enotconn() {
    let addr = common::refused_addr().await;
    let client = Client::connect(&format!("plain://{addr}")).unwrap();
    client.close().await;

    let err = client.ping(None).await.unwrap_err();
    assert_eq!(err.code().map(|c| c.as_str()), Some("ENOTCONN"));
}

#[tokio::test]
async fn test_auth_failure_reported_as_eacces() {
    let (addr, server) = spawn_server(|mut stream| async move {
        read_chunk(&mut stream).await;
        stream
            .write_all(b"-WRONGPASS invalid username-password pair\r\n")
            .await
            .unwrap();
        // Hold the connection open until the client gives up.
        read_chunk(&mut stream).await;
    })
    .await;

    let client = Client::connect(&format!("plain://:bad@{addr}")).unwrap();
    let err = client.ping(None).await.unwrap_err();
    assert!(matches!(err, Error::AuthFailed(_)));
    assert_eq!(err.code().map(|c| c.as_str()), Some("EACCES"));

    server.abort();
    let _ = server.await;
}
