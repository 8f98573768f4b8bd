//! End-to-end relays through running proxies

mod common;

use std::pin::Pin;
use std::time::Duration;

use openssl::ssl::{SslConnector, SslMethod};
use serde_json::json;
use synergy_proxy::proxy::EventKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_openssl::SslStream;

#[tokio::test]
async fn test_tcp_relay_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = common::supervisor(&dir);
    let upstream = common::echo_server().await;
    supervisor
        .add(common::definition(json!({
            "type": "tcp", "id": "echo", "host": "127.0.0.1", "port": 0, "remote_port": upstream
        })))
        .unwrap();
    let addr = supervisor.start("echo").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello");

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_refused_upstream_closes_client() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = common::supervisor(&dir);
    let mut events = supervisor.subscribe();
    supervisor
        .add(common::definition(json!({
            "type": "tcp", "id": "dead", "host": "127.0.0.1", "port": 0, "remote_port": common::free_port()
        })))
        .unwrap();
    let addr = supervisor.start("dead").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let disconnected = timeout(Duration::from_secs(5), async {
        loop {
            if let EventKind::Disconnected { error, .. } = events.recv().await.unwrap().kind {
                return error;
            }
        }
    })
    .await
    .unwrap();
    assert!(disconnected.is_some());
}

#[tokio::test]
async fn test_stop_drops_live_connections() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = common::supervisor(&dir);
    let upstream = common::echo_server().await;
    supervisor
        .add(common::definition(json!({
            "type": "tcp", "id": "echo", "host": "127.0.0.1", "port": 0, "remote_port": upstream
        })))
        .unwrap();
    let addr = supervisor.start("echo").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();

    assert!(supervisor.stop("echo").await.unwrap());
    let read = timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

/// TLS echo server presenting a leaf from a second authority
async fn tls_echo_server(dir: &tempfile::TempDir) -> u16 {
    let authority = common::authority(dir);
    let leaf = authority.leaf_for("localhost").await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ssl = openssl::ssl::Ssl::new(leaf.acceptor.context()).unwrap();
        let mut stream = SslStream::new(ssl, stream).unwrap();
        Pin::new(&mut stream).accept().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
    });
    port
}

#[tokio::test]
async fn test_https_is_intercepted_with_a_trusted_leaf() {
    let proxy_dir = tempfile::tempdir().unwrap();
    let upstream_dir = tempfile::tempdir().unwrap();
    let supervisor = common::supervisor(&proxy_dir);
    let upstream = tls_echo_server(&upstream_dir).await;
    supervisor
        .add(common::definition(json!({
            "type": "http", "id": "web", "host": "127.0.0.1", "port": 0, "remote_port": upstream
        })))
        .unwrap();
    let addr = supervisor.start("web").unwrap();

    // the client trusts only the proxy's root
    let root = supervisor.context().authority.root_certificate().clone();
    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    builder.cert_store_mut().add_cert(root).unwrap();
    let connector = builder.build();
    let ssl = connector.configure().unwrap().into_ssl("localhost").unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = SslStream::new(ssl, stream).unwrap();
    timeout(Duration::from_secs(10), Pin::new(&mut client).connect()).await.unwrap().unwrap();

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(10), client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello");

    supervisor.stop_all().await;
}
