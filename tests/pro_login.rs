//! Password-keyed login proxy end to end

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use synergy_proxy::handshake::pro::{CLIENT_MAGIC, SERVER_MAGIC};
use synergy_proxy::proxy::{EventKind, ProxyContext, Settings, Supervisor};
use synergy_proxy::tls::UpstreamTls;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

/// Accepts one connection and reports the first `len` bytes it receives
async fn recording_server(len: usize) -> (u16, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        let _ = tx.send(buf);
        // hold the connection open
        let mut rest = [0u8; 64];
        while let Ok(n) = stream.read(&mut rest).await {
            if n == 0 {
                break;
            }
        }
    });
    (port, rx)
}

#[tokio::test]
async fn test_split_magic_gets_one_injected_reply() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = common::supervisor(&dir);
    let mut events = supervisor.subscribe();
    let (upstream, received) = recording_server(CLIENT_MAGIC.len()).await;
    supervisor
        .add(common::definition(json!({
            "type": "pro", "id": "login", "host": "127.0.0.1", "port": 0,
            "remote_port": upstream, "inject_replies": true
        })))
        .unwrap();
    let addr = supervisor.start("login").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (first, rest) = CLIENT_MAGIC.split_at(3);
    let (second, third) = rest.split_at(5);
    for segment in [first, second, third] {
        client.write_all(segment).await.unwrap();
        client.flush().await.unwrap();
        sleep(Duration::from_millis(20)).await;
    }

    let mut reply = vec![0u8; SERVER_MAGIC.len()];
    timeout(Duration::from_secs(30), client.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply, SERVER_MAGIC);

    // the client's bytes still reach the server untouched
    let forwarded = timeout(Duration::from_secs(5), received).await.unwrap().unwrap();
    assert_eq!(forwarded, CLIENT_MAGIC);

    let mut replies = 0;
    let mut phases = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        match event.kind {
            EventKind::Reply { injected, .. } => {
                assert!(injected);
                replies += 1;
            }
            EventKind::Handshake { phase, .. } => phases.push(phase),
            _ => {}
        }
    }
    assert_eq!(replies, 1);
    assert_eq!(phases, vec!["LoginExchange1".to_string()]);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_stalled_handshake_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings { handshake_timeout: Duration::from_millis(300), ..Settings::default() };
    let context = ProxyContext::new(settings, common::authority(&dir), UpstreamTls::new(false).unwrap());
    let supervisor = Arc::new(Supervisor::new(Arc::new(context)));
    let mut events = supervisor.subscribe();
    let upstream = common::echo_server().await;
    supervisor
        .add(common::definition(json!({
            "type": "pro", "id": "login", "host": "127.0.0.1", "port": 0, "remote_port": upstream
        })))
        .unwrap();
    let addr = supervisor.start("login").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(30), client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let error = timeout(Duration::from_secs(5), async {
        loop {
            if let EventKind::Disconnected { error, .. } = events.recv().await.unwrap().kind {
                return error;
            }
        }
    })
    .await
    .unwrap();
    assert!(error.unwrap().starts_with("Timed out"));

    supervisor.stop_all().await;
}
