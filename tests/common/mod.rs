//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use synergy_proxy::proxy::{ProxyContext, ProxyDefinition, Settings, Supervisor};
use synergy_proxy::tls::{CertificateAuthority, UpstreamTls};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn authority(dir: &tempfile::TempDir) -> Arc<CertificateAuthority> {
    Arc::new(CertificateAuthority::open_path(&dir.path().join("key_store.json"), "").unwrap())
}

pub fn supervisor(dir: &tempfile::TempDir) -> Arc<Supervisor> {
    let context = ProxyContext::new(Settings::default(), authority(dir), UpstreamTls::new(false).unwrap());
    Arc::new(Supervisor::new(Arc::new(context)))
}

pub fn definition(value: Value) -> ProxyDefinition {
    serde_json::from_value(value).unwrap()
}

/// A port nothing listens on
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo every connection back to itself; returns the port
pub async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}
