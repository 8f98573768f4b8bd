//! Upstream-facing TLS

use log::{debug, warn};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};

/// Connector for the proxy's own connections to real backends
pub struct UpstreamTls {
    connector: SslConnector,
    verify: bool,
}

impl UpstreamTls {
    /// Without `verify` any certificate is accepted, matching clients that pin nothing
    pub fn new(verify: bool) -> Result<Self> {
        Self::with_roots(verify, &[])
    }

    /// Trust `roots` in addition to the system store
    pub fn with_roots(verify: bool, roots: &[X509]) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        for root in roots {
            builder.cert_store_mut().add_cert(root.clone())?;
        }
        if verify {
            builder.set_verify(SslVerifyMode::PEER);
        } else {
            warn!("Upstream certificates are not verified");
            builder.set_verify(SslVerifyMode::NONE);
        }
        Ok(Self { connector: builder.build(), verify })
    }

    pub fn verifies(&self) -> bool {
        self.verify
    }

    /// Handshake as a client of `host` over `stream`
    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<SslStream<TcpStream>> {
        let mut config = self.connector.configure()?;
        config.set_verify_hostname(self.verify);
        let ssl = config.into_ssl(host)?;
        let mut stream = SslStream::new(ssl, stream)?;
        std::pin::Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| ProxyError::TlsHandshake(format!("{}: {}", host, e)))?;
        debug!("TLS handshake with {} complete", host);
        Ok(stream)
    }
}
