//! Shared state handed to every proxy and connection

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;

use crate::common::{net, Result};
use crate::config::SynergyConfig;
use crate::handshake::BlockPalette;
use crate::location::{Address, Location};
use crate::protocol::ServiceRegistry;
use crate::tls::{CertificateAuthority, UpstreamTls};
use super::event::EventSink;

/// Per-connection limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
}

impl Settings {
    pub fn from_config(config: &SynergyConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            buffer_size: config.buffer_size,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&SynergyConfig::default())
    }
}

/// Process-wide services
pub struct ProxyContext {
    pub settings: Settings,
    pub authority: Arc<CertificateAuthority>,
    pub upstream_tls: Arc<UpstreamTls>,
    pub registry: Arc<ServiceRegistry>,
    pub palette: Arc<BlockPalette>,
}

impl ProxyContext {
    pub fn new(settings: Settings, authority: Arc<CertificateAuthority>, upstream_tls: UpstreamTls) -> Self {
        Self {
            settings,
            authority,
            upstream_tls: Arc::new(upstream_tls),
            registry: Arc::new(ServiceRegistry::builtin()),
            palette: Arc::new(BlockPalette::default()),
        }
    }

    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_palette(mut self, palette: BlockPalette) -> Self {
        self.palette = Arc::new(palette);
        self
    }
}

/// One accepted client connection
pub(crate) struct Session {
    pub label: String,
    pub peer: SocketAddr,
    pub kind: &'static str,
    pub remote: Address,
    pub interface: Option<IpAddr>,
    pub location: Location,
    pub context: Arc<ProxyContext>,
    pub events: EventSink,
}

impl Session {
    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    /// Open a TCP connection to `address` from the configured interface
    pub async fn connect_to(&self, address: &Address) -> Result<TcpStream> {
        let result = async {
            let target = net::resolve(&address.host, address.port).await?;
            net::connect(target, self.interface, self.settings().connect_timeout).await
        }
        .await;
        match &result {
            Ok(_) => debug!("{} connected to {}", self.label, address),
            Err(e) => {
                counter!("synergy_connect_failures_total", "type" => self.kind).increment(1);
                warn!("{} failed to connect to {}: {}", self.label, address, e);
            }
        }
        result
    }

    /// Resolve the destination through the location, then connect to it
    pub async fn connect<T>(&self, payload: T) -> Result<(TcpStream, Address, T)>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let (target, payload) = self.location.resolve(self.remote.clone(), payload).await?;
        let stream = self.connect_to(&target).await?;
        Ok((stream, target, payload))
    }
}
