//! One configured proxy and its listener

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::common::{bind_listener, parse_socket_addr, ProxyError, Result};
use crate::handshake::SrpMaterial;
use crate::location::Address;
use super::context::{ProxyContext, Session};
use super::definition::ProxyDefinition;
use super::event::{EventKind, EventSink};
use super::{bgs, http, mcbe, pro, tcp};

/// State shared by the accept loop and its connections
struct Shared {
    definition: ProxyDefinition,
    remote: Address,
    context: Arc<ProxyContext>,
    events: EventSink,
    material: Arc<RwLock<SrpMaterial>>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Keeps the active connection gauge honest however a connection ends
struct ConnectionGuard;

impl ConnectionGuard {
    fn new() -> Self {
        gauge!("synergy_connections_active").increment(1.0);
        Self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        gauge!("synergy_connections_active").decrement(1.0);
    }
}

/// A proxy as reported by the management API
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    #[serde(flatten)]
    pub definition: ProxyDefinition,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<SocketAddr>,
}

pub struct ProxyInstance {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ProxyInstance {
    pub fn new(definition: ProxyDefinition, context: Arc<ProxyContext>, events: EventSink) -> Result<Self> {
        definition.validate()?;
        let remote = definition.remote()?;
        Ok(Self {
            shared: Arc::new(Shared {
                definition,
                remote,
                context,
                events,
                material: Arc::new(RwLock::new(SrpMaterial::default())),
            }),
            running: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        self.shared.definition.id()
    }

    pub fn definition(&self) -> &ProxyDefinition {
        &self.shared.definition
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|running| running.local_addr)
    }

    pub fn status(&self) -> ProxyStatus {
        let local_addr = self.local_addr();
        ProxyStatus { definition: self.shared.definition.clone(), running: local_addr.is_some(), local_addr }
    }

    /// Bind the listener and start accepting
    ///
    /// Binding happens before returning, so a bind failure leaves the proxy stopped.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut running = self.lock();
        if running.is_some() {
            return Err(ProxyError::AlreadyStarted(self.id().to_string()));
        }

        let listen = self.shared.definition.listen()?;
        let listener = bind_listener(parse_socket_addr(&listen.to_string())?)?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, shutdown_rx, Arc::clone(&self.shared)));
        *running = Some(Running { shutdown, task, local_addr });

        info!(
            "{} proxy {} listening on {}, forwarding to {}",
            self.shared.definition.kind(),
            self.id(),
            local_addr,
            self.shared.remote
        );
        self.shared.events.emit(EventKind::Started { listen: local_addr.to_string() });
        Ok(local_addr)
    }

    /// Stop accepting and drop every connection; false if not running
    pub async fn stop(&self) -> bool {
        let Some(running) = self.lock().take() else {
            return false;
        };
        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            error!("Accept loop of {} failed: {}", self.id(), e);
        }
        info!("Proxy {} stopped", self.id());
        self.shared.events.emit(EventKind::Stopped);
        true
    }

    /// Hand the proxy out-of-band data, returning what it took
    ///
    /// Login proxies take their SRP material; other types echo the body.
    pub fn update(&self, body: Value) -> Result<Value> {
        if !matches!(self.shared.definition, ProxyDefinition::Pro { .. }) {
            debug!("Proxy {} ignores updates", self.id());
            return Ok(body);
        }
        let material = SrpMaterial::from_update(body.clone())?;
        let effective = match body {
            Value::String(_) => body,
            _ => serde_json::to_value(&material)?,
        };
        *self
            .shared
            .material
            .write()
            .map_err(|_| ProxyError::Other("SRP material lock poisoned".to_string()))? = material;
        info!("Proxy {} received new SRP material", self.id());
        Ok(effective)
    }

    pub fn material(&self) -> SrpMaterial {
        self.shared
            .material
            .read()
            .map(|material| material.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

async fn accept_loop(listener: TcpListener, mut shutdown: oneshot::Receiver<()>, shared: Arc<Shared>) {
    let mut connections = JoinSet::new();
    loop {
        select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => error!("Error accepting connection on {}: {}", shared.definition.id(), e),
            },
            Some(result) = connections.join_next() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("Connection task of {} panicked: {}", shared.definition.id(), e);
                    }
                }
            }
        }
    }
    debug!("Dropping {} connections of {}", connections.len(), shared.definition.id());
    connections.shutdown().await;
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let kind = shared.definition.kind().as_str();
    counter!("synergy_connections_total", "type" => kind).increment(1);
    let _guard = ConnectionGuard::new();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Setting TCP_NODELAY for {}: {}", peer, e);
    }

    let endpoint = shared.definition.endpoint();
    let session = Session {
        label: format!("[{} {}]", endpoint.id, peer),
        peer,
        kind,
        remote: shared.remote.clone(),
        interface: endpoint.interface,
        location: endpoint.location.clone(),
        context: Arc::clone(&shared.context),
        events: shared.events.clone(),
    };
    debug!("{} accepted", session.label);

    let result = match &shared.definition {
        ProxyDefinition::Tcp { .. } => tcp::handle(stream, &session).await,
        ProxyDefinition::Http { ssl, .. } => http::handle(stream, &session, *ssl).await,
        ProxyDefinition::Bgs { .. } => bgs::handle(stream, &session).await,
        ProxyDefinition::Mcbe { .. } => mcbe::handle(stream, &session).await,
        ProxyDefinition::Pro { inject_replies, .. } => {
            pro::handle(stream, &session, &shared.material, *inject_replies).await
        }
    };

    let error = match result {
        Ok(()) => {
            debug!("{} closed", session.label);
            None
        }
        Err(e) => {
            if matches!(e, ProxyError::Handshake(_) | ProxyError::TlsHandshake(_) | ProxyError::Timeout(_)) {
                counter!("synergy_handshake_failures_total", "type" => kind).increment(1);
            }
            warn!("{} closed: {}", session.label, e);
            Some(e.to_string())
        }
    };
    shared.events.emit(EventKind::Disconnected { peer: peer.to_string(), error });
}
