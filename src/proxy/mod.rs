//! Proxy layer
//!
//! A [`Supervisor`] holds [`ProxyInstance`]s built from [`ProxyDefinition`]s.
//! Each instance runs an accept loop and hands every connection to the
//! handler of its type, which wires the two legs together with a [`Bridge`].

pub mod bridge;
pub mod context;
pub mod definition;
pub mod event;
pub mod instance;
pub mod supervisor;

mod bgs;
mod http;
mod mcbe;
mod pro;
mod tcp;

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::common::{ProxyError, Result};

pub use bgs::SUBPROTOCOL;
pub use bridge::{byte_sink, byte_source, Bridge, Interceptor, Leg, Passthrough};
pub use context::{ProxyContext, Settings};
pub use definition::{Endpoint, ProxyDefinition, ProxyKind};
pub use event::{Direction, EventKind, EventSink, ProxyEvent};
pub use instance::{ProxyInstance, ProxyStatus};
pub use supervisor::Supervisor;

/// Resolves with an error if `phase` has not reached `done` within `limit`
///
/// Never resolves otherwise, so it can race a connection in `select!`.
pub(crate) async fn handshake_deadline<P>(mut phase: watch::Receiver<P>, done: P, limit: Duration) -> ProxyError
where
    P: PartialEq + Send + Sync,
{
    let reached = timeout(limit, phase.wait_for(|current| *current == done))
        .await
        .map(|changed| changed.is_ok());
    if reached.is_err() {
        return ProxyError::Timeout(format!("login handshake not finished within {:?}", limit));
    }
    std::future::pending().await
}

/// Run CPU-bound handshake work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ProxyError::Other(format!("handshake task failed: {}", e)))?
}
