//! Password-keyed login proxy
//!
//! Client bytes are forwarded upstream untouched while a copy drives a
//! [`ProSession`], which plays the server side of the handshake with the
//! material the proxy was given. The replies it computes are reported as
//! events and, with `inject_replies`, also written to the client.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::ready;
use futures::{stream, Stream, StreamExt};
use log::{debug, info};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::common::{ProxyError, Result};
use crate::handshake::{ProOutput, ProPhase, ProSession, SrpMaterial};
use super::bridge::{byte_sink, byte_source, Bridge, Interceptor, Passthrough};
use super::context::Session;
use super::event::{EventKind, EventSink};
use super::{blocking, handshake_deadline};

struct ClientSide {
    /// Out only while a chunk is being fed on the blocking pool
    session: Option<ProSession>,
    replies: Option<mpsc::UnboundedSender<Bytes>>,
    phase: watch::Sender<ProPhase>,
    peer: String,
    events: EventSink,
}

impl ClientSide {
    fn act(&mut self, output: ProOutput) {
        match output {
            ProOutput::Reply(bytes) => {
                let injected = match &self.replies {
                    Some(replies) => replies.unbounded_send(bytes.clone()).is_ok(),
                    None => false,
                };
                debug!("{} computed a {} byte reply (injected: {})", self.peer, bytes.len(), injected);
                self.events.emit(EventKind::Reply { peer: self.peer.clone(), bytes: bytes.to_vec(), injected });
            }
            ProOutput::Phase(phase) => {
                self.phase.send_replace(phase);
                self.events.emit(EventKind::Handshake { peer: self.peer.clone(), phase: format!("{:?}", phase) });
            }
            ProOutput::Authenticated(authenticated) => {
                self.events.emit(EventKind::Authenticated { peer: self.peer.clone(), authenticated });
            }
        }
    }
}

impl Interceptor<Bytes, Bytes> for ClientSide {
    async fn intercept(&mut self, chunk: Bytes) -> Result<Vec<Bytes>> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| ProxyError::Handshake("login session ended by an earlier error".to_string()))?;
        let data = chunk.clone();
        // SRP arithmetic stays off the I/O worker
        let (session, outputs) = blocking(move || {
            let outputs = session.feed(&data)?;
            Ok((session, outputs))
        })
        .await?;
        self.session = Some(session);
        for output in outputs {
            self.act(output);
        }
        Ok(vec![chunk])
    }
}

enum Inbound {
    Upstream(Result<Bytes>),
    Reply(Bytes),
    Closed,
}

/// Upstream bytes interleaved with injected replies, ending with the upstream
fn with_replies<S>(upstream: S, replies: mpsc::UnboundedReceiver<Bytes>) -> impl Stream<Item = Result<Bytes>> + Unpin + Send
where
    S: Stream<Item = Result<Bytes>> + Unpin + Send,
{
    stream::select(
        upstream.map(Inbound::Upstream).chain(stream::once(ready(Inbound::Closed))),
        replies.map(Inbound::Reply),
    )
    .take_while(|item| ready(!matches!(item, Inbound::Closed)))
    .filter_map(|item| {
        ready(match item {
            Inbound::Upstream(chunk) => Some(chunk),
            Inbound::Reply(bytes) => Some(Ok(bytes)),
            Inbound::Closed => None,
        })
    })
}

pub(crate) async fn handle(
    stream: TcpStream,
    session: &Session,
    material: &Arc<RwLock<SrpMaterial>>,
    inject_replies: bool,
) -> Result<()> {
    let material = material
        .read()
        .map_err(|_| ProxyError::Other("SRP material lock poisoned".to_string()))?
        .clone();
    // a missing modulus means generating a prime
    let pro = blocking(move || ProSession::new(material)).await?;

    let capacity = session.settings().buffer_size;
    let (reader, writer) = stream.into_split();
    let (replies_tx, replies_rx) = mpsc::unbounded();
    let (phase, phase_rx) = watch::channel(ProPhase::Handshake);

    let outbound = ClientSide {
        session: Some(pro),
        replies: inject_replies.then_some(replies_tx),
        phase,
        peer: session.peer.to_string(),
        events: session.events.clone(),
    };

    let connect = async move {
        let (upstream, target, _) = session.connect(Value::Null).await?;
        info!("{} relaying login to {}", session.label, target);
        session.events.emit(EventKind::Connected { peer: session.peer.to_string(), target: target.to_string() });
        let (upstream_reader, upstream_writer) = upstream.into_split();
        Ok((with_replies(byte_source(upstream_reader, capacity), replies_rx), byte_sink(upstream_writer)))
    };

    let bridge = Bridge::new(session.label.as_str(), outbound, Passthrough).run(
        byte_source(reader, capacity),
        byte_sink(writer),
        connect,
    );
    tokio::select! {
        result = bridge => result,
        error = handshake_deadline(phase_rx, ProPhase::Encrypted, session.settings().handshake_timeout) => Err(error),
    }
}
