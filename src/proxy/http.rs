//! HTTP proxy
//!
//! With TLS on, the client is served a leaf for the name in its ClientHello
//! and the proxy opens its own TLS connection upstream. Request and response
//! bytes are relayed unmodified between the two sessions.

use log::{debug, info};
use serde_json::Value;
use tokio::net::TcpStream;

use crate::common::Result;
use crate::tls::{accept, peek_server_name};
use super::bridge::{byte_sink, byte_source, Bridge, Passthrough};
use super::context::Session;
use super::event::EventKind;
use super::tcp;

pub(crate) async fn handle(stream: TcpStream, session: &Session, ssl: bool) -> Result<()> {
    if !ssl {
        return tcp::handle(stream, session).await;
    }

    let capacity = session.settings().buffer_size;
    let host = match peek_server_name(&stream, session.settings().handshake_timeout).await? {
        Some(name) => name,
        None => {
            debug!("{} sent no server name, using {}", session.label, session.remote.host);
            session.remote.host.clone()
        }
    };
    let leaf = session.context.authority.leaf_for(&host).await?;
    let client = accept(&leaf.acceptor, stream).await?;
    let (reader, writer) = tokio::io::split(client);

    let connect = async {
        let (upstream, target, _) = session.connect(Value::Null).await?;
        let upstream = session.context.upstream_tls.connect(&host, upstream).await?;
        info!("{} intercepting {} via {}", session.label, host, target);
        session.events.emit(EventKind::Connected { peer: session.peer.to_string(), target: format!("{} ({})", host, target) });
        let (upstream_reader, upstream_writer) = tokio::io::split(upstream);
        Ok((byte_source(upstream_reader, capacity), byte_sink(upstream_writer)))
    };

    Bridge::new(session.label.as_str(), Passthrough, Passthrough)
        .run(byte_source(reader, capacity), byte_sink(writer), connect)
        .await
}
