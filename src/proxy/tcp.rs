//! Raw byte relay

use log::info;
use serde_json::Value;
use tokio::net::TcpStream;

use crate::common::Result;
use super::bridge::{byte_sink, byte_source, Bridge, Passthrough};
use super::context::Session;
use super::event::EventKind;

pub(crate) async fn handle(stream: TcpStream, session: &Session) -> Result<()> {
    let capacity = session.settings().buffer_size;
    let (reader, writer) = stream.into_split();

    let connect = async {
        let (upstream, target, _) = session.connect(Value::Null).await?;
        info!("{} relaying to {}", session.label, target);
        session.events.emit(EventKind::Connected { peer: session.peer.to_string(), target: target.to_string() });
        let (upstream_reader, upstream_writer) = upstream.into_split();
        Ok((byte_source(upstream_reader, capacity), byte_sink(upstream_writer)))
    };

    Bridge::new(session.label.as_str(), Passthrough, Passthrough)
        .run(byte_source(reader, capacity), byte_sink(writer), connect)
        .await
}
