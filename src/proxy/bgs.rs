//! RPC over secure websockets
//!
//! The client is terminated with a leaf from the local authority and the
//! upstream is dialled as a websocket client. Every binary message carries
//! exactly one packet. Each socket keeps its own correlation table, shared by
//! the codec that writes to it and the codec that reads from it.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::ready;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::common::{net, ProxyError, Result};
use crate::location::{Address, Location};
use crate::protocol::messages::{ProcessTaskResponse, Variant, PROCESS_TASK_RESPONSE};
use crate::protocol::{BgsCodec, BgsPacket, PayloadMode, PendingResponses, ServiceRegistry};
use crate::tls::{accept, peek_server_name};
use super::bridge::{Bridge, Interceptor};
use super::context::Session;
use super::event::{Direction, EventKind, EventSink};

/// Websocket subprotocol of the RPC transport
pub const SUBPROTOCOL: &str = "v1.rpc.battle.net";

const RESPONSE_TYPE: &str = "response_type";
const REFERRAL_INFO: &str = "ReferralInfo";
const HOST_V4: &str = "hostv4";

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == SUBPROTOCOL)
}

/// Packets carried by binary messages
fn packet_source<S>(messages: S, mut codec: BgsCodec) -> impl Stream<Item = Result<BgsPacket>> + Unpin + Send
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send,
{
    messages.filter_map(move |message| {
        let packet = match message {
            Ok(Message::Binary(data)) => codec.decode_message(&data).transpose(),
            Ok(other) => {
                trace!("Skipping {} byte control or text message", other.len());
                None
            }
            Err(e) => Some(Err(ProxyError::from(e))),
        };
        ready(packet)
    })
}

fn packet_sink<K>(messages: K, mut codec: BgsCodec) -> impl Sink<BgsPacket, Error = ProxyError> + Unpin + Send
where
    K: Sink<Message, Error = WsError> + Unpin + Send,
{
    messages
        .sink_map_err(ProxyError::from)
        .with(move |packet: BgsPacket| ready(codec.encode_message(packet).map(|data| Message::Binary(data.to_vec()))))
}

/// Codecs for both halves of one socket, sharing its correlation table
fn socket_codecs(registry: &Arc<ServiceRegistry>) -> (BgsCodec, BgsCodec) {
    let pending = PendingResponses::new();
    (
        BgsCodec::with_pending(Arc::clone(registry), PayloadMode::Remaining, pending.clone()),
        BgsCodec::with_pending(Arc::clone(registry), PayloadMode::Remaining, pending),
    )
}

fn split_socket<S>(
    socket: WebSocketStream<S>,
    registry: &Arc<ServiceRegistry>,
) -> (impl Stream<Item = Result<BgsPacket>> + Unpin + Send, impl Sink<BgsPacket, Error = ProxyError> + Unpin + Send)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_codec, write_codec) = socket_codecs(registry);
    let (sink, source) = socket.split();
    (packet_source(source, read_codec), packet_sink(sink, write_codec))
}

/// Logs every packet and, towards the client, redirects referrals
struct Observer {
    direction: Direction,
    registry: Arc<ServiceRegistry>,
    events: EventSink,
    referral: Option<Location>,
}

impl Observer {
    fn record(&self, packet: &BgsPacket) {
        let header = &packet.header;
        let method = header
            .service_hash
            .and_then(|hash| self.registry.resolve(hash, header.method_id));
        debug!("{:?} {}", self.direction, packet);
        self.events.emit(EventKind::Packet {
            direction: self.direction,
            service_id: header.service_id,
            service_hash: header.service_hash,
            service: header.service_hash.and_then(|hash| self.registry.service_name(hash)).map(str::to_string),
            method_id: header.method_id,
            method: method.map(|method| method.name.clone()),
            token: header.token,
            type_name: packet.payload.type_name().map(str::to_string),
            size: packet.payload.bytes().len(),
        });
    }

    async fn redirect(&self, location: &Location, mut packet: BgsPacket) -> Result<BgsPacket> {
        if packet.payload.type_name() != Some(PROCESS_TASK_RESPONSE) {
            return Ok(packet);
        }
        let response = ProcessTaskResponse::decode(packet.payload.bytes())?;
        if response.get(RESPONSE_TYPE).and_then(Variant::as_str) != Some(REFERRAL_INFO) {
            return Ok(packet);
        }
        let Some(host) = response.get(HOST_V4).and_then(Variant::as_str) else {
            return Ok(packet);
        };

        let from = Address::new(host, 0);
        let (to, data) = location
            .resolve(from.clone(), STANDARD.encode(packet.payload.bytes()))
            .await?;
        let data = STANDARD
            .decode(data)
            .map_err(|e| ProxyError::Location(format!("referral payload is not base64: {}", e)))?;
        let mut rewritten = ProcessTaskResponse::decode(&data)?;
        let ip = net::resolve(&to.host, to.port).await?.ip();
        rewritten.set(HOST_V4, Variant::String(ip.to_string()));

        info!("Referral to {} redirected to {}", from.host, ip);
        self.events.emit(EventKind::Referral { from: from.host, to: ip.to_string() });
        packet.payload = crate::protocol::Payload::Typed {
            type_name: PROCESS_TASK_RESPONSE.to_string(),
            bytes: rewritten.encode(),
        };
        Ok(packet)
    }
}

impl Interceptor<BgsPacket, BgsPacket> for Observer {
    async fn intercept(&mut self, packet: BgsPacket) -> Result<Vec<BgsPacket>> {
        self.record(&packet);
        let packet = match &self.referral {
            Some(location) => self.redirect(location, packet).await?,
            None => packet,
        };
        Ok(vec![packet])
    }
}

pub(crate) async fn handle(stream: TcpStream, session: &Session) -> Result<()> {
    let registry = &session.context.registry;
    let host = peek_server_name(&stream, session.settings().handshake_timeout)
        .await?
        .unwrap_or_else(|| session.remote.host.clone());
    let leaf = session.context.authority.leaf_for(&host).await?;
    let tls = accept(&leaf.acceptor, stream).await?;

    let client = tokio_tungstenite::accept_hdr_async(tls, |request: &Request, mut response: Response| {
        if offers_subprotocol(request) {
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok::<Response, ErrorResponse>(response)
    })
    .await?;
    debug!("{} websocket established with client", session.label);
    let (client_source, client_sink) = split_socket(client, registry);

    let connect = async {
        let upstream = session.connect_to(&session.remote).await?;
        let upstream = session.context.upstream_tls.connect(&session.remote.host, upstream).await?;
        let mut request = format!("wss://{}/", session.remote).into_client_request()?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        let (socket, _) = tokio_tungstenite::client_async(request, upstream).await?;
        info!("{} relaying RPC to {}", session.label, session.remote);
        session.events.emit(EventKind::Connected {
            peer: session.peer.to_string(),
            target: session.remote.to_string(),
        });
        Ok(split_socket(socket, registry))
    };

    let outbound = Observer {
        direction: Direction::Serverbound,
        registry: Arc::clone(registry),
        events: session.events.clone(),
        referral: None,
    };
    let inbound = Observer {
        direction: Direction::Clientbound,
        registry: Arc::clone(registry),
        events: session.events.clone(),
        referral: (!session.location.is_passthrough()).then(|| session.location.clone()),
    };
    Bridge::new(session.label.as_str(), outbound, inbound)
        .run(client_source, client_sink, connect)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::Header;
    use crate::protocol::messages::Attribute;
    use crate::protocol::registry::service_hash;
    use crate::protocol::Payload;
    use tokio::sync::broadcast;

    const UTILITIES: &str = "bgs.protocol.game_utilities.v2.client.GameUtilitiesService";

    fn observer(referral: Option<Location>) -> (Observer, broadcast::Receiver<crate::proxy::ProxyEvent>) {
        let (tx, rx) = broadcast::channel(8);
        let observer = Observer {
            direction: Direction::Clientbound,
            registry: Arc::new(ServiceRegistry::builtin()),
            events: EventSink::new("bgs", tx),
            referral,
        };
        (observer, rx)
    }

    fn referral_response() -> BgsPacket {
        let body = ProcessTaskResponse {
            result: vec![
                Attribute::new(RESPONSE_TYPE, Variant::String(REFERRAL_INFO.to_string())),
                Attribute::new(HOST_V4, Variant::String("10.0.0.5".to_string())),
            ],
        };
        BgsPacket {
            header: Header::response(3),
            payload: Payload::Typed { type_name: PROCESS_TASK_RESPONSE.to_string(), bytes: body.encode() },
        }
    }

    #[tokio::test]
    async fn test_packet_is_recorded() {
        let (mut observer, mut events) = observer(None);
        let packet = BgsPacket {
            header: Header::request(service_hash(UTILITIES), 1, 9),
            payload: Payload::Raw(bytes::Bytes::from_static(b"\x08\x01")),
        };
        let out = observer.intercept(packet.clone()).await.unwrap();
        assert_eq!(out, vec![packet]);

        let event = events.recv().await.unwrap();
        match event.kind {
            EventKind::Packet { token, method, service, .. } => {
                assert_eq!(token, 9);
                assert_eq!(method.as_deref(), Some("ProcessTask"));
                assert_eq!(service.as_deref(), Some(UTILITIES));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_passthrough_referral_is_untouched() {
        let (observer, _events) = observer(None);
        let packet = referral_response();
        let out = observer.redirect(&Location::Passthrough, packet.clone()).await.unwrap();
        assert_eq!(out, packet);
    }

    #[test]
    fn test_subprotocol_offer() {
        let request = Request::builder()
            .uri("wss://example.com/")
            .header(SEC_WEBSOCKET_PROTOCOL, "json, v1.rpc.battle.net")
            .body(())
            .unwrap();
        assert!(offers_subprotocol(&request));

        let request = Request::builder().uri("wss://example.com/").body(()).unwrap();
        assert!(!offers_subprotocol(&request));
    }
}
