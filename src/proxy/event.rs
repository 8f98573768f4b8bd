//! Proxy events
//!
//! Everything a proxy observes is published on a broadcast channel owned by
//! the supervisor. The management API streams it to subscribers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::trace;
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers skip ahead
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server
    Serverbound,
    /// Server to client
    Clientbound,
}

fn base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Started {
        listen: String,
    },
    Stopped,
    Connected {
        peer: String,
        target: String,
    },
    Disconnected {
        peer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// One RPC message
    Packet {
        direction: Direction,
        service_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_hash: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        method_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        token: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        type_name: Option<String>,
        size: usize,
    },
    /// A login handshake advanced
    Handshake {
        peer: String,
        phase: String,
    },
    /// Bytes the proxy computed as a handshake reply
    Reply {
        peer: String,
        #[serde(serialize_with = "base64")]
        bytes: Vec<u8>,
        injected: bool,
    },
    Authenticated {
        peer: String,
        authenticated: bool,
    },
    /// A referral was pointed at another address
    Referral {
        from: String,
        to: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyEvent {
    pub proxy: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Publisher bound to one proxy id
#[derive(Debug, Clone)]
pub struct EventSink {
    proxy: String,
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventSink {
    pub fn new(proxy: impl Into<String>, tx: broadcast::Sender<ProxyEvent>) -> Self {
        Self { proxy: proxy.into(), tx }
    }

    pub fn emit(&self, kind: EventKind) {
        let event = ProxyEvent { proxy: self.proxy.clone(), timestamp: Utc::now(), kind };
        // no subscribers is not an error
        if self.tx.send(event).is_err() {
            trace!("No subscribers for events of {}", self.proxy);
        }
    }
}
