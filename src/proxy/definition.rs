//! Proxy definitions
//!
//! The serialized form of a proxy, as accepted by the management API and
//! stored in the proxies file. The variant is chosen by a `type` tag.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{ProxyError, Result};
use crate::location::{Address, Location};

pub const BGS_PORT: u16 = 1119;
pub const MCBE_PORT: u16 = 19132;
pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

/// Attributes shared by every proxy type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default = "new_id")]
    pub id: String,
    /// Listen host
    pub host: String,
    /// Listen port; each type has its own default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Upstream host, the listen host when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Local address to connect upstream from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Location::is_passthrough")]
    pub location: Location,
}

/// Protocol handled by a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Tcp,
    Http,
    Bgs,
    Mcbe,
    Pro,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Tcp => "tcp",
            ProxyKind::Http => "http",
            ProxyKind::Bgs => "bgs",
            ProxyKind::Mcbe => "mcbe",
            ProxyKind::Pro => "pro",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProxyKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_ascii_lowercase()))
            .map_err(|_| ProxyError::Config(format!("Unknown proxy type {}", s)))
    }
}

/// A proxy of one of the supported types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyDefinition {
    /// Raw byte relay
    Tcp {
        #[serde(flatten)]
        endpoint: Endpoint,
    },
    /// HTTP, intercepted over TLS unless `ssl` is off
    Http {
        #[serde(flatten)]
        endpoint: Endpoint,
        #[serde(default = "default_true")]
        ssl: bool,
    },
    /// RPC over secure websockets
    Bgs {
        #[serde(flatten)]
        endpoint: Endpoint,
    },
    /// Game network with its login handshake
    Mcbe {
        #[serde(flatten)]
        endpoint: Endpoint,
    },
    /// Password-keyed login
    Pro {
        #[serde(flatten)]
        endpoint: Endpoint,
        /// Send the computed handshake replies to the client
        #[serde(default)]
        inject_replies: bool,
    },
}

impl ProxyDefinition {
    /// Parse a definition whose type comes from elsewhere, such as a URL path
    pub fn from_typed_json(kind: ProxyKind, body: Value) -> Result<Self> {
        let Value::Object(mut object) = body else {
            return Err(ProxyError::Config("proxy definition must be an object".to_string()));
        };
        object.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        serde_json::from_value(Value::Object(object))
            .map_err(|e| ProxyError::Config(format!("Invalid {} proxy: {}", kind, e)))
    }

    pub fn kind(&self) -> ProxyKind {
        match self {
            ProxyDefinition::Tcp { .. } => ProxyKind::Tcp,
            ProxyDefinition::Http { .. } => ProxyKind::Http,
            ProxyDefinition::Bgs { .. } => ProxyKind::Bgs,
            ProxyDefinition::Mcbe { .. } => ProxyKind::Mcbe,
            ProxyDefinition::Pro { .. } => ProxyKind::Pro,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            ProxyDefinition::Tcp { endpoint }
            | ProxyDefinition::Http { endpoint, .. }
            | ProxyDefinition::Bgs { endpoint }
            | ProxyDefinition::Mcbe { endpoint }
            | ProxyDefinition::Pro { endpoint, .. } => endpoint,
        }
    }

    pub fn id(&self) -> &str {
        &self.endpoint().id
    }

    fn default_port(&self) -> Option<u16> {
        match self {
            ProxyDefinition::Tcp { .. } | ProxyDefinition::Pro { .. } => None,
            ProxyDefinition::Http { ssl: true, .. } => Some(HTTPS_PORT),
            ProxyDefinition::Http { ssl: false, .. } => Some(HTTP_PORT),
            ProxyDefinition::Bgs { .. } => Some(BGS_PORT),
            ProxyDefinition::Mcbe { .. } => Some(MCBE_PORT),
        }
    }

    /// Address the proxy listens on
    pub fn listen(&self) -> Result<Address> {
        let endpoint = self.endpoint();
        let port = endpoint
            .port
            .or_else(|| self.default_port())
            .ok_or_else(|| ProxyError::Config(format!("Proxy {} has no port", endpoint.id)))?;
        Ok(Address::new(endpoint.host.clone(), port))
    }

    /// Upstream address before location resolution
    pub fn remote(&self) -> Result<Address> {
        let listen = self.listen()?;
        let endpoint = self.endpoint();
        Ok(Address::new(
            endpoint.remote_host.clone().unwrap_or(listen.host),
            endpoint.remote_port.unwrap_or(listen.port),
        ))
    }

    /// Check what can be checked before binding
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.endpoint();
        if endpoint.id.trim().is_empty() {
            return Err(ProxyError::Config("proxy id must not be empty".to_string()));
        }
        if endpoint.host.trim().is_empty() {
            return Err(ProxyError::Config(format!("Proxy {} has no host", endpoint.id)));
        }
        self.listen().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_per_type() {
        let bgs: ProxyDefinition = serde_json::from_value(json!({"type": "bgs", "host": "127.0.0.2"})).unwrap();
        assert_eq!(bgs.kind(), ProxyKind::Bgs);
        assert_eq!(bgs.listen().unwrap(), Address::new("127.0.0.2", BGS_PORT));
        assert_eq!(bgs.remote().unwrap(), Address::new("127.0.0.2", BGS_PORT));
        assert_eq!(bgs.id().len(), 36);

        let http: ProxyDefinition = serde_json::from_value(json!({"type": "http", "host": "h"})).unwrap();
        assert!(matches!(http, ProxyDefinition::Http { ssl: true, .. }));
        assert_eq!(http.listen().unwrap().port, HTTPS_PORT);

        let tcp: ProxyDefinition = serde_json::from_value(json!({"type": "tcp", "id": "t", "host": "h"})).unwrap();
        assert!(matches!(tcp.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_remote_overrides() {
        let definition: ProxyDefinition = serde_json::from_value(json!({
            "type": "pro",
            "id": "pro-1",
            "host": "127.0.0.1",
            "port": 4000,
            "remote_host": "10.0.0.7",
            "interface": "127.0.0.1",
            "inject_replies": true,
        }))
        .unwrap();
        assert_eq!(definition.remote().unwrap(), Address::new("10.0.0.7", 4000));
        assert_eq!(definition.endpoint().interface, Some("127.0.0.1".parse().unwrap()));
        assert!(matches!(definition, ProxyDefinition::Pro { inject_replies: true, .. }));
    }

    #[test]
    fn test_type_from_path() {
        let definition = ProxyDefinition::from_typed_json(
            "TCP".parse().unwrap(),
            json!({"id": "0a1b2c3d", "host": "10.0.0.5", "port": 1119}),
        )
        .unwrap();
        assert_eq!(definition.kind(), ProxyKind::Tcp);
        assert_eq!(definition.id(), "0a1b2c3d");
        assert!("ftp".parse::<ProxyKind>().is_err());
    }

    #[test]
    fn test_serialized_form_is_stable() {
        let definition: ProxyDefinition =
            serde_json::from_value(json!({"type": "mcbe", "id": "m", "host": "0.0.0.0"})).unwrap();
        assert_eq!(
            serde_json::to_value(&definition).unwrap(),
            json!({"type": "mcbe", "id": "m", "host": "0.0.0.0"})
        );
    }
}
