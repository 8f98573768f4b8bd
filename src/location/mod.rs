//! Destination resolution
//!
//! Each proxy carries a [`Location`] that decides where a connection really
//! goes. It may also rewrite a payload attached to the decision, which is how
//! key material reaches proxies spawned for referred connections.

mod delegated;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::Result;

pub use delegated::DelegatedLocation;

/// A possibly unresolved `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How a proxy finds the real destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Location {
    /// Keep the address and payload
    #[default]
    Passthrough,
    /// Ask a coordination service to stand up a proxy and hand it the payload
    #[serde(alias = "ipc")]
    Delegated(DelegatedLocation),
}

impl Location {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Location::Passthrough)
    }

    /// Decide the destination of `address`, possibly rewriting `payload`
    pub async fn resolve<T>(&self, address: Address, payload: T) -> Result<(Address, T)>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        match self {
            Location::Passthrough => Ok((address, payload)),
            Location::Delegated(delegated) => delegated.resolve(address, payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_passthrough_is_identity() {
        let address = Address::new("10.0.0.5", 1119);
        let (resolved, payload) = Location::Passthrough
            .resolve(address.clone(), json!({"k0": "AAE="}))
            .await
            .unwrap();
        assert_eq!(resolved, address);
        assert_eq!(payload, json!({"k0": "AAE="}));
    }

    #[test]
    fn test_location_json() {
        assert_eq!(serde_json::from_value::<Location>(json!({"kind": "passthrough"})).unwrap(), Location::Passthrough);

        let location: Location = serde_json::from_value(json!({
            "kind": "ipc",
            "url": "http://127.0.0.1:8080",
            "type": "pro",
        }))
        .unwrap();
        match location {
            Location::Delegated(delegated) => {
                assert_eq!(delegated.proxy_type, "pro");
                assert!(delegated.host.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new("example.com", 443).to_string(), "example.com:443");
        assert_eq!(Address::new("::1", 443).to_string(), "[::1]:443");
    }
}
