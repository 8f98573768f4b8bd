use log::{debug, info};
use once_cell::sync::Lazy;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::{fnv1a32, ProxyError, Result};
use super::Address;

static CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Location served by another instance's management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedLocation {
    /// Base URL of the coordination service
    pub url: String,
    /// Proxy type to create there
    #[serde(rename = "type")]
    pub proxy_type: String,
    /// Fixed destination host, replacing the connection's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Egress address for the delegated proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

/// Body of the create request
#[derive(Debug, Serialize)]
struct CreateProxy<'a> {
    id: &'a str,
    host: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    interface: Option<&'a str>,
}

/// Stable id of the proxy created for `address`
pub(crate) fn delegated_id(address: &Address) -> String {
    format!("{:08x}", fnv1a32(address.to_string().as_bytes()))
}

impl DelegatedLocation {
    fn base(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub(super) async fn resolve<T>(&self, address: Address, payload: T) -> Result<(Address, T)>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let id = delegated_id(&address);
        let body = CreateProxy {
            id: &id,
            host: self.host.as_deref().unwrap_or(&address.host),
            port: self.port.unwrap_or(address.port),
            interface: self.via.as_deref(),
        };

        let created = CLIENT
            .post(format!("{}/proxy/{}", self.base(), self.proxy_type))
            .query(&[("autoStart", "true")])
            .json(&body)
            .send()
            .await?;
        match created.status() {
            status if status.is_success() => info!("Delegated proxy {} created for {}", id, address),
            // already exists
            StatusCode::BAD_REQUEST => debug!("Delegated proxy {} already exists", id),
            status => {
                return Err(ProxyError::Location(format!("creating proxy {} returned {}", id, status)));
            }
        }

        let updated = CLIENT
            .post(format!("{}/proxy/{}/update", self.base(), id))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let payload = updated.json::<T>().await?;

        let address = match (&self.host, self.port) {
            (Some(host), Some(port)) => Address::new(host.clone(), port),
            _ => address,
        };
        Ok((address, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_stable_hex() {
        let id = delegated_id(&Address::new("10.0.0.5", 1119));
        assert_eq!(id.len(), 8);
        assert_eq!(id, delegated_id(&Address::new("10.0.0.5", 1119)));
        assert_ne!(id, delegated_id(&Address::new("10.0.0.5", 1120)));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_location_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let location = DelegatedLocation {
            url,
            proxy_type: "pro".to_string(),
            host: None,
            port: None,
            via: None,
        };
        let result = location.resolve(Address::new("10.0.0.5", 1119), serde_json::Value::Null).await;
        assert!(matches!(result, Err(ProxyError::Location(_))));
    }
}
