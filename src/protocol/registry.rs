//! RPC service registry
//!
//! A static table from `(service_hash, method_id)` to the method's request and
//! response types. It is built once at startup from the built-in services and
//! optionally extended from a JSON schema file, so no lookup happens by
//! reflection while frames are flowing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::common::{fnv1a32, ProxyError, Result};

/// Response type names meaning "no response will follow"
const VOID_RESPONSES: [&str; 3] = ["NO_RESPONSE", "bgs.protocol.NO_RESPONSE", "bgs.protocol.NoData"];

/// A resolved RPC method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodDescriptor {
    pub service: String,
    pub service_hash: u32,
    pub id: u32,
    pub name: String,
    pub request_type: String,
    /// `None` when the method never answers
    pub response_type: Option<String>,
}

impl MethodDescriptor {
    pub fn has_response(&self) -> bool {
        self.response_type.is_some()
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.service, self.name)
    }
}

/// Schema entry for one method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSchema {
    pub id: u32,
    pub name: String,
    pub request: String,
    #[serde(default)]
    pub response: Option<String>,
}

/// Schema entry for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSchema {
    pub name: String,
    /// Overrides the FNV-1a hash of `name`
    #[serde(default)]
    pub hash: Option<u32>,
    pub methods: Vec<MethodSchema>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySchema {
    pub services: Vec<ServiceSchema>,
}

/// Static `(service_hash, method_id)` table
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    methods: HashMap<(u32, u32), Arc<MethodDescriptor>>,
    services: HashMap<u32, String>,
}

/// Hash used on the wire for a service name
pub fn service_hash(name: &str) -> u32 {
    fnv1a32(name.as_bytes())
}

impl ServiceRegistry {
    /// Registry holding only the built-in services
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for service in builtin_schema().services {
            registry.register(service);
        }
        registry
    }

    /// Built-in services plus the services of a JSON schema file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let schema: RegistrySchema = serde_json::from_str(&data)
            .map_err(|e| ProxyError::Config(format!("Invalid registry file {}: {}", path.display(), e)))?;

        let mut registry = Self::builtin();
        let count = schema.services.len();
        for service in schema.services {
            registry.register(service);
        }
        info!("Loaded {} services from {}", count, path.display());
        Ok(registry)
    }

    /// Add or replace every method of a service
    pub fn register(&mut self, service: ServiceSchema) {
        let hash = service.hash.unwrap_or_else(|| service_hash(&service.name));
        for method in service.methods {
            let response_type = method
                .response
                .filter(|name| !VOID_RESPONSES.contains(&name.as_str()));
            let descriptor = MethodDescriptor {
                service: service.name.clone(),
                service_hash: hash,
                id: method.id,
                name: method.name,
                request_type: method.request,
                response_type,
            };
            debug!("Registered {} as ({:#010x}, {})", descriptor.full_name(), hash, descriptor.id);
            self.methods.insert((hash, descriptor.id), Arc::new(descriptor));
        }
        self.services.insert(hash, service.name);
    }

    pub fn resolve(&self, service_hash: u32, method_id: u32) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(&(service_hash, method_id)).cloned()
    }

    pub fn service_name(&self, service_hash: u32) -> Option<&str> {
        self.services.get(&service_hash).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

fn method(id: u32, name: &str, request: &str, response: Option<&str>) -> MethodSchema {
    MethodSchema {
        id,
        name: name.to_string(),
        request: request.to_string(),
        response: response.map(str::to_string),
    }
}

fn service(name: &str, methods: Vec<MethodSchema>) -> ServiceSchema {
    ServiceSchema { name: name.to_string(), hash: None, methods }
}

/// Services the proxy understands without a schema file
pub fn builtin_schema() -> RegistrySchema {
    RegistrySchema {
        services: vec![
            service("bgs.protocol.connection.v1.ConnectionService", vec![
                method(1, "Connect", "bgs.protocol.connection.v1.ConnectRequest", Some("bgs.protocol.connection.v1.ConnectResponse")),
                method(2, "Bind", "bgs.protocol.connection.v1.BindRequest", Some("bgs.protocol.connection.v1.BindResponse")),
                method(3, "Echo", "bgs.protocol.connection.v1.EchoRequest", Some("bgs.protocol.connection.v1.EchoResponse")),
                method(4, "ForceDisconnect", "bgs.protocol.connection.v1.DisconnectNotification", Some("bgs.protocol.NO_RESPONSE")),
                method(5, "KeepAlive", "bgs.protocol.NoData", Some("bgs.protocol.NO_RESPONSE")),
                method(6, "Encrypt", "bgs.protocol.connection.v1.EncryptRequest", Some("bgs.protocol.NoData")),
                method(7, "RequestDisconnect", "bgs.protocol.connection.v1.DisconnectRequest", Some("bgs.protocol.NO_RESPONSE")),
            ]),
            service("bgs.protocol.authentication.v1.AuthenticationService", vec![
                method(1, "Logon", "bgs.protocol.authentication.v1.LogonRequest", Some("bgs.protocol.NoData")),
                method(2, "VerifyWebCredentials", "bgs.protocol.authentication.v1.VerifyWebCredentialsRequest", Some("bgs.protocol.NoData")),
                method(3, "GenerateWebCredentials", "bgs.protocol.authentication.v1.GenerateWebCredentialsRequest", Some("bgs.protocol.authentication.v1.GenerateWebCredentialsResponse")),
            ]),
            service("bgs.protocol.authentication.v1.AuthenticationListener", vec![
                method(5, "OnLogonComplete", "bgs.protocol.authentication.v1.LogonResult", Some("bgs.protocol.NO_RESPONSE")),
                method(10, "OnLogonUpdate", "bgs.protocol.authentication.v1.LogonUpdateRequest", Some("bgs.protocol.NO_RESPONSE")),
            ]),
            service("bgs.protocol.game_utilities.v2.client.GameUtilitiesService", vec![
                method(1, "ProcessTask", "bgs.protocol.game_utilities.v2.client.ProcessTaskRequest", Some("bgs.protocol.game_utilities.v2.client.ProcessTaskResponse")),
                method(2, "GetAllValuesForAttribute", "bgs.protocol.game_utilities.v2.client.GetAllValuesForAttributeRequest", Some("bgs.protocol.game_utilities.v2.client.GetAllValuesForAttributeResponse")),
            ]),
        ],
    }
}
