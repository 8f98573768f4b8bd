//! Synergy Proxy: protocol-aware intercepting proxy
//!
//! Each configured proxy listens on one endpoint and relays to one remote,
//! optionally terminating TLS with leaves minted by a local certificate
//! authority and decoding the traffic it carries.
//!
//! # Main Features
//!
//! - Raw TCP and HTTP(S) relays with per-host leaf certificates
//! - RPC over secure websockets with request/response correlation
//! - Password-keyed (SRP6) and JWT/ECDH game login handshakes
//! - Referral redirection through a local or delegated location resolver
//! - A management API to create, start, stop and watch proxies
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::path::Path;
//! use synergy_proxy::proxy::{ProxyContext, ProxyDefinition, Settings, Supervisor};
//! use synergy_proxy::tls::{CertificateAuthority, UpstreamTls};
//!
//! #[tokio::main]
//! async fn main() -> synergy_proxy::Result<()> {
//!     let authority = Arc::new(CertificateAuthority::open_path(Path::new("key_store.json"), "")?);
//!     let context = ProxyContext::new(Settings::default(), authority, UpstreamTls::new(false)?);
//!     let supervisor = Supervisor::new(Arc::new(context));
//!
//!     let definition: ProxyDefinition = serde_json::from_str(
//!         r#"{"type": "tcp", "id": "echo", "host": "127.0.0.1", "port": 7000, "remote_port": 7001}"#,
//!     )?;
//!     supervisor.add(definition)?;
//!     supervisor.start("echo")?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.stop_all().await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod admin;
pub mod common;
pub mod config;
pub mod handshake;
pub mod location;
pub mod protocol;
pub mod proxy;
pub mod tls;

// Re-export commonly used structures and functions for convenience
pub use common::{parse_socket_addr, ProxyError, Result};
pub use config::SynergyConfig;
pub use proxy::{ProxyDefinition, Supervisor};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
