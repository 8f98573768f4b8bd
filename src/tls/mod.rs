//! TLS termination and origination
//!
//! [`authority`] issues the certificates presented to clients, [`keystore`]
//! persists them, and [`acceptor`] and [`connector`] run the two handshakes
//! of an intercepted connection.

pub mod acceptor;
pub mod authority;
pub mod connector;
pub mod keystore;

pub use acceptor::{accept, peek_server_name};
pub use authority::{CertificateAuthority, LeafCertificate};
pub use connector::UpstreamTls;
pub use keystore::{KeyEntry, KeyStore};
