//! Certificate authority
//!
//! Holds a self-signed root and issues one leaf per hostname. Leaves are
//! cached in memory and persisted in the [`KeyStore`], so a host keeps its
//! certificate across restarts and repeated requests return the same DER.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use openssl::asn1::{Asn1Integer, Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509Req, X509ReqBuilder, X509};
use tokio::sync::OnceCell;

use crate::common::{ProxyError, Result};
use super::keystore::{KeyEntry, KeyStore};

/// Alias of the root entry in the key store
pub const ROOT_ALIAS: &str = "root";
/// Prefix of leaf aliases, keeping hostnames out of the root's namespace
const LEAF_ALIAS_PREFIX: &str = "host:";

const ROOT_COMMON_NAME: &str = "Synergy";
const KEY_BITS: u32 = 2048;
const VALIDITY_DAYS: u32 = 365;
const ROOT_VALIDITY_DAYS: u32 = 3650;

/// A leaf certificate ready to serve
pub struct LeafCertificate {
    pub host: String,
    pub cert: X509,
    pub key: PKey<Private>,
    /// `[leaf, root]`
    pub chain: Vec<X509>,
    pub acceptor: SslAcceptor,
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate").field("host", &self.host).finish()
    }
}

/// Root certificate and the leaves issued from it
pub struct CertificateAuthority {
    root_cert: X509,
    root_key: PKey<Private>,
    store: Mutex<KeyStore>,
    leaves: Mutex<HashMap<String, Arc<OnceCell<Arc<LeafCertificate>>>>>,
}

fn random_serial() -> Result<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

/// Validity of `days`, never extending past `limit`
fn validity(builder: &mut X509Builder, days: u32, limit: Option<&Asn1TimeRef>) -> Result<()> {
    // backdated a day for clients with a skewed clock
    let not_before = Asn1Time::from_unix(unix_now() - 86_400)?;
    builder.set_not_before(&not_before)?;
    let wanted = Asn1Time::days_from_now(days)?;
    let not_after: &Asn1TimeRef = match limit {
        Some(limit) if limit < &*wanted => limit,
        _ => &wanted,
    };
    builder.set_not_after(not_after)?;
    Ok(())
}

fn leaf_alias(host: &str) -> String {
    format!("{}{}", LEAF_ALIAS_PREFIX, host)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn generate_root(days: u32) -> Result<KeyEntry> {
    let key = PKey::from_rsa(Rsa::generate(KEY_BITS)?)?;
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", ROOT_COMMON_NAME)?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    validity(&mut builder, days, None)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new().critical().key_cert_sign().crl_sign().digital_signature().build()?,
    )?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok(KeyEntry { key, cert: builder.build(), chain: Vec::new() })
}

fn signing_request(host: &str, key: &PKey<Private>) -> Result<X509Req> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", host)?;
    let mut req = X509ReqBuilder::new()?;
    req.set_pubkey(key)?;
    req.set_subject_name(&name.build())?;
    req.sign(key, MessageDigest::sha256())?;
    Ok(req.build())
}

fn acceptor(cert: &X509, key: &PKey<Private>, issuers: &[X509]) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    builder.set_certificate(cert)?;
    builder.set_private_key(key)?;
    for issuer in issuers {
        builder.add_extra_chain_cert(issuer.clone())?;
    }
    builder.check_private_key()?;
    Ok(builder.build())
}

impl CertificateAuthority {
    /// Load the root from `store`, generating and persisting one if absent
    pub fn open(mut store: KeyStore) -> Result<Self> {
        let root = match store.get(ROOT_ALIAS)? {
            Some(root) => {
                info!("Loaded root certificate from {}", store.path().display());
                root
            }
            None => {
                let root = generate_root(ROOT_VALIDITY_DAYS)?;
                store.put(ROOT_ALIAS, &root)?;
                info!("Generated root certificate in {}", store.path().display());
                root
            }
        };
        Ok(Self {
            root_cert: root.cert,
            root_key: root.key,
            store: Mutex::new(store),
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// Open the key store at `path` and load the root from it
    pub fn open_path(path: &Path, password: &str) -> Result<Self> {
        Self::open(KeyStore::open(path, password)?)
    }

    pub fn root_certificate(&self) -> &X509 {
        &self.root_cert
    }

    /// Root certificate for installation into trust stores
    pub fn root_certificate_pem(&self) -> Result<Vec<u8>> {
        Ok(self.root_cert.to_pem()?)
    }

    /// Leaf for `host`, issued on first use
    pub async fn leaf_for(self: &Arc<Self>, host: &str) -> Result<Arc<LeafCertificate>> {
        let host = host.to_ascii_lowercase();
        let cell = {
            let mut leaves = self
                .leaves
                .lock()
                .map_err(|_| ProxyError::Certificate("leaf cache poisoned".to_string()))?;
            Arc::clone(leaves.entry(host.clone()).or_default())
        };

        let leaf = cell
            .get_or_try_init(|| {
                let authority = Arc::clone(self);
                let host = host.clone();
                async move {
                    tokio::task::spawn_blocking(move || authority.load_or_issue(&host))
                        .await
                        .map_err(|e| ProxyError::Certificate(format!("leaf task failed: {}", e)))?
                }
            })
            .await?;
        Ok(Arc::clone(leaf))
    }

    fn load_or_issue(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let stored = self
            .store
            .lock()
            .map_err(|_| ProxyError::Certificate("key store poisoned".to_string()))?
            .get(&leaf_alias(host))?;
        let entry = match stored {
            Some(entry) => {
                debug!("Loaded certificate for {}", host);
                entry
            }
            None => {
                let entry = self.issue(host)?;
                self.store
                    .lock()
                    .map_err(|_| ProxyError::Certificate("key store poisoned".to_string()))?
                    .put(&leaf_alias(host), &entry)?;
                info!("Issued certificate for {}", host);
                entry
            }
        };
        let acceptor = acceptor(&entry.cert, &entry.key, &entry.chain)?;
        let mut chain = vec![entry.cert.clone()];
        chain.extend(entry.chain);
        Ok(Arc::new(LeafCertificate {
            host: host.to_string(),
            cert: entry.cert,
            key: entry.key,
            chain,
            acceptor,
        }))
    }

    /// Issue a fresh leaf for `host` signed by the root
    pub fn issue(&self, host: &str) -> Result<KeyEntry> {
        let key = PKey::from_rsa(Rsa::generate(KEY_BITS)?)?;
        let req = signing_request(host, &key)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = random_serial()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(req.subject_name())?;
        builder.set_issuer_name(self.root_cert.subject_name())?;
        let public_key = req.public_key()?;
        builder.set_pubkey(&public_key)?;
        validity(&mut builder, VALIDITY_DAYS, Some(self.root_cert.not_after()))?;

        let mut san = SubjectAlternativeName::new();
        if host.parse::<IpAddr>().is_ok() {
            san.ip(host);
        } else {
            san.dns(host);
        }
        let san = san.build(&builder.x509v3_context(Some(&*self.root_cert), None))?;
        builder.append_extension(san)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new().critical().digital_signature().key_encipherment().build()?,
        )?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(&*self.root_cert), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&builder.x509v3_context(Some(&*self.root_cert), None))?;
        builder.append_extension(aki)?;
        builder.sign(&self.root_key, MessageDigest::sha256())?;

        Ok(KeyEntry { key, cert: builder.build(), chain: vec![self.root_cert.clone()] })
    }
}
