//! On-disk key store
//!
//! A JSON object mapping an alias to a base64 PKCS#12 blob, all protected by
//! the same password. Every change rewrites the whole file through a
//! temporary sibling and a rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;

use crate::common::{ProxyError, Result};

/// Key, certificate and chain stored under one alias
pub struct KeyEntry {
    pub key: PKey<Private>,
    pub cert: X509,
    /// Issuers of `cert`, nearest first
    pub chain: Vec<X509>,
}

pub struct KeyStore {
    path: PathBuf,
    password: String,
    entries: BTreeMap<String, String>,
}

impl KeyStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: &Path, password: &str) -> Result<Self> {
        let entries = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)
                .map_err(|e| ProxyError::Certificate(format!("Invalid key store {}: {}", path.display(), e)))?
        } else {
            info!("Creating key store {}", path.display());
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), password: password.to_string(), entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, alias: &str) -> Result<Option<KeyEntry>> {
        let Some(encoded) = self.entries.get(alias) else {
            return Ok(None);
        };
        let der = STANDARD
            .decode(encoded)
            .map_err(|e| ProxyError::Certificate(format!("Entry {} is not base64: {}", alias, e)))?;
        let parsed = Pkcs12::from_der(&der)?.parse2(&self.password)?;
        match (parsed.pkey, parsed.cert) {
            (Some(key), Some(cert)) => {
                let chain = parsed.ca.map(|ca| ca.into_iter().collect()).unwrap_or_default();
                Ok(Some(KeyEntry { key, cert, chain }))
            }
            _ => Err(ProxyError::Certificate(format!("Entry {} lacks a key or certificate", alias))),
        }
    }

    /// Store `entry` under `alias` and persist the store
    pub fn put(&mut self, alias: &str, entry: &KeyEntry) -> Result<()> {
        let mut chain = Stack::new()?;
        for cert in &entry.chain {
            chain.push(cert.clone())?;
        }
        let pkcs12 = Pkcs12::builder()
            .name(alias)
            .pkey(&entry.key)
            .cert(&entry.cert)
            .ca(chain)
            .build2(&self.password)?;
        self.entries.insert(alias.to_string(), STANDARD.encode(pkcs12.to_der()?));
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Saved {} entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    fn self_signed(cn: &str) -> KeyEntry {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        KeyEntry { key, cert: builder.build(), chain: Vec::new() }
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("key_store.json");

        let entry = self_signed("example.com");
        let mut store = KeyStore::open(&path, "secret").unwrap();
        assert!(store.is_empty());
        store.put("example.com", &entry).unwrap();

        let reopened = KeyStore::open(&path, "secret").unwrap();
        assert!(reopened.contains("example.com"));
        let loaded = reopened.get("example.com").unwrap().unwrap();
        assert_eq!(loaded.cert.to_der().unwrap(), entry.cert.to_der().unwrap());
        assert!(loaded.key.public_eq(&entry.key));
        assert!(reopened.get("missing").unwrap().is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_wrong_password_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key_store.json");
        KeyStore::open(&path, "right").unwrap().put("root", &self_signed("root")).unwrap();

        let store = KeyStore::open(&path, "wrong").unwrap();
        assert!(store.get("root").is_err());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key_store.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(KeyStore::open(&path, ""), Err(ProxyError::Certificate(_))));
    }
}
