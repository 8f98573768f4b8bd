//! Game-network login handshake
//!
//! The proxy stands in for the client towards the server and for the server
//! towards the client. It replaces the client's identity chain with a
//! self-signed one for its own key, so the server derives its session key
//! against the proxy, and then offers the client a fresh key exchange.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info};
use openssl::pkey::{PKey, Private, Public};
use openssl::rand::rand_bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::common::{ProxyError, Result};
use crate::protocol::game::LoginPacket;
use super::cipher::derive_key;
use super::jwt;

/// Root key of the first-party authentication service
pub const MOJANG_PUBLIC_KEY: &str = "MHYwEAYHKoZIzj0CAQYFK4EEACIDYgAE8ELkixyLcwlZryUQcu1TvPOmI2B7vX83ndnWRUaXm74wFfa5f/lwQNTfrLVHa2PmenpGI6JhIMUJaWZrjmMj90NoKNFSNBuKdm8rYiXsfaz3K36x/1U26HpG0ZxK/V1V";

/// Lifetime of the proxy's identity token, seconds
const CHAIN_LIFETIME: i64 = 172_800;
const CHAIN_BACKDATE: i64 = 60;
const CLIENT_SALT_LEN: usize = 16;

/// Named phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum McbePhase {
    Login,
    KeyExchange,
    Encrypted,
}

#[derive(Debug, Deserialize, Serialize)]
struct Chain {
    chain: Vec<String>,
}

/// What the proxy learned from the client's login
#[derive(Clone)]
pub struct ClientIdentity {
    pub protocol_version: i32,
    pub public_key: PKey<Public>,
    pub extra_data: Value,
    /// Whether the chain passed through the first-party root
    pub authenticated: bool,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("protocol_version", &self.protocol_version)
            .field("extra_data", &self.extra_data)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn claim_str<'a>(claims: &'a Value, name: &str) -> Result<&'a str> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::Handshake(format!("token without {}", name)))
}

/// Walk an identity chain, verifying every link with the key the previous one vouched for
///
/// The head is verified with the key named in its own header.
pub fn verify_chain(chain: &str) -> Result<(PKey<Public>, Value, bool)> {
    let chain: Chain = serde_json::from_str(chain)?;
    let head = chain
        .chain
        .first()
        .ok_or_else(|| ProxyError::Handshake("empty identity chain".to_string()))?;
    let (header, _) = jwt::decode_unverified(head)?;
    let mut key_encoded = header
        .x5u
        .ok_or_else(|| ProxyError::Handshake("chain head without x5u".to_string()))?;

    let mut extra_data = Value::Null;
    let mut authenticated = false;
    for token in &chain.chain {
        let key = jwt::decode_key(&key_encoded)?;
        let claims = jwt::verify(token, &key)?;
        if key_encoded == MOJANG_PUBLIC_KEY {
            authenticated = true;
        }
        if let Some(extra) = claims.get("extraData") {
            extra_data = extra.clone();
        }
        key_encoded = claim_str(&claims, "identityPublicKey")?.to_string();
    }

    Ok((jwt::decode_key(&key_encoded)?, extra_data, authenticated))
}

/// Per-connection key and the derivations that depend on it
pub struct McbeHandshake {
    key: PKey<Private>,
}

/// Keys of both legs once the server has answered
pub struct KeyExchange {
    pub server_key: [u8; 32],
    pub client_key: [u8; 32],
    /// Handshake token to send the client instead of the server's
    pub client_token: String,
}

impl McbeHandshake {
    pub fn new() -> Result<Self> {
        Ok(Self { key: jwt::generate_key()? })
    }

    /// Check the client's login and rebuild it around the proxy's key
    pub fn rewrite_login(&self, login: &LoginPacket) -> Result<(ClientIdentity, LoginPacket)> {
        let (public_key, extra_data, authenticated) = verify_chain(&login.chain)?;
        let user_claims = jwt::verify(&login.user_jws, &public_key)?;
        let identity = ClientIdentity {
            protocol_version: login.protocol_version,
            public_key,
            extra_data,
            authenticated,
        };
        info!(
            "Login with protocol {} ({})",
            identity.protocol_version,
            if authenticated { "authenticated" } else { "self-signed" }
        );

        let proxy_key = jwt::encode_key(&self.key)?;
        let iat = now();
        let claims = json!({
            "certificateAuthority": true,
            "exp": iat + CHAIN_LIFETIME,
            "identityPublicKey": proxy_key,
            "nbf": iat - CHAIN_BACKDATE,
            "extraData": identity.extra_data,
        });
        let chain = serde_json::to_string(&Chain { chain: vec![jwt::sign(&self.key, &claims)?] })?;
        let user_jws = jwt::sign(&self.key, &user_claims)?;

        let login = LoginPacket { protocol_version: login.protocol_version, chain, user_jws };
        Ok((identity, login))
    }

    /// Derive the server leg's key from its handshake and set up the client leg
    pub fn exchange(&self, server_token: &str, client: &ClientIdentity) -> Result<KeyExchange> {
        let (header, _) = jwt::decode_unverified(server_token)?;
        let server_public = jwt::decode_key(
            header
                .x5u
                .as_deref()
                .ok_or_else(|| ProxyError::Handshake("server handshake without x5u".to_string()))?,
        )?;
        let claims = jwt::verify(server_token, &server_public)?;
        let salt = STANDARD
            .decode(claim_str(&claims, "salt")?)
            .map_err(|e| ProxyError::Handshake(format!("invalid salt: {}", e)))?;
        let server_key = derive_key(&salt, &jwt::agree(&self.key, &server_public)?);

        let mut client_salt = [0u8; CLIENT_SALT_LEN];
        rand_bytes(&mut client_salt)?;
        let client_token = jwt::sign(&self.key, &json!({ "salt": STANDARD.encode(client_salt) }))?;
        let client_key = derive_key(&client_salt, &jwt::agree(&self.key, &client.public_key)?);
        debug!("Derived keys for both legs");

        Ok(KeyExchange { server_key, client_key, client_token })
    }

    /// Public half of the proxy's key
    pub fn public_key(&self) -> Result<PKey<Public>> {
        jwt::public_key(&self.key)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A self-signed client login the way an offline client builds one
    pub(crate) fn client_login(key: &PKey<Private>) -> LoginPacket {
        let encoded = jwt::encode_key(key).unwrap();
        let iat = now();
        let claims = json!({
            "certificateAuthority": true,
            "exp": iat + 3600,
            "identityPublicKey": encoded,
            "nbf": iat - 60,
            "extraData": {"displayName": "steve"},
        });
        let chain = serde_json::to_string(&Chain { chain: vec![jwt::sign(key, &claims).unwrap()] }).unwrap();
        LoginPacket {
            protocol_version: 503,
            chain,
            user_jws: jwt::sign(key, &json!({"SkinId": "default"})).unwrap(),
        }
    }

    #[test]
    fn test_rewritten_login_vouches_for_proxy_key() {
        let client = jwt::generate_key().unwrap();
        let handshake = McbeHandshake::new().unwrap();
        let (identity, login) = handshake.rewrite_login(&client_login(&client)).unwrap();

        assert_eq!(identity.extra_data["displayName"], "steve");
        assert!(!identity.authenticated);
        assert_eq!(jwt::encode_key(&identity.public_key).unwrap(), jwt::encode_key(&client).unwrap());

        let (proxy_key, extra, _) = verify_chain(&login.chain).unwrap();
        let proxy_encoded = jwt::encode_key(&proxy_key).unwrap();
        assert_eq!(proxy_encoded, jwt::encode_key(&handshake.public_key().unwrap()).unwrap());
        assert_eq!(extra["displayName"], "steve");
        assert_eq!(jwt::verify(&login.user_jws, &proxy_key).unwrap()["SkinId"], "default");
    }

    #[test]
    fn test_chain_with_broken_link_fails() {
        let client = jwt::generate_key().unwrap();
        let mut login = client_login(&client);
        login.user_jws = jwt::sign(&jwt::generate_key().unwrap(), &json!({})).unwrap();
        assert!(McbeHandshake::new().unwrap().rewrite_login(&login).is_err());
    }

    #[test]
    fn test_exchange_matches_both_peers() {
        let client = jwt::generate_key().unwrap();
        let server = jwt::generate_key().unwrap();
        let handshake = McbeHandshake::new().unwrap();
        let (identity, _) = handshake.rewrite_login(&client_login(&client)).unwrap();

        let server_salt = b"server-salt-1234";
        let server_token = jwt::sign(&server, &json!({"salt": STANDARD.encode(server_salt)})).unwrap();
        let keys = handshake.exchange(&server_token, &identity).unwrap();

        let proxy_public = handshake.public_key().unwrap();
        let server_side = derive_key(server_salt, &jwt::agree(&server, &proxy_public).unwrap());
        assert_eq!(keys.server_key, server_side);

        let claims = jwt::verify(&keys.client_token, &proxy_public).unwrap();
        let client_salt = STANDARD.decode(claims["salt"].as_str().unwrap()).unwrap();
        let client_side = derive_key(&client_salt, &jwt::agree(&client, &proxy_public).unwrap());
        assert_eq!(keys.client_key, client_side);
        assert_ne!(keys.client_key, keys.server_key);
    }
}
