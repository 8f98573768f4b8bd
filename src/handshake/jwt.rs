//! ES384 compact JWS over openssl
//!
//! Segments are unpadded URL-safe base64. Signatures are the raw `r || s`
//! form, 48 bytes each. Keys travel as standard base64 of their DER
//! SubjectPublicKeyInfo, both in the `x5u` header and in claims.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use openssl::bn::BigNum;
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{ProxyError, Result};

pub const ALGORITHM: &str = "ES384";

const COMPONENT_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    /// Signing key, base64 SPKI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x5u: Option<String>,
}

/// Fresh P-384 key pair
pub fn generate_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

/// Base64 SPKI of the public half of `key`
pub fn encode_key<T: openssl::pkey::HasPublic>(key: &PKey<T>) -> Result<String> {
    Ok(STANDARD.encode(key.public_key_to_der()?))
}

pub fn decode_key(encoded: &str) -> Result<PKey<Public>> {
    let der = STANDARD
        .decode(encoded)
        .map_err(|e| ProxyError::Handshake(format!("invalid key encoding: {}", e)))?;
    Ok(PKey::public_key_from_der(&der)?)
}

/// Public half of a private key
pub fn public_key(key: &PKey<Private>) -> Result<PKey<Public>> {
    Ok(PKey::public_key_from_der(&key.public_key_to_der()?)?)
}

/// ECDH shared secret
pub fn agree(private: &PKey<Private>, peer: &PKey<Public>) -> Result<Vec<u8>> {
    let mut deriver = Deriver::new(private)?;
    deriver.set_peer(peer)?;
    Ok(deriver.derive_to_vec()?)
}

fn segment<T: Serialize>(value: &T) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?))
}

fn unsegment(segment: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| ProxyError::Handshake(format!("invalid token segment: {}", e)))
}

/// Sign `claims`, naming the signing key in `x5u`
pub fn sign(key: &PKey<Private>, claims: &Value) -> Result<String> {
    let header = JwsHeader { alg: ALGORITHM.to_string(), x5u: Some(encode_key(key)?) };
    let signing_input = format!("{}.{}", segment(&header)?, segment(claims)?);

    let mut signer = Signer::new(MessageDigest::sha384(), key)?;
    let der = signer.sign_oneshot_to_vec(signing_input.as_bytes())?;
    let signature = EcdsaSig::from_der(&der)?;
    let mut raw = signature.r().to_vec_padded(COMPONENT_LEN as i32)?;
    raw.extend_from_slice(&signature.s().to_vec_padded(COMPONENT_LEN as i32)?);

    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(raw)))
}

fn split(token: &str) -> Result<(&str, &str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(claims), Some(signature), None) => Ok((header, claims, signature)),
        _ => Err(ProxyError::Handshake("token is not a compact JWS".to_string())),
    }
}

/// Header and claims without checking the signature
pub fn decode_unverified(token: &str) -> Result<(JwsHeader, Value)> {
    let (header, claims, _) = split(token)?;
    let header: JwsHeader = serde_json::from_slice(&unsegment(header)?)?;
    let claims = serde_json::from_slice(&unsegment(claims)?)?;
    Ok((header, claims))
}

/// Claims of `token` after checking its signature against `key`
pub fn verify(token: &str, key: &PKey<Public>) -> Result<Value> {
    let (header_segment, claims_segment, signature) = split(token)?;
    let header: JwsHeader = serde_json::from_slice(&unsegment(header_segment)?)?;
    if header.alg != ALGORITHM {
        return Err(ProxyError::Handshake(format!("unsupported algorithm {}", header.alg)));
    }

    let raw = unsegment(signature)?;
    if raw.len() != 2 * COMPONENT_LEN {
        return Err(ProxyError::Handshake(format!("signature of {} bytes", raw.len())));
    }
    let r = BigNum::from_slice(&raw[..COMPONENT_LEN])?;
    let s = BigNum::from_slice(&raw[COMPONENT_LEN..])?;
    let der = EcdsaSig::from_private_components(r, s)?.to_der()?;

    let signing_input = &token[..header_segment.len() + 1 + claims_segment.len()];
    let mut verifier = Verifier::new(MessageDigest::sha384(), key)?;
    if !verifier.verify_oneshot(&der, signing_input.as_bytes())? {
        return Err(ProxyError::Handshake("token signature does not verify".to_string()));
    }
    Ok(serde_json::from_slice(&unsegment(claims_segment)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_then_verify() {
        let key = generate_key().unwrap();
        let token = sign(&key, &json!({"salt": "c2FsdA=="})).unwrap();

        let (header, claims) = decode_unverified(&token).unwrap();
        assert_eq!(header.alg, ALGORITHM);
        let signer = decode_key(header.x5u.as_deref().unwrap()).unwrap();
        assert_eq!(verify(&token, &signer).unwrap(), claims);
        assert_eq!(claims["salt"], "c2FsdA==");
    }

    #[test]
    fn test_other_key_does_not_verify() {
        let token = sign(&generate_key().unwrap(), &json!({})).unwrap();
        let other = public_key(&generate_key().unwrap()).unwrap();
        assert!(matches!(verify(&token, &other), Err(ProxyError::Handshake(_))));
    }

    #[test]
    fn test_modified_claims_do_not_verify() {
        let key = generate_key().unwrap();
        let token = sign(&key, &json!({"name": "steve"})).unwrap();
        let (header, _, signature) = split(&token).unwrap();
        let forged = format!("{}.{}.{}", header, segment(&json!({"name": "alex"})).unwrap(), signature);
        assert!(verify(&forged, &public_key(&key).unwrap()).is_err());
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let ours = generate_key().unwrap();
        let theirs = generate_key().unwrap();
        let left = agree(&ours, &public_key(&theirs).unwrap()).unwrap();
        let right = agree(&theirs, &public_key(&ours).unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left.len(), 48);
    }

    #[test]
    fn test_key_encoding_round_trip() {
        let key = generate_key().unwrap();
        let encoded = encode_key(&key).unwrap();
        assert_eq!(encode_key(&decode_key(&encoded).unwrap()).unwrap(), encoded);
    }
}
