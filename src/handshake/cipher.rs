//! Game-network packet encryption
//!
//! AES-256-CTR keyed by `SHA-256(salt || shared_secret)` with the IV taken from
//! the first 12 key bytes followed by `00 00 00 02`. Every encrypted batch
//! carries an 8 byte trailer, `SHA-256(counter_le || plaintext || key)[..8]`,
//! where the counter counts batches in that direction.
//!
//! A session is split into an [`Encryptor`] and a [`Decryptor`] so each half
//! can live with the task that uses it.

use bytes::Bytes;
use openssl::symm::{Cipher, Crypter, Mode};
use sha2::{Digest, Sha256};

use crate::common::{ProxyError, Result};

const CHECKSUM_LEN: usize = 8;

/// Derive the symmetric key of a session
pub fn derive_key(salt: &[u8], shared_secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

fn iv(key: &[u8; 32]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..12].copy_from_slice(&key[..12]);
    iv[15] = 2;
    iv
}

fn checksum(counter: u64, payload: &[u8], key: &[u8; 32]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(counter.to_le_bytes());
    hasher.update(payload);
    hasher.update(key);
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

fn crypter(key: &[u8; 32], mode: Mode) -> Result<Crypter> {
    Ok(Crypter::new(Cipher::aes_256_ctr(), mode, key, Some(&iv(key)))?)
}

fn apply(crypter: &mut Crypter, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; input.len() + Cipher::aes_256_ctr().block_size()];
    let n = crypter.update(input, &mut out)?;
    out.truncate(n);
    Ok(out)
}

/// Outbound half of a session
pub struct Encryptor {
    crypter: Crypter,
    key: [u8; 32],
    counter: u64,
}

impl Encryptor {
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        let mut data = Vec::with_capacity(plaintext.len() + CHECKSUM_LEN);
        data.extend_from_slice(plaintext);
        data.extend_from_slice(&checksum(self.counter, plaintext, &self.key));
        self.counter = self.counter.wrapping_add(1);
        Ok(Bytes::from(apply(&mut self.crypter, &data)?))
    }
}

/// Inbound half of a session
pub struct Decryptor {
    crypter: Crypter,
    key: [u8; 32],
    counter: u64,
}

impl Decryptor {
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Bytes> {
        let mut data = apply(&mut self.crypter, ciphertext)?;
        if data.len() < CHECKSUM_LEN {
            return Err(ProxyError::Codec("encrypted batch shorter than its checksum".to_string()));
        }
        let trailer = data.split_off(data.len() - CHECKSUM_LEN);
        if trailer != checksum(self.counter, &data, &self.key) {
            return Err(ProxyError::Handshake(format!("checksum mismatch on batch {}", self.counter)));
        }
        self.counter = self.counter.wrapping_add(1);
        Ok(Bytes::from(data))
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").field("counter", &self.counter).finish()
    }
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor").field("counter", &self.counter).finish()
    }
}

/// Both halves of one session
pub fn session(key: [u8; 32]) -> Result<(Encryptor, Decryptor)> {
    Ok((
        Encryptor { crypter: crypter(&key, Mode::Encrypt)?, key, counter: 0 },
        Decryptor { crypter: crypter(&key, Mode::Decrypt)?, key, counter: 0 },
    ))
}
