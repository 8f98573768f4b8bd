//! SRP-6a arithmetic over openssl big numbers
//!
//! Hash is SHA-256. `PAD(x)` left-pads to the byte length of the modulus.
//!
//! ```text
//! k  = H(N || PAD(g))        x = H(salt || password)     v = g^x
//! B  = (k*v + g^b) mod N     u = H(PAD(A) || PAD(B))
//! S  = (A * v^u)^b mod N     M1 = H(A || B || S)         M2 = H(A || M1 || S)
//! ```

use openssl::bn::{BigNum, BigNumContext, BigNumRef};
use sha2::{Digest, Sha256};

use crate::common::{ProxyError, Result};

/// Bit length of a generated modulus
pub const MODULUS_BITS: i32 = 256;

/// Default generator
pub const GENERATOR: u32 = 2;

/// Salt length used by the server side
pub const SALT_LEN: usize = 32;

/// Modulus and generator of one exchange
pub struct SrpGroup {
    pub n: BigNum,
    pub g: BigNum,
}

impl SrpGroup {
    /// Random safe-size prime modulus with the default generator
    pub fn generate() -> Result<Self> {
        let mut n = BigNum::new()?;
        n.generate_prime(MODULUS_BITS, false, None, None)?;
        Ok(Self { n, g: BigNum::from_u32(GENERATOR)? })
    }

    pub fn from_bytes(n: &[u8], g: &[u8]) -> Result<Self> {
        Ok(Self { n: BigNum::from_slice(n)?, g: BigNum::from_slice(g)? })
    }

    /// Byte length of the modulus
    pub fn len(&self) -> usize {
        self.n.num_bytes() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pad(&self, value: &BigNumRef) -> Result<Vec<u8>> {
        Ok(value.to_vec_padded(self.len() as i32)?)
    }

    /// Multiplier `k = H(N || PAD(g))`
    pub fn multiplier(&self) -> Result<BigNum> {
        hash_to_bn(&[&self.n.to_vec(), &self.pad(&self.g)?])
    }

    /// Whether `value mod N` is non-zero
    pub fn is_valid_public(&self, value: &BigNumRef) -> Result<bool> {
        let mut ctx = BigNumContext::new()?;
        let mut rem = BigNum::new()?;
        rem.nnmod(value, &self.n, &mut ctx)?;
        Ok(rem.num_bits() != 0)
    }
}

pub fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn hash_to_bn(parts: &[&[u8]]) -> Result<BigNum> {
    Ok(BigNum::from_slice(&hash(parts))?)
}

/// Private key `x = H(salt || password)`
pub fn private_key(salt: &[u8], password: &[u8]) -> Result<BigNum> {
    hash_to_bn(&[salt, password])
}

/// Verifier `v = g^x mod N`
pub fn verifier(group: &SrpGroup, x: &BigNumRef) -> Result<BigNum> {
    let mut ctx = BigNumContext::new()?;
    let mut v = BigNum::new()?;
    v.mod_exp(&group.g, x, &group.n, &mut ctx)?;
    Ok(v)
}

/// Random private value in `[1, N)`
pub fn private_value(group: &SrpGroup) -> Result<BigNum> {
    let mut value = BigNum::new()?;
    loop {
        group.n.rand_range(&mut value)?;
        if value.num_bits() != 0 {
            return Ok(value);
        }
    }
}

/// Scrambler `u = H(PAD(A) || PAD(B))`
pub fn scrambler(group: &SrpGroup, a: &BigNumRef, b: &BigNumRef) -> Result<BigNum> {
    hash_to_bn(&[&group.pad(a)?, &group.pad(b)?])
}

/// Server half of an exchange
pub struct SrpServer {
    group: SrpGroup,
    v: BigNum,
    b: BigNum,
    public: BigNum,
}

impl SrpServer {
    /// Compute the verifier for `password` and the public value `B`
    pub fn new(group: SrpGroup, salt: &[u8], password: &[u8]) -> Result<Self> {
        let x = private_key(salt, password)?;
        let v = verifier(&group, &x)?;
        let b = private_value(&group)?;

        let mut ctx = BigNumContext::new()?;
        let k = group.multiplier()?;
        let mut kv = BigNum::new()?;
        kv.mod_mul(&k, &v, &group.n, &mut ctx)?;
        let mut gb = BigNum::new()?;
        gb.mod_exp(&group.g, &b, &group.n, &mut ctx)?;
        let mut public = BigNum::new()?;
        public.mod_add(&kv, &gb, &group.n, &mut ctx)?;

        Ok(Self { group, v, b, public })
    }

    pub fn group(&self) -> &SrpGroup {
        &self.group
    }

    pub fn public(&self) -> &BigNumRef {
        &self.public
    }

    /// Shared secret `S = (A * v^u)^b mod N`
    pub fn session_key(&self, a: &BigNumRef) -> Result<BigNum> {
        if !self.group.is_valid_public(a)? {
            return Err(ProxyError::Handshake("InvalidPublicValue".to_string()));
        }
        let u = scrambler(&self.group, a, &self.public)?;
        let mut ctx = BigNumContext::new()?;
        let mut vu = BigNum::new()?;
        vu.mod_exp(&self.v, &u, &self.group.n, &mut ctx)?;
        let mut base = BigNum::new()?;
        base.mod_mul(a, &vu, &self.group.n, &mut ctx)?;
        let mut s = BigNum::new()?;
        s.mod_exp(&base, &self.b, &self.group.n, &mut ctx)?;
        Ok(s)
    }
}

/// Client evidence `M1 = H(A || B || S)`
pub fn client_evidence(a: &BigNumRef, b: &BigNumRef, s: &BigNumRef) -> [u8; 32] {
    hash(&[&a.to_vec(), &b.to_vec(), &s.to_vec()])
}

/// Server evidence `M2 = H(A || M1 || S)`
pub fn server_evidence(a: &BigNumRef, m1: &[u8], s: &BigNumRef) -> [u8; 32] {
    hash(&[&a.to_vec(), m1, &s.to_vec()])
}

/// Client side of an exchange, the counterpart of [`SrpServer`]
pub struct SrpClient {
    a: BigNum,
    public: BigNum,
}

impl SrpClient {
    pub fn new(group: &SrpGroup) -> Result<Self> {
        let a = private_value(group)?;
        let mut ctx = BigNumContext::new()?;
        let mut public = BigNum::new()?;
        public.mod_exp(&group.g, &a, &group.n, &mut ctx)?;
        Ok(Self { a, public })
    }

    pub fn public(&self) -> &BigNumRef {
        &self.public
    }

    /// `S = (B - k*g^x)^(a + u*x) mod N`
    pub fn session_key(&self, group: &SrpGroup, salt: &[u8], password: &[u8], server: &BigNumRef) -> Result<BigNum> {
        let mut ctx = BigNumContext::new()?;
        let x = private_key(salt, password)?;
        let u = scrambler(group, &self.public, server)?;
        let k = group.multiplier()?;

        let gx = verifier(group, &x)?;
        let mut kgx = BigNum::new()?;
        kgx.mod_mul(&k, &gx, &group.n, &mut ctx)?;
        let mut base = BigNum::new()?;
        base.mod_sub(server, &kgx, &group.n, &mut ctx)?;

        let mut ux = BigNum::new()?;
        ux.checked_mul(&u, &x, &mut ctx)?;
        let mut exp = BigNum::new()?;
        exp.checked_add(&self.a, &ux)?;

        let mut s = BigNum::new()?;
        s.mod_exp(&base, &exp, &group.n, &mut ctx)?;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_matches_between_peers() {
        let group = SrpGroup::generate().unwrap();
        let salt = [7u8; SALT_LEN];
        let server = SrpServer::new(SrpGroup::from_bytes(&group.n.to_vec(), &group.g.to_vec()).unwrap(), &salt, b"k0").unwrap();
        let client = SrpClient::new(&group).unwrap();

        let client_s = client.session_key(&group, &salt, b"k0", server.public()).unwrap();
        let server_s = server.session_key(client.public()).unwrap();
        assert_eq!(client_s, server_s);

        let m1 = client_evidence(client.public(), server.public(), &client_s);
        assert_eq!(m1, client_evidence(client.public(), server.public(), &server_s));
        assert_eq!(server_evidence(client.public(), &m1, &client_s), server_evidence(client.public(), &m1, &server_s));
    }

    #[test]
    fn test_wrong_password_disagrees() {
        let group = SrpGroup::generate().unwrap();
        let salt = [1u8; SALT_LEN];
        let server = SrpServer::new(SrpGroup::from_bytes(&group.n.to_vec(), &group.g.to_vec()).unwrap(), &salt, b"right").unwrap();
        let client = SrpClient::new(&group).unwrap();

        let client_s = client.session_key(&group, &salt, b"wrong", server.public()).unwrap();
        let server_s = server.session_key(client.public()).unwrap();
        assert_ne!(client_s, server_s);
    }

    #[test]
    fn test_zero_public_value_is_rejected() {
        let group = SrpGroup::generate().unwrap();
        let n = BigNum::from_slice(&group.n.to_vec()).unwrap();
        let server = SrpServer::new(group, &[0u8; SALT_LEN], b"k0").unwrap();
        assert!(matches!(server.session_key(&n), Err(ProxyError::Handshake(_))));
        assert!(matches!(server.session_key(&BigNum::new().unwrap()), Err(ProxyError::Handshake(_))));
    }

    #[test]
    fn test_padding_uses_modulus_length() {
        let group = SrpGroup::generate().unwrap();
        let padded = group.pad(&group.g).unwrap();
        assert_eq!(padded.len(), group.len());
        assert_eq!(*padded.last().unwrap(), GENERATOR as u8);
    }
}
