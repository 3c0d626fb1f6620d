//! BIP32 hierarchical deterministic key derivation over secp256k1.

use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{FieldBytes, Scalar, SecretKey};
use sha2::Sha512;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WalletError;

type HmacSha512 = Hmac<Sha512>;

/// Offset marking a hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

/// HMAC key for master key generation.
const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";

pub const MIN_SEED_LEN: usize = 16;
pub const MAX_SEED_LEN: usize = 64;

/// A private extended key: 32-byte secret scalar plus 32-byte chain code.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedKey {
    secret: [u8; 32],
    chain_code: [u8; 32],
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey").finish_non_exhaustive()
    }
}

impl ExtendedKey {
    /// Derive the master key from a seed of 16 to 64 bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self, WalletError> {
        if !(MIN_SEED_LEN..=MAX_SEED_LEN).contains(&seed.len()) {
            return Err(WalletError::InvalidSeed(seed.len()));
        }
        let (il, ir) = hmac_sha512(MASTER_HMAC_KEY, &[seed])?;
        Self::from_parts(il, ir)
    }

    /// Rebuild an extended key from stored parts, validating the scalar.
    pub fn from_parts(secret: [u8; 32], chain_code: [u8; 32]) -> Result<Self, WalletError> {
        SecretKey::from_slice(&secret)
            .map_err(|_| WalletError::InvalidKey("secret scalar out of range".to_string()))?;
        Ok(Self { secret, chain_code })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    /// SEC1 compressed public key (33 bytes).
    pub fn public_key(&self) -> Result<[u8; 33], WalletError> {
        let secret = SecretKey::from_slice(&self.secret)
            .map_err(|_| WalletError::InvalidKey("secret scalar out of range".to_string()))?;
        let point = secret.public_key().to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        Ok(out)
    }

    /// Derive child `index`. Indices at or above [`HARDENED`] use hardened
    /// derivation.
    ///
    /// Returns [`WalletError::InvalidChildKey`] when IL is not below the curve
    /// order or the resulting key is zero; callers skip to the next index.
    pub fn derive_child(&self, index: u32) -> Result<Self, WalletError> {
        let index_be = index.to_be_bytes();
        let (il, ir) = if index >= HARDENED {
            hmac_sha512(&self.chain_code, &[&[0u8], &self.secret, &index_be])?
        } else {
            let public = self.public_key()?;
            hmac_sha512(&self.chain_code, &[&public, &index_be])?
        };

        let tweak = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(&il)))
            .ok_or(WalletError::InvalidChildKey { index })?;
        let parent = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(
            &self.secret,
        )))
        .ok_or_else(|| WalletError::InvalidKey("secret scalar out of range".to_string()))?;

        let child = tweak + parent;
        if bool::from(child.is_zero()) {
            return Err(WalletError::InvalidChildKey { index });
        }

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&child.to_bytes());
        Ok(Self {
            secret,
            chain_code: ir,
        })
    }

    /// Derive along a path of child indices.
    pub fn derive_path(&self, path: &[u32]) -> Result<Self, WalletError> {
        let mut key = self.clone();
        for &index in path {
            key = key.derive_child(index)?;
        }
        Ok(key)
    }
}

/// BIP44 external chain path prefix `m/44'/coin'/account'/0`.
pub fn bip44_external_chain(coin_type: u32, account: u32) -> [u32; 4] {
    [44 | HARDENED, coin_type | HARDENED, account | HARDENED, 0]
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<([u8; 32], [u8; 32]), WalletError> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| WalletError::Crypto(format!("hmac key rejected: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    let output = mac.finalize().into_bytes();
    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&output[..32]);
    ir.copy_from_slice(&output[32..]);
    Ok((il, ir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex32(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hex::decode(s).unwrap());
        out
    }

    // BIP32 test vector 1
    const TV1_SEED: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_master_key_from_seed() {
        let master = ExtendedKey::from_seed(&hex::decode(TV1_SEED).unwrap()).unwrap();
        assert_eq!(
            master.secret_bytes(),
            &hex32("e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35")
        );
        assert_eq!(
            master.chain_code(),
            &hex32("873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508")
        );
    }

    #[test]
    fn test_hardened_child() {
        let master = ExtendedKey::from_seed(&hex::decode(TV1_SEED).unwrap()).unwrap();
        let child = master.derive_child(HARDENED).unwrap();
        assert_eq!(
            child.secret_bytes(),
            &hex32("edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea")
        );
        assert_eq!(
            child.chain_code(),
            &hex32("47fdacbd0f1097043b78c63c20c34ef4ed9a111d980047ad16282c7ae6236141")
        );
    }

    #[test]
    fn test_seed_length_bounds() {
        assert!(matches!(
            ExtendedKey::from_seed(&[7u8; 15]),
            Err(WalletError::InvalidSeed(15))
        ));
        assert!(matches!(
            ExtendedKey::from_seed(&[7u8; 65]),
            Err(WalletError::InvalidSeed(65))
        ));
        assert!(ExtendedKey::from_seed(&[7u8; 16]).is_ok());
        assert!(ExtendedKey::from_seed(&[7u8; 64]).is_ok());
    }

    #[test]
    fn test_normal_derivation_is_deterministic() {
        let master = ExtendedKey::from_seed(&[1u8; 32]).unwrap();
        let a = master.derive_path(&[HARDENED, 0, 5]).unwrap();
        let b = master.derive_path(&[HARDENED, 0, 5]).unwrap();
        let c = master.derive_path(&[HARDENED, 0, 6]).unwrap();
        assert_eq!(a.secret_bytes(), b.secret_bytes());
        assert_ne!(a.secret_bytes(), c.secret_bytes());
    }

    #[test]
    fn test_from_parts_rejects_zero_scalar() {
        assert!(ExtendedKey::from_parts([0u8; 32], [1u8; 32]).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let master = ExtendedKey::from_seed(&[9u8; 32]).unwrap();
        let rendered = format!("{master:?}");
        assert!(!rendered.contains(&hex::encode(master.secret_bytes())));
    }
}
