use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::base58;
use crate::error::WalletError;

/// Bitcoin network an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet => 0x6f,
        }
    }

    pub fn p2sh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet => 0xc4,
        }
    }

    /// BIP44 coin type (`0'` for Bitcoin, `1'` for every testnet).
    pub fn bip44_coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
        }
    }

    fn bech32_hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bc1",
            Network::Testnet => "tb1",
        }
    }
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let digest = Ripemd160::digest(Sha256::digest(data));
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Pay-to-public-key-hash address for a compressed public key.
pub fn p2pkh_address(public_key: &[u8; 33], network: Network) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(network.p2pkh_version());
    payload.extend_from_slice(&hash160(public_key));
    base58::check_encode(&payload)
}

const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Validate a Bitcoin address and report its network.
///
/// Base58Check P2PKH/P2SH addresses are fully verified (checksum and version
/// byte). Bech32 addresses are checked for prefix, length and character set.
pub fn validate_address(address: &str) -> Result<Network, WalletError> {
    let lower = address.to_ascii_lowercase();
    for network in [Network::Mainnet, Network::Testnet] {
        if lower.starts_with(network.bech32_hrp()) {
            let mixed_case = address != lower && address != address.to_ascii_uppercase();
            let data = &lower[network.bech32_hrp().len()..];
            if mixed_case
                || !(14..=74).contains(&address.len())
                || !data.chars().all(|c| BECH32_CHARSET.contains(c))
            {
                return Err(WalletError::InvalidAddress(address.to_string()));
            }
            return Ok(network);
        }
    }

    let payload = base58::check_decode(address)
        .map_err(|_| WalletError::InvalidAddress(address.to_string()))?;
    if payload.len() != 21 {
        return Err(WalletError::InvalidAddress(address.to_string()));
    }
    match payload[0] {
        0x00 | 0x05 => Ok(Network::Mainnet),
        0x6f | 0xc4 => Ok(Network::Testnet),
        _ => Err(WalletError::InvalidAddress(address.to_string())),
    }
}
