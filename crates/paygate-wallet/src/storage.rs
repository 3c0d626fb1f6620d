//! Encrypted persistence for HD wallet state.
//!
//! `wallet.dat` holds `nonce || AES-GCM(secret(32) || chain_code(32) ||
//! next_index(u32 BE) || network(1))`.

use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::address::Network;
use crate::error::WalletError;
use crate::hd::ExtendedKey;
use crate::sealed::{self, KEY_LEN};

pub const WALLET_FILE_NAME: &str = "wallet.dat";

const SNAPSHOT_LEN: usize = 32 + 32 + 4 + 1;

/// Everything needed to resume an HD address source.
#[derive(Debug, Clone)]
pub struct WalletSnapshot {
    pub master: ExtendedKey,
    pub network: Network,
    pub next_index: u32,
}

impl WalletSnapshot {
    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(SNAPSHOT_LEN));
        out.extend_from_slice(self.master.secret_bytes());
        out.extend_from_slice(self.master.chain_code());
        out.extend_from_slice(&self.next_index.to_be_bytes());
        out.push(match self.network {
            Network::Mainnet => 0,
            Network::Testnet => 1,
        });
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        if bytes.len() != SNAPSHOT_LEN {
            return Err(WalletError::Storage(format!(
                "wallet snapshot is {} bytes, expected {SNAPSHOT_LEN}",
                bytes.len()
            )));
        }
        let mut secret = Zeroizing::new([0u8; 32]);
        let mut chain_code = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&bytes[..32]);
        chain_code.copy_from_slice(&bytes[32..64]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&bytes[64..68]);
        let network = match bytes[68] {
            0 => Network::Mainnet,
            1 => Network::Testnet,
            other => {
                return Err(WalletError::Storage(format!(
                    "unknown network tag {other} in wallet snapshot"
                )))
            }
        };
        Ok(Self {
            master: ExtendedKey::from_parts(*secret, *chain_code)?,
            network,
            next_index: u32::from_be_bytes(index),
        })
    }
}

/// Reads and writes the encrypted wallet file in a directory.
pub struct WalletStorage {
    path: PathBuf,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl WalletStorage {
    /// Storage for `dir/wallet.dat` sealed under `key`.
    pub fn new(dir: impl AsRef<Path>, key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self {
            path: dir.as_ref().join(WALLET_FILE_NAME),
            key,
        }
    }

    /// Storage whose key lives at `key_path` (created on first use).
    pub fn open(dir: impl AsRef<Path>, key_path: &Path) -> Result<Self, WalletError> {
        let key = sealed::load_or_create_key(key_path)?;
        Ok(Self::new(dir, key))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or `None` if no wallet file exists yet.
    pub fn load(&self) -> Result<Option<WalletSnapshot>, WalletError> {
        let sealed_bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plaintext = sealed::open(&self.key, &sealed_bytes)?;
        WalletSnapshot::from_bytes(&plaintext).map(Some)
    }

    pub fn save(&self, snapshot: &WalletSnapshot) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            sealed::create_private_dir(parent)?;
        }
        let sealed_bytes = sealed::seal(&self.key, &snapshot.to_bytes())?;
        sealed::write_private(&self.path, &sealed_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WalletStorage::new(dir.path(), Zeroizing::new([3u8; KEY_LEN]));
        assert!(storage.load().unwrap().is_none());

        let master = ExtendedKey::from_seed(&[5u8; 64]).unwrap();
        storage
            .save(&WalletSnapshot {
                master: master.clone(),
                network: Network::Testnet,
                next_index: 42,
            })
            .unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.next_index, 42);
        assert_eq!(loaded.network, Network::Testnet);
        assert_eq!(loaded.master.secret_bytes(), master.secret_bytes());
        assert_eq!(loaded.master.chain_code(), master.chain_code());
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let master = ExtendedKey::from_seed(&[5u8; 32]).unwrap();
        WalletStorage::new(dir.path(), Zeroizing::new([3u8; KEY_LEN]))
            .save(&WalletSnapshot {
                master,
                network: Network::Mainnet,
                next_index: 0,
            })
            .unwrap();

        let other = WalletStorage::new(dir.path(), Zeroizing::new([4u8; KEY_LEN]));
        assert!(matches!(other.load(), Err(WalletError::Crypto(_))));
    }
}
