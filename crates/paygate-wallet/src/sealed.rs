//! AES-256-GCM sealing and owner-only key/record files.
//!
//! Sealed blobs are laid out as `nonce (12 bytes) || ciphertext+tag`. A fresh
//! random nonce is drawn for every seal.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::fs;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::WalletError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` under `key`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, WalletError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce).map_err(|e| WalletError::Crypto(format!("rng failure: {e}")))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| WalletError::Crypto("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a sealed blob. Fails on truncation, tampering or a wrong key.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    if sealed.len() < NONCE_LEN {
        return Err(WalletError::Crypto("ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| WalletError::Crypto("authentication failed".to_string()))
}

/// Generate a random 32-byte key.
pub fn generate_key() -> Result<Zeroizing<[u8; KEY_LEN]>, WalletError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    getrandom::fill(&mut key[..]).map_err(|e| WalletError::Crypto(format!("rng failure: {e}")))?;
    Ok(key)
}

/// Load the key at `path`, or generate and store a new one if the file does
/// not exist. The parent directory is created with mode 0700 and the key file
/// with mode 0600.
pub fn load_or_create_key(path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>, WalletError> {
    match fs::read(path) {
        Ok(bytes) => {
            let bytes = Zeroizing::new(bytes);
            if bytes.len() != KEY_LEN {
                return Err(WalletError::InvalidKey(format!(
                    "key file {} holds {} bytes, expected {KEY_LEN}",
                    path.display(),
                    bytes.len()
                )));
            }
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                create_private_dir(parent)?;
            }
            let key = generate_key()?;
            write_private(path, &key[..])?;
            tracing::info!(path = %path.display(), "generated new encryption key");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Create `dir` (and parents), restricting it to the owner on Unix.
pub fn create_private_dir(dir: &Path) -> Result<(), WalletError> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "failed to set directory permissions to 0700"
            );
        }
    }
    Ok(())
}

/// Atomically replace `path` with `bytes`: write a sibling temp file with
/// owner-only permissions, then rename over the target.
pub fn write_private(path: &Path, bytes: &[u8]) -> Result<(), WalletError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| WalletError::Storage(format!("invalid file path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}
