use paygate_wallet::sealed::{self, KEY_LEN};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zeroize::Zeroizing;

use super::{check_update, is_listed_pending, PaymentStore};
use crate::error::StoreError;
use crate::payment::{is_valid_payment_id, Payment};

/// On-disk encoding of one payment record.
pub trait RecordCodec: Send + Sync {
    /// File extension, without the dot.
    const EXTENSION: &'static str;

    fn encode(&self, payment: &Payment) -> Result<Vec<u8>, StoreError>;

    fn decode(&self, bytes: &[u8]) -> Result<Payment, StoreError>;
}

/// Plain pretty-printed JSON (`<id>.json`).
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainJson;

impl RecordCodec for PlainJson {
    const EXTENSION: &'static str = "json";

    fn encode(&self, payment: &Payment) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec_pretty(payment)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payment, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// JSON sealed with AES-256-GCM (`<id>.enc`, `nonce || ciphertext`).
pub struct Sealed {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl Sealed {
    pub fn new(key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self { key }
    }
}

impl RecordCodec for Sealed {
    const EXTENSION: &'static str = "enc";

    fn encode(&self, payment: &Payment) -> Result<Vec<u8>, StoreError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payment)?);
        Ok(sealed::seal(&self.key, &plaintext)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payment, StoreError> {
        let plaintext = sealed::open(&self.key, bytes)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// One file per payment in a directory, named by payment id.
///
/// Writes go through a temp file and a rename, so readers never observe a
/// partial record. Directory scans skip unreadable records with a warning;
/// direct lookups surface them as errors.
pub struct FileStore<C: RecordCodec = PlainJson> {
    dir: PathBuf,
    codec: C,
    lock: RwLock<()>,
}

/// File store whose records are encrypted at rest.
pub type EncryptedFileStore = FileStore<Sealed>;

impl FileStore<PlainJson> {
    /// Open (or create) a plaintext JSON store in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::with_codec(dir, PlainJson)
    }
}

impl FileStore<Sealed> {
    /// Open (or create) an encrypted store in `dir`, loading the key from
    /// `key_path` or generating it on first use.
    pub fn open_encrypted(dir: impl Into<PathBuf>, key_path: &Path) -> Result<Self, StoreError> {
        let key = sealed::load_or_create_key(key_path)?;
        Self::with_codec(dir, Sealed::new(key))
    }
}

impl<C: RecordCodec> FileStore<C> {
    pub fn with_codec(dir: impl Into<PathBuf>, codec: C) -> Result<Self, StoreError> {
        let dir = dir.into();
        sealed::create_private_dir(&dir)?;
        Ok(Self {
            dir,
            codec,
            lock: RwLock::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}", C::EXTENSION))
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        match self.lock.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("file store lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        match self.lock.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("file store lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Read one record. `Ok(None)` when the file does not exist.
    fn read_record(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        let bytes = match fs::read(self.path_for(id)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payment = self.codec.decode(&bytes).map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        if payment.id != id {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                reason: format!("record claims id {}", payment.id),
            });
        }
        Ok(Some(payment))
    }

    fn write_record(&self, payment: &Payment) -> Result<(), StoreError> {
        let bytes = self.codec.encode(payment)?;
        sealed::write_private(&self.path_for(&payment.id), &bytes)?;
        Ok(())
    }

    /// Every decodable record in the directory.
    fn scan(&self) -> Result<Vec<Payment>, StoreError> {
        let mut payments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read store directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(C::EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_payment_id(id) {
                continue;
            }
            match self.read_record(id) {
                Ok(Some(payment)) => payments.push(payment),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable payment record");
                }
            }
        }
        Ok(payments)
    }
}

impl<C: RecordCodec> PaymentStore for FileStore<C> {
    fn create(&self, payment: &Payment) -> Result<(), StoreError> {
        if !is_valid_payment_id(&payment.id) {
            return Err(StoreError::InvalidId(payment.id.clone()));
        }
        let _guard = self.write_lock();
        if self.path_for(&payment.id).exists() {
            return Err(StoreError::Conflict(payment.id.clone()));
        }
        let existing = self.scan()?;
        if let Some(address) = payment
            .addresses
            .values()
            .find(|a| existing.iter().any(|p| p.currency_for_address(a).is_some()))
        {
            return Err(StoreError::Conflict(format!(
                "address {address} already assigned"
            )));
        }
        self.write_record(payment)
    }

    fn get(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        if !is_valid_payment_id(id) {
            return Ok(None);
        }
        let _guard = self.read_lock();
        self.read_record(id)
    }

    fn get_by_address(&self, address: &str) -> Result<Option<Payment>, StoreError> {
        let _guard = self.read_lock();
        Ok(self
            .scan()?
            .into_iter()
            .find(|p| p.currency_for_address(address).is_some()))
    }

    fn update(&self, payment: &Payment) -> Result<(), StoreError> {
        if !is_valid_payment_id(&payment.id) {
            return Err(StoreError::NotFound(payment.id.clone()));
        }
        let _guard = self.write_lock();
        let current = self
            .read_record(&payment.id)?
            .ok_or_else(|| StoreError::NotFound(payment.id.clone()))?;
        check_update(&current, payment)?;
        if current == *payment {
            return Ok(());
        }
        self.write_record(payment)
    }

    fn list_pending(&self, min_confirmations: u32) -> Result<Vec<Payment>, StoreError> {
        let _guard = self.read_lock();
        let mut pending: Vec<Payment> = self
            .scan()?
            .into_iter()
            .filter(|p| is_listed_pending(p, min_confirmations))
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::fixtures::payment;
    use crate::store::conformance::CHECKS;

    fn encrypted(dir: &Path) -> EncryptedFileStore {
        EncryptedFileStore::open_encrypted(dir.join("payments"), &dir.join("keys/store.key"))
            .unwrap()
    }

    #[test]
    fn test_file_store_conformance() {
        for check in CHECKS {
            let dir = tempfile::tempdir().unwrap();
            check(&FileStore::open(dir.path()).unwrap());
        }
    }

    #[test]
    fn test_encrypted_store_conformance() {
        for check in CHECKS {
            let dir = tempfile::tempdir().unwrap();
            check(&encrypted(dir.path()));
        }
    }

    #[test]
    fn test_file_layout_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let p = payment(1, 0);
        FileStore::open(dir.path()).unwrap().create(&p).unwrap();

        assert!(dir.path().join(format!("{}.json", p.id)).exists());
        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&p.id).unwrap(), Some(p));
    }

    #[test]
    fn test_encrypted_records_are_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = encrypted(dir.path());
        let p = payment(2, 0);
        store.create(&p).unwrap();

        let raw = fs::read(store.dir().join(format!("{}.enc", p.id))).unwrap();
        let needle = p.id.as_bytes();
        assert!(!raw.windows(needle.len()).any(|w| w == needle));

        // Same key file, new instance.
        assert_eq!(encrypted(dir.path()).get(&p.id).unwrap(), Some(p));
    }

    #[test]
    fn test_encrypted_store_rejects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = encrypted(dir.path());
        let p = payment(3, 0);
        store.create(&p).unwrap();

        let path = store.dir().join(format!("{}.enc", p.id));
        let mut raw = fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x80;
        fs::write(&path, &raw).unwrap();

        assert!(matches!(store.get(&p.id), Err(StoreError::Corrupt { .. })));
        // Scans skip the record instead of failing.
        assert!(store.list_pending(1).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = encrypted(dir.path());
        let p = payment(4, 0);
        store.create(&p).unwrap();

        let other = FileStore::with_codec(store.dir(), Sealed::new(Zeroizing::new([9u8; KEY_LEN])))
            .unwrap();
        assert!(other.get(&p.id).is_err());
    }

    #[test]
    fn test_scan_skips_corrupt_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.create(&payment(5, 0)).unwrap();
        fs::write(dir.path().join(format!("{}.json", "ab".repeat(16))), b"{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("short.json"), b"{}").unwrap();

        let pending = store.list_pending(1).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, payment(5, 0).id);
    }

    #[test]
    fn test_path_traversal_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("../secret").unwrap(), None);

        let mut p = payment(6, 0);
        p.id = "../../escape".to_string();
        assert!(matches!(store.create(&p), Err(StoreError::InvalidId(_))));
    }
}
