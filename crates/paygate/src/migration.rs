//! One-shot conversion of a plaintext file store into an encrypted one.

use std::fs;
use std::path::Path;

use crate::error::StoreError;
use crate::payment::is_valid_payment_id;
use crate::store::{EncryptedFileStore, PaymentStore, PlainJson, RecordCodec};

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationOptions {
    /// Delete each `<id>.json` once an identical encrypted copy exists.
    pub remove_plaintext: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Records newly encrypted.
    pub processed: usize,
    /// Records that already had an identical encrypted copy.
    pub skipped: usize,
    /// Records whose existing encrypted copy differs from the plaintext.
    /// Neither side is touched.
    pub diverged: usize,
    /// Records that could not be read or written.
    pub failed: usize,
}

/// Encrypt every `<id>.json` record in `dir` into `<id>.enc` alongside it,
/// using (or creating) the key at `key_path`. Existing encrypted records are
/// never overwritten. Per-record failures are counted, not fatal.
pub fn encrypt_existing(
    dir: &Path,
    key_path: &Path,
    options: MigrationOptions,
) -> Result<MigrationReport, StoreError> {
    let encrypted = EncryptedFileStore::open_encrypted(dir, key_path)?;
    let mut report = MigrationReport::default();

    for entry in fs::read_dir(dir)? {
        let path = match entry {
            Ok(e) => e.path(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read store directory entry");
                report.failed += 1;
                continue;
            }
        };
        if path.extension().and_then(|e| e.to_str()) != Some(PlainJson::EXTENSION) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_valid_payment_id(id) {
            continue;
        }

        let payment = match fs::read(&path)
            .map_err(StoreError::from)
            .and_then(|bytes| PlainJson.decode(&bytes))
        {
            Ok(p) if p.id == id => p,
            Ok(p) => {
                tracing::warn!(path = %path.display(), claimed_id = %p.id, "record id does not match file name");
                report.failed += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read plaintext record");
                report.failed += 1;
                continue;
            }
        };

        match encrypted.create(&payment) {
            Ok(()) => report.processed += 1,
            Err(StoreError::Conflict(_)) => match encrypted.get(id) {
                Ok(Some(existing)) if existing == payment => {
                    tracing::debug!(payment_id = %id, "encrypted record already exists");
                    report.skipped += 1;
                }
                Ok(_) => {
                    tracing::warn!(
                        payment_id = %id,
                        "encrypted record differs from plaintext, leaving both in place"
                    );
                    report.diverged += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(payment_id = %id, error = %e, "failed to read existing encrypted record");
                    report.failed += 1;
                    continue;
                }
            },
            Err(e) => {
                tracing::warn!(payment_id = %id, error = %e, "failed to encrypt record");
                report.failed += 1;
                continue;
            }
        }

        if options.remove_plaintext {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove plaintext record");
            }
        }
    }

    tracing::info!(
        processed = report.processed,
        skipped = report.skipped,
        diverged = report.diverged,
        failed = report.failed,
        dir = %dir.display(),
        "store encryption finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::fixtures::payment;
    use crate::store::FileStore;

    #[test]
    fn test_encrypts_plaintext_records() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("keys/store.key");
        let plain = FileStore::open(dir.path()).unwrap();
        plain.create(&payment(1, 0)).unwrap();
        plain.create(&payment(2, 3)).unwrap();

        let report = encrypt_existing(dir.path(), &key, MigrationOptions::default()).unwrap();
        assert_eq!(
            report,
            MigrationReport {
                processed: 2,
                ..MigrationReport::default()
            }
        );

        let encrypted = EncryptedFileStore::open_encrypted(dir.path(), &key).unwrap();
        assert_eq!(encrypted.get(&payment(2, 3).id).unwrap(), Some(payment(2, 3)));
        // Plaintext kept unless asked otherwise.
        assert!(plain.get(&payment(1, 0).id).unwrap().is_some());
    }

    #[test]
    fn test_rerun_skips_and_removes_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("store.key");
        let plain = FileStore::open(dir.path()).unwrap();
        plain.create(&payment(1, 0)).unwrap();

        encrypt_existing(dir.path(), &key, MigrationOptions::default()).unwrap();
        let report = encrypt_existing(
            dir.path(),
            &key,
            MigrationOptions {
                remove_plaintext: true,
            },
        )
        .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        assert!(plain.get(&payment(1, 0).id).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_plaintext_counts_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("store.key");
        fs::write(dir.path().join(format!("{}.json", payment(1, 0).id)), b"{oops").unwrap();
        fs::write(dir.path().join("notes.json"), b"{}").unwrap();

        let report = encrypt_existing(dir.path(), &key, MigrationOptions { remove_plaintext: true }).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 0);
        // Failed records are left in place.
        assert!(dir.path().join(format!("{}.json", payment(1, 0).id)).exists());
    }

    #[test]
    fn test_newer_plaintext_is_kept_when_encrypted_copy_differs() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("store.key");
        let plain = FileStore::open(dir.path()).unwrap();
        let mut p = payment(1, 0);
        plain.create(&p).unwrap();
        encrypt_existing(dir.path(), &key, MigrationOptions::default()).unwrap();

        // The plaintext store kept running after the first pass.
        p.status = crate::payment::PaymentStatus::Confirmed;
        p.confirmations = 2;
        plain.update(&p).unwrap();

        let report = encrypt_existing(
            dir.path(),
            &key,
            MigrationOptions {
                remove_plaintext: true,
            },
        )
        .unwrap();
        assert_eq!(report.diverged, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(plain.get(&p.id).unwrap(), Some(p));
    }
}
