use rusqlite::{params, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use super::{check_update, PaymentStore};
use crate::error::StoreError;
use crate::payment::{Payment, PaymentStatus};

/// Persistent payment store backed by SQLite. Survives restarts.
///
/// The full record is kept as JSON; status, confirmations and addresses are
/// mirrored into indexed columns for lookups.
pub struct SqlitePaymentStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqlitePaymentStore {
    /// Open (or create) a SQLite payment database at the given path.
    ///
    /// On Unix systems, the database file permissions are restricted to 0600.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path)?;
        Self::init(&conn)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set payment database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                confirmations INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                record TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS payment_addresses (
                address TEXT PRIMARY KEY,
                payment_id TEXT NOT NULL REFERENCES payments(id),
                currency TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_pending ON payments(status, confirmations);
            PRAGMA journal_mode=WAL;",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("payment store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn load(conn: &rusqlite::Connection, id: &str) -> Result<Option<Payment>, StoreError> {
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM payments WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl PaymentStore for SqlitePaymentStore {
    fn create(&self, payment: &Payment) -> Result<(), StoreError> {
        let record = serde_json::to_string(payment)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO payments (id, status, confirmations, created_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                payment.id,
                payment.status.as_str(),
                payment.confirmations,
                payment.created_at.to_rfc3339(),
                record
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::Conflict(payment.id.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        for (currency, address) in &payment.addresses {
            tx.execute(
                "INSERT INTO payment_addresses (address, payment_id, currency) VALUES (?1, ?2, ?3)",
                params![address, payment.id, currency.code()],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::Conflict(format!("address {address} already assigned"))
                } else {
                    e.into()
                }
            })?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        let conn = self.lock();
        Self::load(&conn, id)
    }

    fn get_by_address(&self, address: &str) -> Result<Option<Payment>, StoreError> {
        let conn = self.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT payment_id FROM payment_addresses WHERE address = ?1",
                [address],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Self::load(&conn, &id),
            None => Ok(None),
        }
    }

    fn update(&self, payment: &Payment) -> Result<(), StoreError> {
        let record = serde_json::to_string(payment)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let current = Self::load(&tx, &payment.id)?
            .ok_or_else(|| StoreError::NotFound(payment.id.clone()))?;
        check_update(&current, payment)?;

        tx.execute(
            "UPDATE payments SET status = ?2, confirmations = ?3, record = ?4 WHERE id = ?1",
            params![
                payment.id,
                payment.status.as_str(),
                payment.confirmations,
                record
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_pending(&self, min_confirmations: u32) -> Result<Vec<Payment>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, record FROM payments
             WHERE status = ?1 AND confirmations < ?2
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(
            params![PaymentStatus::Pending.as_str(), min_confirmations],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut pending = Vec::new();
        for row in rows {
            let (id, json) = row?;
            match serde_json::from_str::<Payment>(&json) {
                Ok(p) => pending.push(p),
                Err(e) => {
                    tracing::warn!(payment_id = %id, error = %e, "skipping unreadable payment row");
                }
            }
        }
        Ok(pending)
    }
}
