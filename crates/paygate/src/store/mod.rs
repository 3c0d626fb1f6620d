//! Payment persistence.
//!
//! [`PaymentStore`] is the only shared mutable resource in the system; each
//! backend carries its own locking so every method is safe to call
//! concurrently.

mod file;
mod memory;
mod sqlite;

pub use file::{EncryptedFileStore, FileStore, PlainJson, RecordCodec, Sealed};
pub use memory::MemoryStore;
pub use sqlite::SqlitePaymentStore;

use crate::error::StoreError;
use crate::payment::Payment;

/// Trait for payment storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait PaymentStore: Send + Sync {
    /// Insert a new payment. Fails with [`StoreError::Conflict`] if the id exists.
    fn create(&self, payment: &Payment) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<Payment>, StoreError>;

    /// Find the payment that owns `address` in any currency.
    fn get_by_address(&self, address: &str) -> Result<Option<Payment>, StoreError>;

    /// Replace an existing payment. Writing an identical record is a no-op
    /// success; leaving a terminal status or changing an immutable field is
    /// rejected.
    fn update(&self, payment: &Payment) -> Result<(), StoreError>;

    /// Pending payments with fewer than `min_confirmations` confirmations.
    fn list_pending(&self, min_confirmations: u32) -> Result<Vec<Payment>, StoreError>;
}

/// Selection rule shared by every backend's `list_pending`.
pub(crate) fn is_listed_pending(payment: &Payment, min_confirmations: u32) -> bool {
    payment.is_pending() && payment.confirmations < min_confirmations
}

/// Validate replacing `current` with `next`.
pub(crate) fn check_update(current: &Payment, next: &Payment) -> Result<(), StoreError> {
    if !current.status.can_transition_to(next.status) {
        return Err(StoreError::InvalidTransition {
            id: current.id.clone(),
            from: current.status,
            to: next.status,
        });
    }
    let immutable = [
        ("addresses", current.addresses != next.addresses),
        ("amounts", current.amounts != next.amounts),
        ("created_at", current.created_at != next.created_at),
        ("expires_at", current.expires_at != next.expires_at),
    ];
    if let Some((field, _)) = immutable.into_iter().find(|(_, changed)| *changed) {
        return Err(StoreError::ImmutableField {
            id: current.id.clone(),
            field,
        });
    }
    Ok(())
}
