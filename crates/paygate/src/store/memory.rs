use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{check_update, is_listed_pending, PaymentStore};
use crate::error::StoreError;
use crate::payment::Payment;

/// In-memory payment store backed by DashMap. Fast but lost on restart.
pub struct MemoryStore {
    payments: DashMap<String, Payment>,
    by_address: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            payments: DashMap::new(),
            by_address: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentStore for MemoryStore {
    fn create(&self, payment: &Payment) -> Result<(), StoreError> {
        match self.payments.entry(payment.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(payment.id.clone())),
            Entry::Vacant(v) => {
                let mut claimed = Vec::new();
                for address in payment.addresses.values() {
                    let taken = match self.by_address.entry(address.clone()) {
                        Entry::Occupied(_) => true,
                        Entry::Vacant(slot) => {
                            slot.insert(payment.id.clone());
                            false
                        }
                    };
                    if taken {
                        for claimed in claimed {
                            self.by_address.remove(claimed);
                        }
                        return Err(StoreError::Conflict(format!(
                            "address {address} already assigned"
                        )));
                    }
                    claimed.push(address);
                }
                v.insert(payment.clone());
                Ok(())
            }
        }
    }

    fn get(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        Ok(self.payments.get(id).map(|p| p.value().clone()))
    }

    fn get_by_address(&self, address: &str) -> Result<Option<Payment>, StoreError> {
        let id = match self.by_address.get(address) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        self.get(&id)
    }

    fn update(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut current = self
            .payments
            .get_mut(&payment.id)
            .ok_or_else(|| StoreError::NotFound(payment.id.clone()))?;
        check_update(&current, payment)?;
        *current = payment.clone();
        Ok(())
    }

    fn list_pending(&self, min_confirmations: u32) -> Result<Vec<Payment>, StoreError> {
        let mut pending: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| is_listed_pending(p.value(), min_confirmations))
            .map(|p| p.value().clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance::CHECKS;

    #[test]
    fn test_memory_store_conformance() {
        for check in CHECKS {
            check(&MemoryStore::new());
        }
    }

    #[test]
    fn test_concurrent_creates_with_same_id_admit_one() {
        use std::sync::Arc;
        let store = Arc::new(MemoryStore::new());
        let payment = crate::payment::fixtures::payment(9, 0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let payment = payment.clone();
                std::thread::spawn(move || store.create(&payment).is_ok())
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }
}
