//! Payment creation: one address per enabled currency, committed atomically.

use chrono::Utc;
use paygate_wallet::{AddressSource, Currency, DerivedAddress};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PaywallError;
use crate::metrics;
use crate::payment::Payment;
use crate::store::PaymentStore;

/// Default time a payment stays open (2 hours).
pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Issues payments and answers lookups.
///
/// Creation is all-or-nothing: if any address derivation or the store write
/// fails, every derivation made for that attempt is rolled back.
pub struct Paywall {
    store: Arc<dyn PaymentStore>,
    sources: BTreeMap<Currency, Arc<dyn AddressSource>>,
    prices: BTreeMap<Currency, Decimal>,
    payment_timeout: Duration,
}

/// Builder for [`Paywall`].
pub struct PaywallBuilder {
    store: Arc<dyn PaymentStore>,
    sources: BTreeMap<Currency, Arc<dyn AddressSource>>,
    prices: BTreeMap<Currency, Decimal>,
    payment_timeout: Duration,
}

impl PaywallBuilder {
    /// Accept `source.currency()` at `price`.
    pub fn with_source(mut self, source: Arc<dyn AddressSource>, price: Decimal) -> Self {
        let currency = source.currency();
        self.sources.insert(currency, source);
        self.prices.insert(currency, price);
        self
    }

    pub fn with_payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Paywall, PaywallError> {
        if let Some((currency, price)) = self.prices.iter().find(|(_, p)| **p <= Decimal::ZERO) {
            return Err(PaywallError::Config(format!(
                "{currency} price must be positive, got {price}"
            )));
        }
        if self.payment_timeout.is_zero() {
            return Err(PaywallError::Config(
                "payment timeout must be positive".to_string(),
            ));
        }
        chrono::Duration::from_std(self.payment_timeout)
            .map_err(|e| PaywallError::Config(format!("payment timeout out of range: {e}")))?;
        Ok(Paywall {
            store: self.store,
            sources: self.sources,
            prices: self.prices,
            payment_timeout: self.payment_timeout,
        })
    }
}

impl Paywall {
    pub fn builder(store: Arc<dyn PaymentStore>) -> PaywallBuilder {
        PaywallBuilder {
            store,
            sources: BTreeMap::new(),
            prices: BTreeMap::new(),
            payment_timeout: DEFAULT_PAYMENT_TIMEOUT,
        }
    }

    /// Currencies this paywall issues addresses for, in creation order.
    pub fn currencies(&self) -> impl Iterator<Item = Currency> + '_ {
        self.sources.keys().copied()
    }

    pub fn store(&self) -> &Arc<dyn PaymentStore> {
        &self.store
    }

    pub fn payment_timeout(&self) -> Duration {
        self.payment_timeout
    }

    /// Issue a new pending payment with a fresh address for every enabled
    /// currency and persist it.
    pub async fn create_payment(&self) -> Result<Payment, PaywallError> {
        let result = self.try_create_payment().await;
        let label = if result.is_ok() { "ok" } else { "error" };
        metrics::PAYMENTS_CREATED.with_label_values(&[label]).inc();
        result
    }

    async fn try_create_payment(&self) -> Result<Payment, PaywallError> {
        if self.sources.is_empty() {
            return Err(PaywallError::Config(
                "no currencies enabled".to_string(),
            ));
        }

        let mut issued: Vec<(&Arc<dyn AddressSource>, DerivedAddress)> =
            Vec::with_capacity(self.sources.len());
        for (currency, source) in &self.sources {
            match source.derive_next_address().await {
                Ok(derived) => issued.push((source, derived)),
                Err(e) => {
                    tracing::warn!(currency = %currency, error = %e, "address derivation failed");
                    self.roll_back(&issued).await;
                    return Err(PaywallError::Derivation {
                        currency: *currency,
                        source: e,
                    });
                }
            }
        }

        let id = match generate_payment_id() {
            Ok(id) => id,
            Err(e) => {
                self.roll_back(&issued).await;
                return Err(e);
            }
        };

        let addresses: BTreeMap<Currency, String> = issued
            .iter()
            .map(|(_, d)| (d.currency, d.address.clone()))
            .collect();
        let created_at = Utc::now();
        // Range checked in build().
        let timeout = chrono::Duration::from_std(self.payment_timeout).unwrap_or_default();
        let payment = Payment::new(
            id,
            addresses,
            self.prices.clone(),
            created_at,
            created_at + timeout,
        );

        if let Err(e) = self.store.create(&payment) {
            tracing::warn!(payment_id = %payment.id, error = %e, "failed to persist payment");
            self.roll_back(&issued).await;
            return Err(PaywallError::Store {
                op: "create",
                source: e,
            });
        }

        tracing::info!(
            payment_id = %payment.id,
            currencies = payment.addresses.len(),
            expires_at = %payment.expires_at,
            "payment created"
        );
        Ok(payment)
    }

    /// Undo derivations newest first.
    async fn roll_back(&self, issued: &[(&Arc<dyn AddressSource>, DerivedAddress)]) {
        for (source, derived) in issued.iter().rev() {
            if !source.rollback_last_derivation(derived).await {
                tracing::warn!(
                    currency = %derived.currency,
                    index = derived.index,
                    "derivation superseded before rollback, address left unused"
                );
            }
        }
    }

    pub fn get_payment(&self, id: &str) -> Result<Option<Payment>, PaywallError> {
        self.store.get(id).map_err(PaywallError::store("get"))
    }

    pub fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, PaywallError> {
        self.store
            .get_by_address(address)
            .map_err(PaywallError::store("get_by_address"))
    }
}

/// 16 bytes from the OS CSPRNG, lowercase hex.
pub fn generate_payment_id() -> Result<String, PaywallError> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|e| PaywallError::Entropy(e.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::payment::is_valid_payment_id;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use paygate_wallet::{HdAddressSource, Network, WalletError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Store that can be told to fail writes and counts calls.
    struct FlakyStore {
        inner: MemoryStore,
        fail_create: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_create: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_create: AtomicBool::new(fail_create),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PaymentStore for FlakyStore {
        fn create(&self, payment: &Payment) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.create(payment)
        }
        fn get(&self, id: &str) -> Result<Option<Payment>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id)
        }
        fn get_by_address(&self, address: &str) -> Result<Option<Payment>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_by_address(address)
        }
        fn update(&self, payment: &Payment) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.update(payment)
        }
        fn list_pending(&self, min: u32) -> Result<Vec<Payment>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.list_pending(min)
        }
    }

    /// Counter-only source for a second currency.
    struct CountingSource {
        currency: Currency,
        next: std::sync::Mutex<u32>,
        fail: bool,
    }

    impl CountingSource {
        fn new(currency: Currency, fail: bool) -> Self {
            Self {
                currency,
                next: std::sync::Mutex::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl AddressSource for CountingSource {
        fn currency(&self) -> Currency {
            self.currency
        }
        async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError> {
            if self.fail {
                return Err(WalletError::Rpc("wallet offline".to_string()));
            }
            let mut next = self.next.lock().unwrap();
            let index = *next;
            *next += 1;
            Ok(DerivedAddress {
                currency: self.currency,
                address: format!("{}-{index}", self.currency),
                index,
                previous_next_index: index,
            })
        }
        async fn current_address(&self) -> Result<String, WalletError> {
            let next = *self.next.lock().unwrap();
            Ok(format!("{}-{}", self.currency, next.saturating_sub(1)))
        }
        async fn rollback_last_derivation(&self, d: &DerivedAddress) -> bool {
            let mut next = self.next.lock().unwrap();
            if *next != d.index + 1 {
                return false;
            }
            *next = d.previous_next_index;
            true
        }
        async fn next_index(&self) -> u32 {
            *self.next.lock().unwrap()
        }
    }

    fn btc() -> Arc<HdAddressSource> {
        Arc::new(HdAddressSource::from_seed(&[0x42u8; 32], Network::Mainnet).unwrap())
    }

    #[tokio::test]
    async fn test_create_payment_populates_every_currency() {
        let store = Arc::new(MemoryStore::new());
        let xmr = Arc::new(CountingSource::new(Currency::Monero, false));
        let paywall = Paywall::builder(store.clone())
            .with_source(btc(), Decimal::new(1, 4))
            .with_source(xmr, Decimal::new(1, 3))
            .with_payment_timeout(Duration::from_secs(60))
            .build()
            .unwrap();

        let payment = paywall.create_payment().await.unwrap();
        assert!(is_valid_payment_id(&payment.id));
        assert_eq!(payment.addresses.len(), 2);
        assert!(payment.addresses.keys().eq(payment.amounts.keys()));
        assert_eq!(payment.amounts[&Currency::Monero], Decimal::new(1, 3));
        assert_eq!(payment.confirmations, 0);
        assert!(payment.is_pending());
        assert_eq!(
            (payment.expires_at - payment.created_at).num_seconds(),
            60
        );

        assert_eq!(paywall.get_payment(&payment.id).unwrap(), Some(payment.clone()));
        let btc_address = &payment.addresses[&Currency::Bitcoin];
        assert_eq!(
            paywall.get_payment_by_address(btc_address).unwrap().map(|p| p.id),
            Some(payment.id)
        );
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_every_source() {
        let store = Arc::new(FlakyStore::new(true));
        let btc = btc();
        let xmr = Arc::new(CountingSource::new(Currency::Monero, false));
        let paywall = Paywall::builder(store.clone())
            .with_source(btc.clone(), Decimal::new(1, 4))
            .with_source(xmr.clone(), Decimal::new(1, 3))
            .build()
            .unwrap();

        let err = paywall.create_payment().await.unwrap_err();
        assert!(matches!(err, PaywallError::Store { op: "create", .. }));
        assert_eq!(btc.next_index().await, 0);
        assert_eq!(xmr.next_index().await, 0);

        store.fail_create.store(false, Ordering::SeqCst);
        let payment = paywall.create_payment().await.unwrap();
        assert_eq!(payment.addresses[&Currency::Monero], "XMR-0");
        assert_eq!(btc.next_index().await, 1);
    }

    #[tokio::test]
    async fn test_derivation_failure_rolls_back_earlier_sources() {
        let store = Arc::new(FlakyStore::new(false));
        let btc = btc();
        let paywall = Paywall::builder(store.clone())
            .with_source(btc.clone(), Decimal::new(1, 4))
            .with_source(Arc::new(CountingSource::new(Currency::Monero, true)), Decimal::new(1, 3))
            .build()
            .unwrap();

        let err = paywall.create_payment().await.unwrap_err();
        assert!(matches!(
            err,
            PaywallError::Derivation {
                currency: Currency::Monero,
                ..
            }
        ));
        assert_eq!(btc.next_index().await, 0);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_no_currencies_is_config_error_without_touching_store() {
        let store = Arc::new(FlakyStore::new(false));
        let paywall = Paywall::builder(store.clone()).build().unwrap();
        assert!(matches!(
            paywall.create_payment().await,
            Err(PaywallError::Config(_))
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_creations_never_share_addresses() {
        let store = Arc::new(MemoryStore::new());
        let paywall = Arc::new(
            Paywall::builder(store.clone())
                .with_source(btc(), Decimal::new(1, 4))
                .build()
                .unwrap(),
        );

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let paywall = Arc::clone(&paywall);
                tokio::spawn(async move { paywall.create_payment().await.unwrap() })
            })
            .collect();
        let mut addresses = std::collections::HashSet::new();
        for task in tasks {
            let payment = task.await.unwrap();
            assert!(addresses.insert(payment.addresses[&Currency::Bitcoin].clone()));
        }
        assert_eq!(store.len(), 16);
    }

    #[test]
    fn test_build_rejects_non_positive_price() {
        let result = Paywall::builder(Arc::new(MemoryStore::new()))
            .with_source(btc(), Decimal::ZERO)
            .build();
        assert!(matches!(result, Err(PaywallError::Config(_))));
    }

    #[test]
    fn test_payment_ids_are_unique_hex() {
        let a = generate_payment_id().unwrap();
        let b = generate_payment_id().unwrap();
        assert!(is_valid_payment_id(&a));
        assert_ne!(a, b);
    }
}
