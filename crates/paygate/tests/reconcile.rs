//! End-to-end flows through the public API: create a payment with real HD
//! derivation, pay it through a scripted client, and let the monitor settle it.

use async_trait::async_trait;
use paygate::wallet::{AddressSource, HdAddressSource, Network};
use paygate::{
    ClientBinding, ClientError, ConfirmationModel, CryptoClient, Currency, FileStore,
    MemoryStore, MonitorConfig, Payment, PaymentStatus, PaymentStore, Paywall, PaywallError,
    ReconciliationMonitor, StoreError,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory "chain": balances and transactions keyed by address.
#[derive(Default)]
struct FakeChain {
    received: Mutex<HashMap<String, (Decimal, String, u32)>>,
}

impl FakeChain {
    fn pay(&self, address: &str, amount: Decimal, tx_id: &str, confirmations: u32) {
        self.received
            .lock()
            .unwrap()
            .insert(address.to_string(), (amount, tx_id.to_string(), confirmations));
    }
}

#[async_trait]
impl CryptoClient for FakeChain {
    async fn get_address_balance(&self, address: &str) -> Result<Decimal, ClientError> {
        Ok(self
            .received
            .lock()
            .unwrap()
            .get(address)
            .map(|(amount, _, _)| *amount)
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_transaction_confirmations(&self, tx_id: &str) -> Result<u32, ClientError> {
        self.received
            .lock()
            .unwrap()
            .values()
            .find(|(_, id, _)| id == tx_id)
            .map(|(_, _, confirmations)| *confirmations)
            .ok_or_else(|| ClientError::InvalidResponse(format!("unknown tx {tx_id}")))
    }

    async fn find_incoming_transaction(&self, address: &str) -> Result<Option<String>, ClientError> {
        Ok(self
            .received
            .lock()
            .unwrap()
            .get(address)
            .map(|(_, tx_id, _)| tx_id.clone()))
    }
}

/// Delegates to an inner store but can be told to refuse creates.
struct GatedStore {
    inner: MemoryStore,
    refuse_creates: AtomicBool,
}

impl PaymentStore for GatedStore {
    fn create(&self, payment: &Payment) -> Result<(), StoreError> {
        if self.refuse_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.create(payment)
    }
    fn get(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        self.inner.get(id)
    }
    fn get_by_address(&self, address: &str) -> Result<Option<Payment>, StoreError> {
        self.inner.get_by_address(address)
    }
    fn update(&self, payment: &Payment) -> Result<(), StoreError> {
        self.inner.update(payment)
    }
    fn list_pending(&self, min_confirmations: u32) -> Result<Vec<Payment>, StoreError> {
        self.inner.list_pending(min_confirmations)
    }
}

fn hd_source() -> Arc<HdAddressSource> {
    Arc::new(HdAddressSource::from_seed(&[42u8; 32], Network::Testnet).unwrap())
}

fn monitor(store: Arc<dyn PaymentStore>, chain: Arc<FakeChain>, min_confirmations: u32) -> ReconciliationMonitor {
    ReconciliationMonitor::new(
        store,
        [Currency::Bitcoin],
        HashMap::from([(
            Currency::Bitcoin,
            ClientBinding::new(chain, ConfirmationModel::TransactionLookup),
        )]),
        MonitorConfig {
            min_confirmations,
            ..MonitorConfig::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn payment_is_confirmed_once_deep_enough_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn PaymentStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let source = hd_source();
    let paywall = Paywall::builder(store.clone())
        .with_source(source.clone(), Decimal::new(1, 4))
        .build()
        .unwrap();

    let payment = paywall.create_payment().await.unwrap();
    let address = payment.addresses[&Currency::Bitcoin].clone();
    assert_eq!(address, source.address_at(0).unwrap());
    assert!(address.starts_with('m') || address.starts_with('n'));

    let chain = Arc::new(FakeChain::default());
    let monitor = monitor(store.clone(), chain.clone(), 3);

    // Unpaid: nothing changes, and the base interval is kept.
    assert_eq!(monitor.poll_once().await, Duration::from_secs(10));
    assert_eq!(store.get(&payment.id).unwrap().unwrap().status, PaymentStatus::Pending);

    chain.pay(&address, Decimal::new(1, 4), "abc123", 1);
    monitor.poll_once().await;
    let seen = store.get(&payment.id).unwrap().unwrap();
    assert_eq!(seen.status, PaymentStatus::Pending);
    assert_eq!(seen.confirmations, 1);
    assert_eq!(seen.transaction_id.as_deref(), Some("abc123"));

    chain.pay(&address, Decimal::new(1, 4), "abc123", 3);
    monitor.poll_once().await;

    let reopened = FileStore::open(dir.path()).unwrap();
    let settled = reopened.get(&payment.id).unwrap().unwrap();
    assert_eq!(settled.status, PaymentStatus::Confirmed);
    assert_eq!(settled.confirmations, 3);
    assert!(reopened.list_pending(3).unwrap().is_empty());
    assert_eq!(
        paywall.get_payment_by_address(&address).unwrap().map(|p| p.id),
        Some(payment.id)
    );
}

#[tokio::test]
async fn failed_persist_reissues_the_same_address() {
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        refuse_creates: AtomicBool::new(true),
    });
    let source = hd_source();
    let paywall = Paywall::builder(store.clone())
        .with_source(source.clone(), Decimal::new(1, 4))
        .build()
        .unwrap();

    let err = paywall.create_payment().await.unwrap_err();
    assert!(matches!(err, PaywallError::Store { .. }));
    assert_eq!(source.next_index().await, 0);
    assert!(store.inner.is_empty());

    store.refuse_creates.store(false, Ordering::SeqCst);
    let payment = paywall.create_payment().await.unwrap();
    assert_eq!(
        payment.addresses[&Currency::Bitcoin],
        source.address_at(0).unwrap()
    );
    assert_eq!(source.next_index().await, 1);
}

#[tokio::test]
async fn settled_payments_are_not_revisited() {
    let store = Arc::new(MemoryStore::new());
    let paywall = Paywall::builder(store.clone())
        .with_source(hd_source(), Decimal::new(1, 4))
        .build()
        .unwrap();
    let first = paywall.create_payment().await.unwrap();
    let second = paywall.create_payment().await.unwrap();
    assert_ne!(
        first.addresses[&Currency::Bitcoin],
        second.addresses[&Currency::Bitcoin]
    );

    let chain = Arc::new(FakeChain::default());
    chain.pay(&first.addresses[&Currency::Bitcoin], Decimal::new(1, 4), "tx-first", 6);
    let monitor = monitor(store.clone(), chain.clone(), 1);

    let report = monitor.run_cycle().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.confirmed, 1);

    let pending: Vec<String> = store.list_pending(1).unwrap().into_iter().map(|p| p.id).collect();
    assert_eq!(pending, vec![second.id.clone()]);

    let report = monitor.run_cycle().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.confirmed, 0);
}
