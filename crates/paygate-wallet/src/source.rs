//! Address sources: the only producers of payment addresses.
//!
//! Each source owns one monotonically increasing counter. Derivation and
//! rollback for a source go through a single lock, so concurrent callers
//! always receive distinct addresses.

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::address::{p2pkh_address, Network};
use crate::currency::Currency;
use crate::error::WalletError;
use crate::hd::{bip44_external_chain, ExtendedKey, HARDENED};
use crate::storage::{WalletSnapshot, WalletStorage};

/// Upper bound on consecutive invalid child keys skipped in one derivation.
/// Each skip has probability below 2^-127, so hitting this means broken keys.
const MAX_INVALID_SKIPS: u32 = 16;

/// Seed length used when creating a fresh wallet.
const NEW_WALLET_SEED_LEN: usize = 64;

/// Receipt for one derivation, used to roll it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub currency: Currency,
    pub address: String,
    /// Index the address was derived at.
    pub index: u32,
    /// Counter value before this derivation.
    pub previous_next_index: u32,
}

/// A per-currency deterministic address generator.
#[async_trait]
pub trait AddressSource: Send + Sync {
    fn currency(&self) -> Currency;

    /// Derive the next unused address and advance the counter.
    async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError>;

    /// Most recently issued address. Issues the first one if none exists yet.
    async fn current_address(&self) -> Result<String, WalletError>;

    /// Undo `derivation` if it is still the latest one for this source.
    /// Returns `false` (and changes nothing) otherwise.
    async fn rollback_last_derivation(&self, derivation: &DerivedAddress) -> bool;

    /// Index the next derivation will start from.
    async fn next_index(&self) -> u32;
}

/// Run `derive` from `start`, moving to the next index whenever it reports an
/// invalid child key. Returns the index actually used and its address.
pub(crate) fn derive_skipping_invalid<F>(
    start: u32,
    mut derive: F,
) -> Result<(u32, String), WalletError>
where
    F: FnMut(u32) -> Result<String, WalletError>,
{
    let mut index = start;
    for _ in 0..=MAX_INVALID_SKIPS {
        if index >= HARDENED {
            return Err(WalletError::IndexExhausted);
        }
        match derive(index) {
            Ok(address) => return Ok((index, address)),
            Err(WalletError::InvalidChildKey { .. }) => {
                tracing::warn!(index, "invalid child key, skipping to next index");
                index += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Err(WalletError::InvalidKey(format!(
        "more than {MAX_INVALID_SKIPS} consecutive invalid child keys from index {start}"
    )))
}

/// Local BIP44 derivation of P2PKH addresses along `m/44'/coin'/0'/0/i`.
pub struct HdAddressSource {
    master: ExtendedKey,
    external_chain: ExtendedKey,
    network: Network,
    next_index: Mutex<u32>,
    storage: Option<WalletStorage>,
}

impl HdAddressSource {
    /// Fresh source from a seed of 16 to 64 bytes, starting at index 0.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, WalletError> {
        Self::from_master(ExtendedKey::from_seed(seed)?, network, 0)
    }

    /// Resume from a master key and a counter value.
    pub fn from_master(
        master: ExtendedKey,
        network: Network,
        next_index: u32,
    ) -> Result<Self, WalletError> {
        let external_chain =
            master.derive_path(&bip44_external_chain(network.bip44_coin_type(), 0))?;
        Ok(Self {
            master,
            external_chain,
            network,
            next_index: Mutex::new(next_index),
            storage: None,
        })
    }

    /// Load the wallet in `dir` (sealed with the key at `key_path`), or create
    /// one from a fresh random seed. The returned source checkpoints its
    /// counter to disk after every derivation and rollback.
    pub fn open_or_create(
        dir: &Path,
        key_path: &Path,
        network: Network,
    ) -> Result<Self, WalletError> {
        let storage = WalletStorage::open(dir, key_path)?;
        match storage.load()? {
            Some(snapshot) => {
                if snapshot.network != network {
                    return Err(WalletError::Storage(format!(
                        "wallet at {} is for {:?}, configured network is {:?}",
                        storage.path().display(),
                        snapshot.network,
                        network
                    )));
                }
                tracing::info!(
                    path = %storage.path().display(),
                    next_index = snapshot.next_index,
                    "loaded HD wallet"
                );
                Ok(Self::from_master(snapshot.master, network, snapshot.next_index)?
                    .with_storage(storage))
            }
            None => {
                let seed = random_seed()?;
                let source = Self::from_seed(&seed, network)?.with_storage(storage);
                source.persist(0)?;
                tracing::info!(path = %dir.display(), "created new HD wallet");
                Ok(source)
            }
        }
    }

    /// Checkpoint the counter to `storage` after every change.
    pub fn with_storage(mut self, storage: WalletStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Address at external-chain `index`.
    pub fn address_at(&self, index: u32) -> Result<String, WalletError> {
        let child = self.external_chain.derive_child(index)?;
        Ok(p2pkh_address(&child.public_key()?, self.network))
    }

    fn lock_index(&self) -> MutexGuard<'_, u32> {
        match self.next_index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("address index mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Derive at `*next` and advance it. The caller holds the index guard.
    fn derive_locked(&self, next: &mut u32) -> Result<DerivedAddress, WalletError> {
        let previous = *next;
        let (index, address) = derive_skipping_invalid(previous, |i| self.address_at(i))?;
        let advanced = index + 1;

        // The counter only moves once the new value is durable.
        self.persist(advanced)?;
        *next = advanced;

        tracing::debug!(index, address = %address, "derived address");
        Ok(DerivedAddress {
            currency: Currency::Bitcoin,
            address,
            index,
            previous_next_index: previous,
        })
    }

    fn persist(&self, next_index: u32) -> Result<(), WalletError> {
        match &self.storage {
            Some(storage) => storage.save(&WalletSnapshot {
                master: self.master.clone(),
                network: self.network,
                next_index,
            }),
            None => Ok(()),
        }
    }
}

fn random_seed() -> Result<zeroize::Zeroizing<Vec<u8>>, WalletError> {
    let mut seed = zeroize::Zeroizing::new(vec![0u8; NEW_WALLET_SEED_LEN]);
    getrandom::fill(&mut seed[..]).map_err(|e| WalletError::Crypto(format!("rng failure: {e}")))?;
    Ok(seed)
}

#[async_trait]
impl AddressSource for HdAddressSource {
    fn currency(&self) -> Currency {
        Currency::Bitcoin
    }

    async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError> {
        let mut next = self.lock_index();
        self.derive_locked(&mut next)
    }

    async fn current_address(&self) -> Result<String, WalletError> {
        let mut next = self.lock_index();
        if *next == 0 {
            return self.derive_locked(&mut next).map(|d| d.address);
        }
        self.address_at(*next - 1)
    }

    async fn rollback_last_derivation(&self, derivation: &DerivedAddress) -> bool {
        if derivation.currency != Currency::Bitcoin {
            return false;
        }
        let mut next = self.lock_index();
        let is_latest = *next == derivation.index.saturating_add(1)
            && derivation.previous_next_index <= derivation.index;
        if !is_latest {
            tracing::debug!(
                index = derivation.index,
                next_index = *next,
                "rollback skipped, derivation is no longer the latest"
            );
            return false;
        }
        *next = derivation.previous_next_index;
        if let Err(e) = self.persist(*next) {
            tracing::warn!(error = %e, "failed to checkpoint wallet after rollback");
        }
        true
    }

    async fn next_index(&self) -> u32 {
        *self.lock_index()
    }
}

/// Remote wallet that mints subaddresses (e.g. `monero-wallet-rpc`).
#[async_trait]
pub trait SubaddressRpc: Send + Sync {
    /// Create a new subaddress under `account_index`. Returns the wallet's
    /// address index and the address.
    async fn create_address(
        &self,
        account_index: u32,
        label: &str,
    ) -> Result<(u32, String), WalletError>;

    /// Read back an existing subaddress.
    async fn get_address(&self, account_index: u32, address_index: u32)
        -> Result<String, WalletError>;
}

#[derive(Debug, Default)]
struct SubaddressState {
    next_label: u32,
    /// Wallet-side address index of the latest allocation.
    last_address_index: Option<u32>,
    /// Allocation history as `(label counter, wallet address index)`; used to
    /// restore `last_address_index` on rollback.
    history: Vec<(u32, u32)>,
}

/// Delegates address minting to a remote wallet, labelling each allocation
/// `payment-<n>`.
pub struct SubaddressSource {
    currency: Currency,
    rpc: Arc<dyn SubaddressRpc>,
    account_index: u32,
    state: tokio::sync::Mutex<SubaddressState>,
}

impl SubaddressSource {
    pub fn new(currency: Currency, rpc: Arc<dyn SubaddressRpc>) -> Self {
        Self {
            currency,
            rpc,
            account_index: 0,
            state: tokio::sync::Mutex::new(SubaddressState::default()),
        }
    }

    pub fn with_account_index(mut self, account_index: u32) -> Self {
        self.account_index = account_index;
        self
    }

    /// Resume labelling at `next_label`.
    pub fn with_next_label(self, next_label: u32) -> Self {
        let state = SubaddressState {
            next_label,
            ..SubaddressState::default()
        };
        Self {
            state: tokio::sync::Mutex::new(state),
            ..self
        }
    }

    async fn allocate(&self, state: &mut SubaddressState) -> Result<DerivedAddress, WalletError> {
        let previous = state.next_label;
        let label = format!("payment-{previous}");
        let (address_index, address) = self
            .rpc
            .create_address(self.account_index, &label)
            .await
            .map_err(|e| {
                tracing::warn!(currency = %self.currency, label = %label, error = %e, "subaddress allocation failed");
                e
            })?;

        state.next_label = previous.checked_add(1).ok_or(WalletError::IndexExhausted)?;
        state.last_address_index = Some(address_index);
        state.history.push((previous, address_index));

        tracing::debug!(currency = %self.currency, address_index, label = %label, "allocated subaddress");
        Ok(DerivedAddress {
            currency: self.currency,
            address,
            index: previous,
            previous_next_index: previous,
        })
    }
}

#[async_trait]
impl AddressSource for SubaddressSource {
    fn currency(&self) -> Currency {
        self.currency
    }

    async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError> {
        let mut state = self.state.lock().await;
        self.allocate(&mut state).await
    }

    async fn current_address(&self) -> Result<String, WalletError> {
        let mut state = self.state.lock().await;
        match state.last_address_index {
            Some(address_index) => self.rpc.get_address(self.account_index, address_index).await,
            None => self.allocate(&mut state).await.map(|d| d.address),
        }
    }

    async fn rollback_last_derivation(&self, derivation: &DerivedAddress) -> bool {
        if derivation.currency != self.currency {
            return false;
        }
        let mut state = self.state.lock().await;
        let is_latest = matches!(state.history.last(), Some(&(label, _)) if label == derivation.index)
            && state.next_label == derivation.index.saturating_add(1);
        if !is_latest {
            return false;
        }
        // The remote subaddress stays minted; it is simply never handed out
        // again because the wallet always mints a fresh one.
        state.history.pop();
        state.next_label = derivation.previous_next_index;
        state.last_address_index = state.history.last().map(|&(_, address_index)| address_index);
        true
    }

    async fn next_index(&self) -> u32 {
        self.state.lock().await.next_label
    }
}
