//! Payment address sources for paygate.
//!
//! Every payment gets a fresh receiving address per currency. This crate owns
//! the per-currency counters and the key material behind them:
//!
//! - [`HdAddressSource`]: local BIP32/BIP44 derivation producing P2PKH
//!   addresses (Bitcoin family)
//! - [`SubaddressSource`]: delegates minting to a remote wallet over a
//!   [`SubaddressRpc`] collaborator (Monero family)
//!
//! Both implement [`AddressSource`], the only way the rest of the system
//! obtains addresses. Indices only move forward except through
//! [`AddressSource::rollback_last_derivation`], which undoes the latest
//! derivation when a payment could not be committed.

pub mod address;
pub mod base58;
pub mod currency;
pub mod error;
pub mod hd;
pub mod sealed;
pub mod source;
pub mod storage;

pub use address::{p2pkh_address, validate_address, Network};
pub use currency::Currency;
pub use error::WalletError;
pub use hd::ExtendedKey;
pub use source::{AddressSource, DerivedAddress, HdAddressSource, SubaddressRpc, SubaddressSource};
pub use storage::{WalletSnapshot, WalletStorage};
