//! Crypto-gated paywall core.
//!
//! Issues payment requests with one fresh receiving address per enabled
//! currency, persists them, and reconciles them against wallet state until
//! they are confirmed or expire.
//!
//! # Components
//!
//! - **Ledger** ([`Paywall`]): creates payments atomically, rolling back
//!   address derivations when anything fails
//! - **Stores** ([`PaymentStore`]): memory, JSON files, encrypted files, SQLite
//! - **Monitor** ([`ReconciliationMonitor`]): polls pending payments with
//!   quadratic backoff and settles them
//! - **Clients** ([`CryptoClient`]): `bitcoind` and `monero-wallet-rpc` over JSON-RPC
//!
//! # Quick example
//!
//! ```no_run
//! use paygate::{MemoryStore, Paywall};
//! use paygate::wallet::{HdAddressSource, Network};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let btc = HdAddressSource::from_seed(&[7u8; 32], Network::Testnet).unwrap();
//! let paywall = Paywall::builder(Arc::new(MemoryStore::new()))
//!     .with_source(Arc::new(btc), Decimal::new(1, 4))
//!     .build()
//!     .unwrap();
//!
//! let payment = paywall.create_payment().await.unwrap();
//! println!("pay to {:?}", payment.addresses);
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod migration;
pub mod monitor;
pub mod payment;
pub mod rpc;
pub mod store;

pub use paygate_wallet as wallet;
pub use paygate_wallet::Currency;

pub use client::CryptoClient;
pub use config::{PaywallConfig, StoreKind};
pub use error::{ClientError, PaywallError, StoreError};
pub use ledger::{Paywall, PaywallBuilder};
pub use migration::{encrypt_existing, MigrationOptions, MigrationReport};
pub use monitor::{
    Backoff, ClientBinding, ConfirmationModel, CycleReport, MonitorConfig, MonitorHandle,
    MonitorState, ReconciliationMonitor,
};
pub use payment::{Payment, PaymentStatus};
pub use rpc::{BitcoinRpcClient, MoneroWalletRpc, RpcEndpoint};
pub use store::{EncryptedFileStore, FileStore, MemoryStore, PaymentStore, SqlitePaymentStore};
