//! Assemble a running paywall from configuration.
//!
//! Opens the configured store, the HD wallet for BTC and the subaddress
//! wallet for XMR, and wires their clients into the reconciliation monitor.
//! Unreachable wallet daemons are logged but do not stop startup; the
//! monitor backs off until they come up.

use std::collections::HashMap;
use std::sync::Arc;

use paygate::rpc::{BitcoinRpcClient, MoneroWalletRpc};
use paygate::wallet::sealed;
use paygate::wallet::{AddressSource, HdAddressSource, SubaddressSource};
use paygate::{
    ClientBinding, Currency, EncryptedFileStore, FileStore, MemoryStore, PaymentStore, Paywall,
    PaywallConfig, PaywallError, ReconciliationMonitor, SqlitePaymentStore, StoreError, StoreKind,
};

use crate::state::AppState;

/// Open the payment store selected by `config.store`.
pub fn open_store(config: &PaywallConfig) -> Result<Arc<dyn PaymentStore>, PaywallError> {
    let opened: Result<Arc<dyn PaymentStore>, StoreError> = match config.store {
        StoreKind::Memory => {
            tracing::warn!("Payment store: in-memory, payments are lost on restart");
            Ok(Arc::new(MemoryStore::new()) as Arc<dyn PaymentStore>)
        }
        StoreKind::File => {
            tracing::info!("Payment store: JSON files in {}", config.store_dir.display());
            FileStore::open(&config.store_dir).map(|s| Arc::new(s) as Arc<dyn PaymentStore>)
        }
        StoreKind::Encrypted => {
            tracing::info!("Payment store: encrypted files in {}", config.store_dir.display());
            EncryptedFileStore::open_encrypted(&config.store_dir, &config.store_key_path)
                .map(|s| Arc::new(s) as Arc<dyn PaymentStore>)
        }
        StoreKind::Sqlite => {
            let path = config.sqlite_path();
            tracing::info!("Payment store: SQLite at {}", path.display());
            sealed::create_private_dir(&config.store_dir)
                .map_err(StoreError::from)
                .and_then(|()| SqlitePaymentStore::open(&path.to_string_lossy()))
                .map(|s| Arc::new(s) as Arc<dyn PaymentStore>)
        }
    };
    opened.map_err(|source| PaywallError::Store { op: "open", source })
}

/// Build the paywall and monitor for every enabled currency.
pub async fn bootstrap(config: &PaywallConfig) -> Result<AppState, PaywallError> {
    let currencies = config.enabled_currencies();
    if currencies.is_empty() {
        return Err(PaywallError::Config(
            "no currencies enabled: set a positive price and, for XMR, wallet credentials"
                .to_string(),
        ));
    }

    let store = open_store(config)?;
    let mut builder = Paywall::builder(store.clone()).with_payment_timeout(config.payment_timeout);
    let mut clients = HashMap::new();

    for &currency in &currencies {
        let (source, binding): (Arc<dyn AddressSource>, ClientBinding) = match currency {
            Currency::Bitcoin => {
                let source = HdAddressSource::open_or_create(
                    &config.wallet_dir,
                    &config.wallet_key_path,
                    config.network,
                )?;
                let client =
                    BitcoinRpcClient::new(&config.btc_rpc, config.network, config.rpc_timeout)
                        .map_err(|e| PaywallError::Config(format!("BTC_RPC_URL: {e}")))?;
                match client.health_check().await {
                    Ok(height) => tracing::info!(height, url = %config.btc_rpc.url, "bitcoind reachable"),
                    Err(e) => tracing::warn!(error = %e, url = %config.btc_rpc.url, "bitcoind unreachable"),
                }
                (
                    Arc::new(source) as Arc<dyn AddressSource>,
                    ClientBinding::new(Arc::new(client), config.btc_confirmation),
                )
            }
            Currency::Monero => {
                let endpoint = config.xmr_rpc.as_ref().ok_or_else(|| {
                    PaywallError::Config("XMR enabled without wallet credentials".to_string())
                })?;
                let wallet = Arc::new(
                    MoneroWalletRpc::new(endpoint, config.rpc_timeout)
                        .map_err(|e| PaywallError::Config(format!("XMR_RPC_URL: {e}")))?,
                );
                match wallet.health_check().await {
                    Ok(version) => tracing::info!(version, url = %endpoint.url, "monero-wallet-rpc reachable"),
                    Err(e) => tracing::warn!(error = %e, url = %endpoint.url, "monero-wallet-rpc unreachable"),
                }
                (
                    Arc::new(SubaddressSource::new(Currency::Monero, wallet.clone()))
                        as Arc<dyn AddressSource>,
                    ClientBinding::new(wallet, config.xmr_confirmation),
                )
            }
        };
        builder = builder.with_source(source, config.price(currency));
        clients.insert(currency, binding);
        tracing::info!(currency = %currency, price = %config.price(currency), "currency enabled");
    }

    let paywall = Arc::new(builder.build()?);
    let monitor = Arc::new(ReconciliationMonitor::new(
        store,
        currencies,
        clients,
        config.monitor_config(),
    )?);

    Ok(AppState {
        paywall,
        monitor,
        metrics_token: None,
    })
}
