//! Paywall configuration from environment variables.

use paygate_wallet::{Currency, Network};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PaywallError;
use crate::monitor::{ConfirmationModel, MonitorConfig};
use crate::rpc::RpcEndpoint;

/// Payment persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
    Encrypted,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "file" | "json" => Ok(StoreKind::File),
            "encrypted" => Ok(StoreKind::Encrypted),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(format!("unknown store kind: {other}")),
        }
    }
}

/// Configuration for the paywall, its stores and its wallet daemons.
#[derive(Debug, Clone)]
pub struct PaywallConfig {
    /// BTC due per payment; zero disables BTC (env: PAYGATE_PRICE_BTC, default: 0.0001).
    pub btc_price: Decimal,
    /// XMR due per payment; zero disables XMR (env: PAYGATE_PRICE_XMR, default: 0.001).
    pub xmr_price: Decimal,
    /// Lifetime of a payment request (env: PAYGATE_PAYMENT_TIMEOUT_SECS, default: 7200).
    pub payment_timeout: Duration,
    /// Confirmations required, at least 1 (env: PAYGATE_MIN_CONFIRMATIONS, default: 1).
    pub min_confirmations: u32,
    /// Bitcoin network (env: PAYGATE_TESTNET, default: mainnet).
    pub network: Network,
    /// Store backend (env: PAYGATE_STORE, default: file).
    pub store: StoreKind,
    /// Record directory, also the parent of the SQLite database (env: PAYGATE_STORE_DIR).
    pub store_dir: PathBuf,
    /// Key for the encrypted store (env: PAYGATE_STORE_KEY_PATH).
    pub store_key_path: PathBuf,
    /// HD wallet directory (env: PAYGATE_WALLET_DIR).
    pub wallet_dir: PathBuf,
    /// Key sealing the HD wallet file (env: PAYGATE_WALLET_KEY_PATH).
    pub wallet_key_path: PathBuf,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub btc_confirmation: ConfirmationModel,
    pub xmr_confirmation: ConfirmationModel,
    pub btc_rpc: RpcEndpoint,
    /// Present only when wallet credentials are configured.
    pub xmr_rpc: Option<RpcEndpoint>,
    /// Daemon HTTP port (env: PAYGATE_PORT, default: 4080).
    pub port: u16,
}

const SQLITE_FILE_NAME: &str = "payments.db";

impl PaywallConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, PaywallError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PaywallError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let btc_price: Decimal = parse(&get, "PAYGATE_PRICE_BTC", Decimal::new(1, 4))?;
        let xmr_price: Decimal = parse(&get, "PAYGATE_PRICE_XMR", Decimal::new(1, 3))?;
        for (key, price) in [("PAYGATE_PRICE_BTC", btc_price), ("PAYGATE_PRICE_XMR", xmr_price)] {
            if price.is_sign_negative() {
                return Err(PaywallError::Config(format!("{key} must not be negative")));
            }
        }

        let timeout_secs: u64 = parse(&get, "PAYGATE_PAYMENT_TIMEOUT_SECS", 7200)?;
        if timeout_secs == 0 {
            return Err(PaywallError::Config(
                "PAYGATE_PAYMENT_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        let min_confirmations = parse::<u32, _>(&get, "PAYGATE_MIN_CONFIRMATIONS", 1)?.max(1);

        let testnet = get("PAYGATE_TESTNET")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let network = if testnet {
            Network::Testnet
        } else {
            Network::Mainnet
        };

        let store = parse(&get, "PAYGATE_STORE", StoreKind::File)?;
        let path = |key: &str, default: &str| PathBuf::from(get(key).unwrap_or_else(|| default.to_string()));

        let poll_interval_secs: u64 = parse(&get, "PAYGATE_POLL_INTERVAL_SECS", 10)?;
        if poll_interval_secs == 0 {
            return Err(PaywallError::Config(
                "PAYGATE_POLL_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        let max_poll_secs: u64 = parse(&get, "PAYGATE_POLL_MAX_INTERVAL_SECS", 300)?;
        let rpc_timeout_secs: u64 = parse(&get, "PAYGATE_RPC_TIMEOUT_SECS", 30)?;
        if rpc_timeout_secs == 0 {
            return Err(PaywallError::Config(
                "PAYGATE_RPC_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        let default_btc_url = match network {
            Network::Mainnet => "http://127.0.0.1:8332",
            Network::Testnet => "http://127.0.0.1:18332",
        };
        let btc_rpc = RpcEndpoint {
            url: get("BTC_RPC_URL").unwrap_or_else(|| default_btc_url.to_string()),
            user: get("BTC_RPC_USER"),
            password: get("BTC_RPC_PASS"),
        };
        check_url("BTC_RPC_URL", &btc_rpc.url)?;

        let xmr_rpc = match get("XMR_WALLET_PASS") {
            None => None,
            Some(password) => {
                let user = get("XMR_WALLET_USER").unwrap_or_else(|| "paygate".to_string());
                if user.len() < 3 {
                    return Err(PaywallError::Config(
                        "XMR_WALLET_USER must be at least 3 characters".to_string(),
                    ));
                }
                if password.len() < 8 {
                    return Err(PaywallError::Config(
                        "XMR_WALLET_PASS must be at least 8 characters".to_string(),
                    ));
                }
                let url = get("XMR_RPC_URL").unwrap_or_else(|| "http://127.0.0.1:18081".to_string());
                check_url("XMR_RPC_URL", &url)?;
                Some(RpcEndpoint {
                    url,
                    user: Some(user),
                    password: Some(password),
                })
            }
        };

        Ok(Self {
            btc_price,
            xmr_price,
            payment_timeout: Duration::from_secs(timeout_secs),
            min_confirmations,
            network,
            store,
            store_dir: path("PAYGATE_STORE_DIR", "./payments"),
            store_key_path: path("PAYGATE_STORE_KEY_PATH", "./keys/store.key"),
            wallet_dir: path("PAYGATE_WALLET_DIR", "./paywallet"),
            wallet_key_path: path("PAYGATE_WALLET_KEY_PATH", "./keys/wallet.key"),
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_poll_interval: Duration::from_secs(max_poll_secs.max(poll_interval_secs)),
            rpc_timeout: Duration::from_secs(rpc_timeout_secs),
            btc_confirmation: parse(&get, "PAYGATE_BTC_CONFIRMATION", ConfirmationModel::TransactionLookup)?,
            xmr_confirmation: parse(&get, "PAYGATE_XMR_CONFIRMATION", ConfirmationModel::TransactionLookup)?,
            btc_rpc,
            xmr_rpc,
            port: parse(&get, "PAYGATE_PORT", 4080)?,
        })
    }

    /// Currencies with a positive price and, for XMR, wallet credentials.
    pub fn enabled_currencies(&self) -> Vec<Currency> {
        let mut enabled = Vec::new();
        if self.btc_price > Decimal::ZERO {
            enabled.push(Currency::Bitcoin);
        }
        if self.xmr_price > Decimal::ZERO && self.xmr_rpc.is_some() {
            enabled.push(Currency::Monero);
        }
        enabled
    }

    pub fn price(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Bitcoin => self.btc_price,
            Currency::Monero => self.xmr_price,
        }
    }

    pub fn confirmation_model(&self, currency: Currency) -> ConfirmationModel {
        match currency {
            Currency::Bitcoin => self.btc_confirmation,
            Currency::Monero => self.xmr_confirmation,
        }
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.store_dir.join(SQLITE_FILE_NAME)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            base_interval: self.poll_interval,
            max_interval: self.max_poll_interval,
            min_confirmations: self.min_confirmations,
            rpc_timeout: self.rpc_timeout,
            ..MonitorConfig::default()
        }
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, PaywallError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| PaywallError::Config(format!("invalid {key}={raw}: {e}"))),
    }
}

fn check_url(key: &str, raw: &str) -> Result<(), PaywallError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| PaywallError::Config(format!("invalid {key}={raw}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(PaywallError::Config(format!(
            "{key} must use http or https, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<PaywallConfig, PaywallError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PaywallConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.btc_price, Decimal::new(1, 4));
        assert_eq!(config.xmr_price, Decimal::new(1, 3));
        assert_eq!(config.payment_timeout, Duration::from_secs(7200));
        assert_eq!(config.min_confirmations, 1);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.store, StoreKind::File);
        assert_eq!(config.btc_rpc.url, "http://127.0.0.1:8332");
        assert!(config.xmr_rpc.is_none());
        assert_eq!(config.enabled_currencies(), vec![Currency::Bitcoin]);
        assert_eq!(config.port, 4080);

        let monitor = config.monitor_config();
        assert_eq!(monitor.base_interval, Duration::from_secs(10));
        assert_eq!(monitor.max_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_testnet_switches_default_port() {
        let config = load(&[("PAYGATE_TESTNET", "true")]).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.btc_rpc.url, "http://127.0.0.1:18332");
    }

    #[test]
    fn test_monero_enabled_with_credentials() {
        let config = load(&[
            ("XMR_WALLET_USER", "merchant"),
            ("XMR_WALLET_PASS", "correct-horse"),
            ("PAYGATE_XMR_CONFIRMATION", "balance"),
        ])
        .unwrap();
        assert_eq!(
            config.enabled_currencies(),
            vec![Currency::Bitcoin, Currency::Monero]
        );
        assert_eq!(
            config.confirmation_model(Currency::Monero),
            ConfirmationModel::BalanceImpliesConfirmed
        );
    }

    #[test]
    fn test_rejects_weak_monero_credentials() {
        assert!(load(&[("XMR_WALLET_PASS", "short")]).is_err());
        assert!(load(&[("XMR_WALLET_USER", "ab"), ("XMR_WALLET_PASS", "long-enough")]).is_err());
    }

    #[test]
    fn test_zero_price_disables_currency() {
        let config = load(&[("PAYGATE_PRICE_BTC", "0")]).unwrap();
        assert!(config.enabled_currencies().is_empty());
    }

    #[test]
    fn test_invalid_values_are_errors() {
        for (key, value) in [
            ("PAYGATE_PRICE_BTC", "lots"),
            ("PAYGATE_PRICE_XMR", "-1"),
            ("PAYGATE_PAYMENT_TIMEOUT_SECS", "0"),
            ("PAYGATE_STORE", "postgres"),
            ("PAYGATE_BTC_CONFIRMATION", "vibes"),
            ("BTC_RPC_URL", "not a url"),
            ("BTC_RPC_URL", "ftp://node:21"),
        ] {
            assert!(
                matches!(load(&[(key, value)]), Err(PaywallError::Config(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_min_confirmations_clamped() {
        let config = load(&[("PAYGATE_MIN_CONFIRMATIONS", "0")]).unwrap();
        assert_eq!(config.min_confirmations, 1);
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let config = load(&[("PAYGATE_STORE", ""), ("PAYGATE_PORT", "  ")]).unwrap();
        assert_eq!(config.store, StoreKind::File);
        assert_eq!(config.port, 4080);
    }
}
