use paygate_wallet::{Currency, WalletError};
use std::time::Duration;
use thiserror::Error;

use crate::payment::PaymentStatus;

/// Errors returned by [`PaymentStore`](crate::store::PaymentStore) backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("payment not found: {0}")]
    NotFound(String),

    #[error("payment already exists: {0}")]
    Conflict(String),

    #[error("invalid payment id: {0:?}")]
    InvalidId(String),

    #[error("payment {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("payment {id}: immutable field {field} changed")]
    ImmutableField { id: String, field: &'static str },

    #[error("record {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<WalletError> for StoreError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::Io(io) => StoreError::Io(io),
            other => StoreError::Crypto(other.to_string()),
        }
    }
}

/// Errors returned by [`CryptoClient`](crate::client::CryptoClient)
/// implementations. All of them are treated as transient by the monitor.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Top-level paywall errors, carrying the context they occurred in.
#[derive(Debug, Error)]
pub enum PaywallError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{currency} address derivation failed: {source}")]
    Derivation {
        currency: Currency,
        #[source]
        source: WalletError,
    },

    #[error("store {op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{currency} check for payment {payment_id} failed: {source}")]
    Client {
        currency: Currency,
        payment_id: String,
        #[source]
        source: ClientError,
    },

    #[error("entropy source failed: {0}")]
    Entropy(String),

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
}

impl PaywallError {
    pub(crate) fn store(op: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| PaywallError::Store { op, source }
    }
}
