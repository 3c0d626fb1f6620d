//! Wallet/chain query capability consumed by the reconciliation monitor.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ClientError;

/// Balance and confirmation queries for one currency.
///
/// Implementations must surface failures as errors rather than reporting a
/// stale or zero balance.
#[async_trait]
pub trait CryptoClient: Send + Sync {
    /// Total amount received by `address`, in whole coins.
    async fn get_address_balance(&self, address: &str) -> Result<Decimal, ClientError>;

    /// Confirmation count of transaction `tx_id`.
    async fn get_transaction_confirmations(&self, tx_id: &str) -> Result<u32, ClientError>;

    /// Id of the most recent transaction paying `address`, if one is visible.
    /// Clients that cannot resolve transactions keep the default.
    async fn find_incoming_transaction(
        &self,
        _address: &str,
    ) -> Result<Option<String>, ClientError> {
        Ok(None)
    }
}

/// Convert an integer amount of atomic units into whole coins.
pub fn from_atomic_units(atomic: u64, scale: u32) -> Decimal {
    Decimal::from_i128_with_scale(atomic as i128, scale).normalize()
}

/// Parse a JSON number or numeric string (as returned by node RPCs) into a
/// decimal, accepting scientific notation.
pub fn decimal_from_json(value: &serde_json::Value) -> Result<Decimal, ClientError> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => {
            return Err(ClientError::InvalidResponse(format!(
                "expected a number, got {other}"
            )))
        }
    };
    let parsed = if text.contains(['e', 'E']) {
        Decimal::from_scientific(&text)
    } else {
        text.parse::<Decimal>()
    };
    parsed.map_err(|e| ClientError::InvalidResponse(format!("bad amount {text}: {e}")))
}
