use async_trait::async_trait;
use paygate_wallet::{validate_address, Network};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{JsonRpcTransport, RpcEndpoint};
use crate::client::{decimal_from_json, CryptoClient};
use crate::error::ClientError;

/// Balance and confirmation queries against a `bitcoind` wallet that watches
/// the paywall's addresses.
pub struct BitcoinRpcClient {
    rpc: JsonRpcTransport,
    network: Network,
}

#[derive(Deserialize)]
struct ReceivedByAddress {
    address: String,
    #[serde(default)]
    txids: Vec<String>,
}

#[derive(Deserialize)]
struct WalletTransaction {
    confirmations: i64,
}

impl BitcoinRpcClient {
    pub fn new(endpoint: &RpcEndpoint, network: Network, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            rpc: JsonRpcTransport::new(endpoint, "", "1.0", timeout)?,
            network,
        })
    }

    /// Current block height; used as a connectivity check.
    pub async fn health_check(&self) -> Result<u64, ClientError> {
        self.rpc.call("getblockcount", json!([])).await
    }

    fn check_address(&self, address: &str) -> Result<(), ClientError> {
        match validate_address(address) {
            Ok(network) if network == self.network => Ok(()),
            Ok(network) => Err(ClientError::InvalidAddress(format!(
                "{address} is a {network:?} address"
            ))),
            Err(e) => Err(ClientError::InvalidAddress(e.to_string())),
        }
    }
}

#[async_trait]
impl CryptoClient for BitcoinRpcClient {
    async fn get_address_balance(&self, address: &str) -> Result<Decimal, ClientError> {
        self.check_address(address)?;
        // minconf 0: the monitor applies its own confirmation threshold.
        let amount: serde_json::Value = self
            .rpc
            .call("getreceivedbyaddress", json!([address, 0]))
            .await?;
        decimal_from_json(&amount)
    }

    async fn get_transaction_confirmations(&self, tx_id: &str) -> Result<u32, ClientError> {
        let tx: WalletTransaction = self.rpc.call("gettransaction", json!([tx_id])).await?;
        // Negative counts mark conflicted transactions.
        Ok(u32::try_from(tx.confirmations.max(0)).unwrap_or(u32::MAX))
    }

    async fn find_incoming_transaction(
        &self,
        address: &str,
    ) -> Result<Option<String>, ClientError> {
        self.check_address(address)?;
        let received: Vec<ReceivedByAddress> = self
            .rpc
            .call("listreceivedbyaddress", json!([0, true, true, address]))
            .await?;
        Ok(received
            .into_iter()
            .find(|r| r.address == address)
            .and_then(|r| r.txids.into_iter().last()))
    }
}
