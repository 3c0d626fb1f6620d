use async_trait::async_trait;
use paygate_wallet::{Currency, SubaddressRpc, WalletError};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{JsonRpcTransport, RpcEndpoint};
use crate::client::{from_atomic_units, CryptoClient};
use crate::error::ClientError;

/// Client for `monero-wallet-rpc`. Mints one subaddress per payment and
/// reports per-subaddress balances and transfer confirmations.
pub struct MoneroWalletRpc {
    rpc: JsonRpcTransport,
}

#[derive(Deserialize)]
struct CreatedAddress {
    address: String,
    address_index: u32,
}

#[derive(Deserialize)]
struct AddressEntry {
    address: String,
    address_index: u32,
}

#[derive(Deserialize)]
struct GetAddress {
    #[serde(default)]
    addresses: Vec<AddressEntry>,
}

#[derive(Deserialize)]
struct SubaddressIndex {
    major: u32,
    minor: u32,
}

#[derive(Deserialize)]
struct AddressIndex {
    index: SubaddressIndex,
}

#[derive(Deserialize)]
struct SubaddressBalance {
    address_index: u32,
    balance: u64,
}

#[derive(Deserialize)]
struct Balance {
    #[serde(default)]
    per_subaddress: Vec<SubaddressBalance>,
}

#[derive(Deserialize)]
struct Transfer {
    txid: String,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    confirmations: u64,
}

#[derive(Deserialize)]
struct Transfers {
    #[serde(default, rename = "in")]
    incoming: Vec<Transfer>,
    #[serde(default)]
    pool: Vec<Transfer>,
}

#[derive(Deserialize)]
struct TransferByTxid {
    transfer: Transfer,
}

#[derive(Deserialize)]
struct Version {
    version: u32,
}

impl MoneroWalletRpc {
    pub fn new(endpoint: &RpcEndpoint, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            rpc: JsonRpcTransport::new(endpoint, "/json_rpc", "2.0", timeout)?,
        })
    }

    /// Wallet RPC version; used as a connectivity check.
    pub async fn health_check(&self) -> Result<u32, ClientError> {
        let v: Version = self.rpc.call("get_version", json!({})).await?;
        Ok(v.version)
    }

    async fn locate(&self, address: &str) -> Result<SubaddressIndex, ClientError> {
        let found: AddressIndex = self
            .rpc
            .call("get_address_index", json!({ "address": address }))
            .await?;
        Ok(found.index)
    }
}

#[async_trait]
impl CryptoClient for MoneroWalletRpc {
    async fn get_address_balance(&self, address: &str) -> Result<Decimal, ClientError> {
        let index = self.locate(address).await?;
        let balance: Balance = self
            .rpc
            .call(
                "get_balance",
                json!({ "account_index": index.major, "address_indices": [index.minor] }),
            )
            .await?;
        // An address with no history is simply absent from the list.
        let atomic = balance
            .per_subaddress
            .iter()
            .find(|b| b.address_index == index.minor)
            .map(|b| b.balance)
            .unwrap_or(0);
        Ok(from_atomic_units(atomic, Currency::Monero.atomic_scale()))
    }

    async fn get_transaction_confirmations(&self, tx_id: &str) -> Result<u32, ClientError> {
        let found: TransferByTxid = self
            .rpc
            .call("get_transfer_by_txid", json!({ "txid": tx_id }))
            .await?;
        Ok(u32::try_from(found.transfer.confirmations).unwrap_or(u32::MAX))
    }

    async fn find_incoming_transaction(
        &self,
        address: &str,
    ) -> Result<Option<String>, ClientError> {
        let index = self.locate(address).await?;
        let transfers: Transfers = self
            .rpc
            .call(
                "get_transfers",
                json!({
                    "in": true,
                    "pool": true,
                    "account_index": index.major,
                    "subaddr_indices": [index.minor],
                }),
            )
            .await?;
        let latest = |list: Vec<Transfer>| list.into_iter().max_by_key(|t| t.timestamp).map(|t| t.txid);
        Ok(latest(transfers.incoming).or_else(|| latest(transfers.pool)))
    }
}

#[async_trait]
impl SubaddressRpc for MoneroWalletRpc {
    async fn create_address(
        &self,
        account_index: u32,
        label: &str,
    ) -> Result<(u32, String), WalletError> {
        let created: CreatedAddress = self
            .rpc
            .call(
                "create_address",
                json!({ "account_index": account_index, "label": label }),
            )
            .await
            .map_err(|e| WalletError::Rpc(e.to_string()))?;
        Ok((created.address_index, created.address))
    }

    async fn get_address(
        &self,
        account_index: u32,
        address_index: u32,
    ) -> Result<String, WalletError> {
        let found: GetAddress = self
            .rpc
            .call(
                "get_address",
                json!({ "account_index": account_index, "address_index": [address_index] }),
            )
            .await
            .map_err(|e| WalletError::Rpc(e.to_string()))?;
        found
            .addresses
            .into_iter()
            .find(|a| a.address_index == address_index)
            .map(|a| a.address)
            .ok_or_else(|| WalletError::Rpc(format!("subaddress {address_index} not found")))
    }
}
