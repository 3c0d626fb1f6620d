//! Thin JSON-RPC clients for the wallet daemons the paywall talks to.
//!
//! - [`BitcoinRpcClient`]: `bitcoind` wallet RPC (JSON-RPC 1.0)
//! - [`MoneroWalletRpc`]: `monero-wallet-rpc` (JSON-RPC 2.0), which is both
//!   the subaddress minter and the balance source for XMR

mod bitcoin;
mod monero;

pub use bitcoin::BitcoinRpcClient;
pub use monero::MoneroWalletRpc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ClientError;

/// Credentials and location of an RPC endpoint.
#[derive(Clone)]
pub struct RpcEndpoint {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

/// Shared HTTP transport: posts JSON-RPC envelopes with optional basic auth.
pub(crate) struct JsonRpcTransport {
    http: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    version: &'static str,
}

impl JsonRpcTransport {
    pub(crate) fn new(
        endpoint: &RpcEndpoint,
        path: &str,
        version: &'static str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base = url::Url::parse(&endpoint.url)
            .map_err(|e| ClientError::NotConfigured(format!("invalid rpc url {}: {e}", endpoint.url)))?;
        let url = base
            .join(path)
            .map_err(|e| ClientError::NotConfigured(format!("invalid rpc path {path}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            user: endpoint.user.clone(),
            password: endpoint.password.clone(),
            version,
        })
    }

    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ClientError> {
        let body = serde_json::json!({
            "jsonrpc": self.version,
            "id": "paygate",
            "method": method,
            "params": params,
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        // bitcoind reports RPC errors with HTTP 500 and a JSON body.
        let text = response.text().await?;
        let parsed: RpcResponse<T> = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                ClientError::InvalidResponse(format!("{method}: {e}"))
            } else {
                ClientError::Transport(format!("{method}: HTTP {status}"))
            }
        })?;

        if let Some(err) = parsed.error {
            return Err(ClientError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        parsed
            .result
            .ok_or_else(|| ClientError::InvalidResponse(format!("{method}: missing result")))
    }
}
