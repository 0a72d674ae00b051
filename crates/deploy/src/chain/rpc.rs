//! JSON-RPC client for a live node.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use url::Url;

use super::{ChainClient, Receipt, TransactionRequest};

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for an Ethereum JSON-RPC endpoint.
///
/// Transactions are sent with `eth_sendTransaction`, so the node (or a
/// signing proxy in front of it) must hold the deployer key. Every request
/// carries an explicit nonce.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: Url,
}

/// Receipt fields as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    block_number: u64,
    #[serde(default, deserialize_with = "deserialize_status")]
    status: bool,
    contract_address: Option<Address>,
}

/// Block header fields as returned by `eth_getBlockByNumber`.
#[derive(Debug, Deserialize)]
struct RpcBlock {
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    timestamp: u64,
}

/// Deserialize a u64 from a hex string (with 0x prefix).
fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

/// Receipt status: `0x1` for success, `0x0` for a revert.
fn deserialize_status<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(deserialize_u64_from_hex(deserializer)? == 1)
}

fn parse_hex_u64(s: &str) -> Result<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid hex quantity: {}", s))
}

impl JsonRpcClient {
    /// Create a client for the given endpoint.
    pub fn new(url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn request<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", method))?;

        let result: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", method))?;

        if let Some(error) = result.get("error") {
            anyhow::bail!(
                "RPC error from {}: {}",
                method,
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
            );
        }

        let result_value = result
            .get("result")
            .cloned()
            .context("No result in response")?;

        serde_json::from_value(result_value)
            .with_context(|| format!("Failed to deserialize {} result", method))
    }

    async fn quantity(&self, method: &str, params: Vec<Value>) -> Result<u64> {
        let hex: String = self.request(method, params).await?;
        parse_hex_u64(&hex)
    }
}

/// JSON body of an `eth_sendTransaction` request.
fn transaction_params(tx: &TransactionRequest) -> Value {
    let mut params = json!({
        "from": tx.from,
        "data": tx.data,
        "value": format!("0x{:x}", tx.value),
        "nonce": format!("0x{:x}", tx.nonce),
    });
    if let Some(to) = tx.to {
        params["to"] = json!(to);
    }
    params
}

impl ChainClient for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64> {
        self.quantity("eth_chainId", vec![]).await
    }

    async fn nonce(&self, address: Address) -> Result<u64> {
        self.quantity(
            "eth_getTransactionCount",
            vec![json!(address), json!("latest")],
        )
        .await
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> Result<B256> {
        self.request("eth_sendTransaction", vec![transaction_params(tx)])
            .await
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<Receipt>> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;

        Ok(receipt.map(|r| Receipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number,
            status: r.status,
            contract_address: r.contract_address,
        }))
    }

    async fn block_number(&self) -> Result<u64> {
        self.quantity("eth_blockNumber", vec![]).await
    }

    async fn block_timestamp(&self) -> Result<u64> {
        let block: Option<RpcBlock> = self
            .request("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
            .await?;
        block
            .map(|b| b.timestamp)
            .context("Node returned no latest block")
    }

    async fn call(&self, to: Address, data: &Bytes) -> Result<Bytes> {
        self.request(
            "eth_call",
            vec![json!({ "to": to, "data": data }), json!("latest")],
        )
        .await
    }
}
