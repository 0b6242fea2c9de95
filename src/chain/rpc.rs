use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{ChainClient, ChainError, LogEntry};

/// JSON-RPC client reading transaction receipts from an EVM node.
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    url: String,
    client: reqwest::Client,
}

impl RpcChainClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(ChainError::Transport(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }
        let mut body: Value = response.json().await?;
        if let Some(error) = body.get("error") {
            return Err(ChainError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn transaction_logs(&self, tx_hash: &str) -> Result<Option<Vec<LogEntry>>, ChainError> {
        let receipt = self
            .call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;
        parse_receipt_logs(receipt)
    }
}

/// Logs of a receipt result; a `null` receipt means not yet mined.
fn parse_receipt_logs(receipt: Value) -> Result<Option<Vec<LogEntry>>, ChainError> {
    if receipt.is_null() {
        return Ok(None);
    }
    // status 0x0 means the transaction reverted; it will never carry the event.
    if receipt.get("status").and_then(Value::as_str) == Some("0x0") {
        return Ok(Some(Vec::new()));
    }
    let logs = receipt
        .get("logs")
        .cloned()
        .ok_or_else(|| ChainError::Malformed("receipt has no logs field".into()))?;
    serde_json::from_value(logs)
        .map(Some)
        .map_err(|e| ChainError::Malformed(e.to_string()))
}
