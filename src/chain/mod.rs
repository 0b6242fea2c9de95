//! On-chain registry reads and the reconciliation background task.
//!
//! Minting happens client-side; the server only ever reads receipts to learn
//! the durable agent identifier the registry assigned.

pub mod reconciler;
pub mod rpc;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig, ReconcilerHandle};
pub use rpc::RpcChainClient;

/// Registry event emitted when an agent is minted.
pub const DEFAULT_REGISTRY_EVENT: &str = "Registered(uint256,string,address)";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain request failed: {0}")]
    Transport(String),

    #[error("chain rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected chain response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        ChainError::Transport(err.to_string())
    }
}

/// One log of a transaction receipt, hex fields as the node returns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

#[async_trait]
pub trait ChainClient: Send + Sync + fmt::Debug {
    /// Logs of a mined transaction; `None` while no receipt is available.
    async fn transaction_logs(&self, tx_hash: &str) -> Result<Option<Vec<LogEntry>>, ChainError>;
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// Matcher for the registry's mint event.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    topic: String,
    registry_address: Option<String>,
}

impl RegistryEvent {
    pub fn new(signature: &str, registry_address: Option<&str>) -> Self {
        Self {
            topic: format!("0x{}", hex::encode(keccak256(signature.as_bytes()))),
            registry_address: registry_address.map(|a| a.trim().to_ascii_lowercase()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Decimal agent id from the first matching log, if any.
    pub fn extract_agent_id(&self, logs: &[LogEntry]) -> Option<String> {
        logs.iter()
            .filter(|log| match &self.registry_address {
                Some(registry) => log.address.eq_ignore_ascii_case(registry),
                None => true,
            })
            .filter(|log| {
                log.topics
                    .first()
                    .is_some_and(|t| t.eq_ignore_ascii_case(&self.topic))
            })
            .find_map(|log| log.topics.get(1).and_then(|t| hex_word_to_decimal(t)))
    }
}

/// Render a 32-byte big-endian hex word as an unsigned decimal string.
pub fn hex_word_to_decimal(word: &str) -> Option<String> {
    let digits = word.strip_prefix("0x").unwrap_or(word);
    if digits.is_empty() || digits.len() > 64 {
        return None;
    }
    let padded = format!("{:0>64}", digits);
    let mut bytes = hex::decode(padded).ok()?;

    // Schoolbook division by 10 over the big-endian byte string.
    let mut out = Vec::new();
    while bytes.iter().any(|b| *b != 0) {
        let mut remainder = 0u32;
        for byte in bytes.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            *byte = (acc / 10) as u8;
            remainder = acc % 10;
        }
        out.push(b'0' + remainder as u8);
    }
    if out.is_empty() {
        return Some("0".to_string());
    }
    out.reverse();
    String::from_utf8(out).ok()
}
