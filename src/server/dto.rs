//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};

use crate::types::{Dimension, FragmentStatus, Soul, Stage};

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub address: String,
    pub message: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    pub claim_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSoulRequest {
    pub handle: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MintConfirmRequest {
    pub handle: String,
    pub tx_hash: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentReceipt {
    pub id: String,
    pub dimension: Dimension,
    pub status: FragmentStatus,
}

/// Body of `202 Accepted` for a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub count: usize,
    pub fragments: Vec<FragmentReceipt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub handle: String,
    pub display_name: String,
    pub stage: Stage,
    pub version: i64,
    pub system_prompt: String,
    pub chat_count: i64,
}

impl From<Soul> for ChatResponse {
    fn from(soul: Soul) -> Self {
        Self {
            handle: soul.handle,
            display_name: soul.display_name,
            stage: soul.stage,
            version: soul.version,
            system_prompt: soul.system_prompt,
            chat_count: soul.chat_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaleQuery {
    #[serde(default = "default_stale_secs")]
    pub older_than_secs: i64,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_stale_secs() -> i64 {
    15 * 60
}

fn default_limit() -> usize {
    100
}
