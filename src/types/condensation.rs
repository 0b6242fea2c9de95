//! Immutable record of one profile merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondensationEvent {
    pub id: String,
    pub soul_id: String,
    pub version_from: i64,
    pub version_to: i64,
    pub fragments_merged: i64,
    /// One line per dimension that changed.
    pub summary_diff: String,
    pub system_prompt: String,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}
