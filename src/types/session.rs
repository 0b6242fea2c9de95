//! Wallet sessions and wallet-to-contributor bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A live login for one wallet. Only the token hash is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token_hash: String,
    pub wallet: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBinding {
    pub wallet: String,
    pub contributor_id: String,
    pub created_at: DateTime<Utc>,
}
