//! Contributor ("claw") identities.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Forward-only claim status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributorStatus {
    PendingClaim,
    Claimed,
}

impl ContributorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributorStatus::PendingClaim => "pending_claim",
            ContributorStatus::Claimed => "claimed",
        }
    }
}

impl fmt::Display for ContributorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContributorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_claim" => Ok(ContributorStatus::PendingClaim),
            "claimed" => Ok(ContributorStatus::Claimed),
            other => Err(format!("unknown contributor status '{}'", other)),
        }
    }
}

/// An external agent that submits fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub id: String,
    pub name: String,
    /// sha256 hex of the API key; the cleartext key is shown once at registration.
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    #[serde(skip_serializing)]
    pub claim_code: String,
    pub status: ContributorStatus,
    pub wallet: Option<String>,
    pub submitted_count: i64,
    pub accepted_count: i64,
    /// Accrued reward points.
    pub reward: i64,
    pub last_batch_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Contributor {
    pub fn new(
        name: impl Into<String>,
        api_key_hash: impl Into<String>,
        claim_code: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: super::new_id(),
            name: name.into(),
            api_key_hash: api_key_hash.into(),
            claim_code: claim_code.into(),
            status: ContributorStatus::PendingClaim,
            wallet: None,
            submitted_count: 0,
            accepted_count: 0,
            reward: 0,
            last_batch_at: None,
            created_at: now,
            claimed_at: None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.status == ContributorStatus::Claimed
    }
}
