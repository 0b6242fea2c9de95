//! A single curated contribution to one dimension of a soul.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dimension::Dimension;

/// Curation status. Only `Pending` may change, and only once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FragmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentStatus::Pending => "pending",
            FragmentStatus::Accepted => "accepted",
            FragmentStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FragmentStatus::Pending)
    }
}

impl fmt::Display for FragmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FragmentStatus::Pending),
            "accepted" => Ok(FragmentStatus::Accepted),
            "rejected" => Ok(FragmentStatus::Rejected),
            other => Err(format!("unknown fragment status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub soul_id: String,
    pub contributor_id: String,
    pub batch_id: String,
    pub dimension: Dimension,
    pub content: String,
    pub status: FragmentStatus,
    pub confidence: f64,
    /// Present iff the fragment was rejected.
    pub rejection_reason: Option<String>,
    /// Condensation event that consumed this fragment.
    pub condensation_id: Option<String>,
    /// Judge attempts that failed or timed out.
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub curated_at: Option<DateTime<Utc>>,
}

impl Fragment {
    /// A new pending fragment belonging to `batch_id`.
    pub fn pending(
        soul_id: &str,
        contributor_id: &str,
        batch_id: &str,
        dimension: Dimension,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: super::new_id(),
            soul_id: soul_id.to_string(),
            contributor_id: contributor_id.to_string(),
            batch_id: batch_id.to_string(),
            dimension,
            content: content.into(),
            status: FragmentStatus::Pending,
            confidence: 0.0,
            rejection_reason: None,
            condensation_id: None,
            attempts: 0,
            created_at: now,
            curated_at: None,
        }
    }
}
