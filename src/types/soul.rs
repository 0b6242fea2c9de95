//! The soul aggregate and its lifecycle stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dimension::Profile;

/// Lifecycle stage of a soul. Ordered: a soul only ever moves rightwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embryo,
    Growing,
    Mature,
    Evolving,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Embryo => "embryo",
            Stage::Growing => "growing",
            Stage::Mature => "mature",
            Stage::Evolving => "evolving",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embryo" => Ok(Stage::Embryo),
            "growing" => Ok(Stage::Growing),
            "mature" => Ok(Stage::Mature),
            "evolving" => Ok(Stage::Evolving),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// The evolving profile aggregate for one public figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Soul {
    pub id: String,
    /// Normalised handle; unique and immutable.
    pub handle: String,
    pub display_name: String,
    /// Lower-cased wallet that minted the soul.
    pub creator_wallet: String,
    pub stage: Stage,
    /// Profile version, bumped once per condensation.
    pub version: i64,
    pub system_prompt: String,
    pub profile: Profile,
    pub total_fragments: i64,
    pub accepted_fragments: i64,
    pub contributor_count: i64,
    pub chat_count: i64,
    pub condensation_count: i64,
    /// Durable on-chain identifier. Written at most once.
    pub agent_id: Option<String>,
    pub mint_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Soul {
    /// A freshly minted soul in the `embryo` stage.
    pub fn new(
        handle: impl Into<String>,
        display_name: impl Into<String>,
        creator_wallet: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: super::new_id(),
            handle: handle.into(),
            display_name: display_name.into(),
            creator_wallet: creator_wallet.into(),
            stage: Stage::Embryo,
            version: 0,
            system_prompt: String::new(),
            profile: Profile::default(),
            total_fragments: 0,
            accepted_fragments: 0,
            contributor_count: 0,
            chat_count: 0,
            condensation_count: 0,
            agent_id: None,
            mint_tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}
