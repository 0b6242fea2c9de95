//! Runtime settings loaded from the environment.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `ENSOUL_DB` — SQLite path (default: `ensoul.db`); `:memory:` selects the
//!   in-memory store
//! - `ENSOUL_ADMIN_TOKEN` — bearer token for `/api/v1/admin/*`; admin routes
//!   are disabled when unset
//! - `ENSOUL_JUDGE_URL` — OpenAI-compatible base URL (default:
//!   `https://api.openai.com/v1`)
//! - `ENSOUL_JUDGE_MODEL` — curator model (default: `gpt-4o-mini`)
//! - `ENSOUL_JUDGE_API_KEY` — bearer key for the judge endpoint
//! - `ENSOUL_JUDGE_TIMEOUT_SECS` — per-call judge timeout (default: 30)
//! - `ENSOUL_CONDENSE_THRESHOLD` — unconsumed accepted fragments that
//!   trigger condensation (default: 20)
//! - `ENSOUL_CHAIN_RPC_URL` — EVM JSON-RPC endpoint; the reconciler only
//!   runs when set
//! - `ENSOUL_REGISTRY_ADDRESS` — registry contract whose logs are trusted
//! - `ENSOUL_RECONCILE_INTERVAL_SECS` — reconciler period (default: 120)

use std::str::FromStr;
use std::time::Duration;

use crate::condensation::DEFAULT_CONDENSE_THRESHOLD;

pub const MEMORY_DB: &str = ":memory:";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub db_path: String,
    pub admin_token: Option<String>,
    pub judge_url: String,
    pub judge_model: String,
    pub judge_api_key: Option<String>,
    pub judge_timeout: Duration,
    pub condense_threshold: i64,
    pub chain_rpc_url: Option<String>,
    pub registry_address: Option<String>,
    pub reconcile_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: "ensoul.db".to_string(),
            admin_token: None,
            judge_url: "https://api.openai.com/v1".to_string(),
            judge_model: "gpt-4o-mini".to_string(),
            judge_api_key: None,
            judge_timeout: Duration::from_secs(30),
            condense_threshold: DEFAULT_CONDENSE_THRESHOLD,
            chain_rpc_url: None,
            registry_address: None,
            reconcile_interval: Duration::from_secs(120),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Blank values count as
    /// unset; unparsable numbers fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Settings::default();

        Self {
            port: parse_or(get("PORT"), "PORT", defaults.port),
            db_path: get("ENSOUL_DB").unwrap_or(defaults.db_path),
            admin_token: get("ENSOUL_ADMIN_TOKEN"),
            judge_url: get("ENSOUL_JUDGE_URL").unwrap_or(defaults.judge_url),
            judge_model: get("ENSOUL_JUDGE_MODEL").unwrap_or(defaults.judge_model),
            judge_api_key: get("ENSOUL_JUDGE_API_KEY"),
            judge_timeout: Duration::from_secs(parse_or(
                get("ENSOUL_JUDGE_TIMEOUT_SECS"),
                "ENSOUL_JUDGE_TIMEOUT_SECS",
                defaults.judge_timeout.as_secs(),
            )),
            condense_threshold: parse_or(
                get("ENSOUL_CONDENSE_THRESHOLD"),
                "ENSOUL_CONDENSE_THRESHOLD",
                defaults.condense_threshold,
            )
            .max(1),
            chain_rpc_url: get("ENSOUL_CHAIN_RPC_URL"),
            registry_address: get("ENSOUL_REGISTRY_ADDRESS"),
            reconcile_interval: Duration::from_secs(
                parse_or(
                    get("ENSOUL_RECONCILE_INTERVAL_SECS"),
                    "ENSOUL_RECONCILE_INTERVAL_SECS",
                    defaults.reconcile_interval.as_secs(),
                )
                .max(1),
            ),
        }
    }

    pub fn uses_memory_store(&self) -> bool {
        self.db_path == MEMORY_DB
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("{}='{}' is not valid, using {}", key, raw, default);
            default
        }),
    }
}
