//! Per-contributor batch cooldown and per-wallet mint ceiling.
//!
//! The rules here are pure. Stores evaluate them inside the transaction that
//! records the batch or the soul, so concurrent writers for the same
//! identity see each other's effects.

use chrono::{DateTime, Duration, Utc};

use crate::errors::QuotaError;

/// Minimum gap between two accepted batches from one contributor.
pub const DEFAULT_BATCH_COOLDOWN_SECS: i64 = 5 * 60;

/// Maximum number of souls a single wallet may mint.
pub const DEFAULT_MAX_SOULS_PER_WALLET: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub batch_cooldown: Duration,
    pub max_souls_per_wallet: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            batch_cooldown: Duration::seconds(DEFAULT_BATCH_COOLDOWN_SECS),
            max_souls_per_wallet: DEFAULT_MAX_SOULS_PER_WALLET,
        }
    }
}

impl QuotaPolicy {
    /// Fail if the contributor's previous batch is still inside the cooldown.
    pub fn check_cooldown(
        &self,
        last_batch_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        let Some(last) = last_batch_at else {
            return Ok(());
        };
        let ready_at = last + self.batch_cooldown;
        if now < ready_at {
            // Round up so clients never retry a second early.
            let remaining = ready_at - now;
            let secs = remaining.num_seconds() + i64::from(remaining.subsec_nanos() > 0);
            return Err(QuotaError::Cooldown {
                retry_after_secs: secs.max(1),
            });
        }
        Ok(())
    }

    /// Fail if the wallet already minted `existing` souls at the ceiling.
    pub fn check_mint_ceiling(&self, existing: u32) -> Result<(), QuotaError> {
        if existing >= self.max_souls_per_wallet {
            return Err(QuotaError::MintCeiling {
                limit: self.max_souls_per_wallet,
            });
        }
        Ok(())
    }
}

/// Canonical form of a wallet address for comparisons and counting.
pub fn normalize_wallet(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}
