//! Soul state machine.
//!
//! ```text
//! embryo ──(≥1 accepted)──▶ growing ──(≥50 accepted)──▶ mature ──(≥3 condensations)──▶ evolving
//! ```
//!
//! The stage is a pure function of two counters, and a soul's recorded stage
//! is only ever raised to that value, never lowered. Stores call
//! [`record_verdict`] and [`record_condensation`] inside the same
//! transaction that applies the triggering side effect.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{Soul, Stage};

/// Accepted fragments needed to reach `mature`.
pub const MATURE_ACCEPTED_THRESHOLD: i64 = 50;

/// Condensation events needed to reach `evolving`.
pub const EVOLVING_CONDENSATION_THRESHOLD: i64 = 3;

/// Reward points credited to a contributor per accepted fragment.
pub const REWARD_PER_ACCEPTED_FRAGMENT: i64 = 10;

impl Stage {
    /// Stage implied by the counters alone.
    pub fn for_counters(accepted_fragments: i64, condensation_count: i64) -> Stage {
        if condensation_count >= EVOLVING_CONDENSATION_THRESHOLD {
            Stage::Evolving
        } else if accepted_fragments >= MATURE_ACCEPTED_THRESHOLD {
            Stage::Mature
        } else if accepted_fragments >= 1 {
            Stage::Growing
        } else {
            Stage::Embryo
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
}

fn advance(soul: &mut Soul) -> Option<Transition> {
    let target = soul
        .stage
        .max(Stage::for_counters(soul.accepted_fragments, soul.condensation_count));
    if target == soul.stage {
        return None;
    }
    let transition = Transition {
        from: soul.stage,
        to: target,
    };
    soul.stage = target;
    log::info!(
        "soul {} advanced {} -> {}",
        soul.handle,
        transition.from,
        transition.to
    );
    Some(transition)
}

/// Apply one terminal curation verdict to the soul's aggregates.
///
/// `first_from_contributor` is true when this acceptance is the
/// contributor's first accepted fragment for this soul.
pub fn record_verdict(
    soul: &mut Soul,
    accepted: bool,
    first_from_contributor: bool,
    now: DateTime<Utc>,
) -> Option<Transition> {
    soul.total_fragments += 1;
    if accepted {
        soul.accepted_fragments += 1;
        if first_from_contributor {
            soul.contributor_count += 1;
        }
    }
    soul.updated_at = now;
    advance(soul)
}

/// Apply a committed condensation to the soul's aggregates.
pub fn record_condensation(
    soul: &mut Soul,
    version_to: i64,
    now: DateTime<Utc>,
) -> Option<Transition> {
    soul.version = version_to;
    soul.condensation_count += 1;
    soul.updated_at = now;
    advance(soul)
}
