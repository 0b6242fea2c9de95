//! Persistence boundary.
//!
//! Every component talks to storage through the [`SoulStore`] trait, handed
//! to it explicitly at construction. Each method is one atomic unit: the
//! checks it performs and the writes it makes commit together or not at all.
//!
//! Two implementations ship with the crate:
//! - [`SqliteStore`] — rusqlite-backed, used by the server binary.
//! - [`MemoryStore`] — a single-lock in-memory store for tests and
//!   ephemeral deployments.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::errors::QuotaError;
use crate::lifecycle::Transition;
use crate::quota::QuotaPolicy;
use crate::types::{
    CondensationEvent, Contributor, Fragment, FragmentStatus, Profile, Session, Soul,
    WalletBinding,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Optimistic version check failed.
    #[error("soul {soul_id} is at version {actual}, expected {expected}")]
    VersionConflict {
        soul_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Outcome of writing a set-at-most-once field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOnce {
    /// The value was empty and is now set.
    Written,
    /// The field already held the same value.
    Unchanged,
    /// The field already held a different value, which was kept.
    AlreadySet(String),
}

impl SetOnce {
    pub(crate) fn from_existing(existing: &str, attempted: &str) -> Self {
        if existing == attempted {
            SetOnce::Unchanged
        } else {
            SetOnce::AlreadySet(existing.to_string())
        }
    }
}

/// A terminal curation verdict ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct VerdictRecord {
    pub status: FragmentStatus,
    pub confidence: f64,
    pub reason: Option<String>,
}

/// Result of applying a verdict to a still-pending fragment.
#[derive(Debug, Clone)]
pub struct AppliedVerdict {
    pub fragment: Fragment,
    pub soul: Soul,
    pub transition: Option<Transition>,
}

/// Everything a condensation writes in one transaction.
#[derive(Debug, Clone)]
pub struct CondensationCommit {
    pub event: CondensationEvent,
    pub profile: Profile,
    pub fragment_ids: Vec<String>,
}

/// Storage capability injected into every component.
pub trait SoulStore: Send + Sync + fmt::Debug {
    // --- souls ---

    /// Insert a new soul, enforcing handle uniqueness and the creator
    /// wallet's mint ceiling in the same transaction.
    fn insert_soul(&self, soul: &Soul, policy: &QuotaPolicy) -> Result<(), StoreError>;

    fn soul_by_handle(&self, handle: &str) -> Result<Option<Soul>, StoreError>;

    fn soul_by_id(&self, id: &str) -> Result<Option<Soul>, StoreError>;

    /// Record the registration transaction hash. Replaces an earlier hash
    /// only while the durable identifier is still unknown; returns whether
    /// anything was written.
    fn record_mint_tx(
        &self,
        soul_id: &str,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Compare-and-set the durable identifier (`WHERE agent_id IS NULL`).
    fn set_agent_id(
        &self,
        soul_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SetOnce, StoreError>;

    /// Souls with a mint transaction but no durable identifier. Souls never
    /// checked come first, then the least recently checked, so souls stuck
    /// on a bad receipt cannot hold the window.
    fn souls_awaiting_agent_id(&self, limit: usize) -> Result<Vec<Soul>, StoreError>;

    /// Stamp the time the reconciler last looked at this soul.
    fn mark_reconcile_checked(&self, soul_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    fn record_chat(&self, soul_id: &str, now: DateTime<Utc>) -> Result<Soul, StoreError>;

    // --- contributors ---

    fn insert_contributor(&self, contributor: &Contributor) -> Result<(), StoreError>;

    fn contributor_by_id(&self, id: &str) -> Result<Option<Contributor>, StoreError>;

    fn contributor_by_api_key_hash(&self, hash: &str) -> Result<Option<Contributor>, StoreError>;

    /// Consume a claim code: flip the contributor to `claimed`, bind the
    /// wallet and record the binding. A consumed code is a conflict.
    fn claim_contributor(
        &self,
        claim_code: &str,
        wallet: &str,
        now: DateTime<Utc>,
    ) -> Result<Contributor, StoreError>;

    fn bindings_for_wallet(&self, wallet: &str) -> Result<Vec<WalletBinding>, StoreError>;

    // --- fragments ---

    /// Persist a batch of pending fragments after re-checking the
    /// contributor's cooldown, and stamp the contributor's last batch time.
    fn insert_batch(
        &self,
        contributor_id: &str,
        fragments: &[Fragment],
        policy: &QuotaPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn fragment(&self, id: &str) -> Result<Option<Fragment>, StoreError>;

    /// Apply a terminal verdict if the fragment is still pending, updating
    /// soul and contributor aggregates in the same transaction. Returns
    /// `None` when the fragment had already been resolved.
    fn apply_verdict(
        &self,
        fragment_id: &str,
        verdict: &VerdictRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedVerdict>, StoreError>;

    /// Count one failed judge attempt; returns the new attempt total.
    fn record_judge_failure(&self, fragment_id: &str) -> Result<i64, StoreError>;

    /// Pending fragments created before `created_before`, oldest first.
    fn pending_fragments(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Fragment>, StoreError>;

    /// Pending fragments with fewer than `attempts_below` failed judge
    /// attempts, oldest first. The limit applies after the attempt filter.
    fn retryable_fragments(
        &self,
        attempts_below: i64,
        limit: usize,
    ) -> Result<Vec<Fragment>, StoreError>;

    fn fragments_for_soul(&self, soul_id: &str) -> Result<Vec<Fragment>, StoreError>;

    /// Accepted fragments not yet consumed by a condensation, oldest first.
    fn unconsumed_accepted(&self, soul_id: &str) -> Result<Vec<Fragment>, StoreError>;

    fn count_unconsumed_accepted(&self, soul_id: &str) -> Result<i64, StoreError>;

    // --- condensation ---

    /// Commit a condensation if the soul is still at `event.version_from`.
    fn commit_condensation(
        &self,
        commit: &CondensationCommit,
        now: DateTime<Utc>,
    ) -> Result<(Soul, Option<Transition>), StoreError>;

    fn condensations(&self, soul_id: &str) -> Result<Vec<CondensationEvent>, StoreError>;

    // --- sessions ---

    /// Store a session, deleting any other session of the same wallet.
    fn replace_session(&self, session: &Session) -> Result<(), StoreError>;

    fn session_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError>;

    fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError>;
}
