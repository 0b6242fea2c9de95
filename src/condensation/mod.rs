//! Condensation engine.
//!
//! Folds a soul's unconsumed accepted fragments into a new profile version.
//! Writers are serialised per soul by an in-process async mutex, and the
//! store's optimistic version check guards against any writer that bypasses
//! it (another process sharing the database).

pub mod merge;
pub mod prompt;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{CondensationCommit, SoulStore, StoreError};
use crate::types::{new_id, CondensationEvent};

pub use merge::{merge_profile, summary_diff, DimensionChange, Merge};
pub use prompt::render_system_prompt;

/// Default number of unconsumed accepted fragments that triggers a run.
pub const DEFAULT_CONDENSE_THRESHOLD: i64 = 20;

const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum CondensationError {
    #[error("soul {0} not found")]
    SoulNotFound(String),

    #[error("soul {soul_id} kept changing underneath condensation after {attempts} attempts")]
    Contended { soul_id: String, attempts: u32 },

    #[error("failed to render system prompt: {0}")]
    Template(#[from] tera::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CondensationConfig {
    pub threshold: i64,
    pub max_retries: u32,
}

impl Default for CondensationConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONDENSE_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug)]
pub struct Condenser {
    store: Arc<dyn SoulStore>,
    config: CondensationConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Condenser {
    pub fn new(store: Arc<dyn SoulStore>, config: CondensationConfig) -> Self {
        Self {
            store,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn threshold(&self) -> i64 {
        self.config.threshold
    }

    /// Condense if the soul has accumulated at least `threshold`
    /// unconsumed accepted fragments.
    pub async fn maybe_condense(
        &self,
        soul_id: &str,
    ) -> Result<Option<CondensationEvent>, CondensationError> {
        if self.store.count_unconsumed_accepted(soul_id)? < self.config.threshold {
            return Ok(None);
        }
        self.run(soul_id, self.config.threshold).await
    }

    /// Condense whatever is unconsumed, regardless of the threshold.
    /// Returns `None` when there is nothing to fold in.
    pub async fn condense(
        &self,
        soul_id: &str,
    ) -> Result<Option<CondensationEvent>, CondensationError> {
        self.run(soul_id, 1).await
    }

    fn lock_for(&self, soul_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(soul_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run(
        &self,
        soul_id: &str,
        min_fragments: i64,
    ) -> Result<Option<CondensationEvent>, CondensationError> {
        let lock = self.lock_for(soul_id);
        let _guard = lock.lock().await;

        for attempt in 1..=self.config.max_retries {
            // Re-read under the lock: a writer that held it before us may
            // already have consumed these fragments.
            let soul = self
                .store
                .soul_by_id(soul_id)?
                .ok_or_else(|| CondensationError::SoulNotFound(soul_id.to_string()))?;
            let fragments = self.store.unconsumed_accepted(soul_id)?;
            if (fragments.len() as i64) < min_fragments {
                log::debug!(
                    "condense {}: {} unconsumed fragments, need {}",
                    soul.handle,
                    fragments.len(),
                    min_fragments
                );
                return Ok(None);
            }

            let merged = merge_profile(&soul.profile, &fragments);
            let version_to = soul.version + 1;
            let system_prompt = render_system_prompt(&soul, &merged.profile, version_to)?;
            let now = Utc::now();
            let commit = CondensationCommit {
                event: CondensationEvent {
                    id: new_id(),
                    soul_id: soul.id.clone(),
                    version_from: soul.version,
                    version_to,
                    fragments_merged: fragments.len() as i64,
                    summary_diff: summary_diff(&merged.changes),
                    system_prompt,
                    tx_hash: None,
                    created_at: now,
                },
                profile: merged.profile,
                fragment_ids: fragments.iter().map(|f| f.id.clone()).collect(),
            };

            match self.store.commit_condensation(&commit, now) {
                Ok((updated, transition)) => {
                    log::info!(
                        "condensed soul {} v{} -> v{} from {} fragments",
                        updated.handle,
                        commit.event.version_from,
                        commit.event.version_to,
                        commit.event.fragments_merged
                    );
                    if let Some(t) = transition {
                        log::info!("soul {} is now {}", updated.handle, t.to);
                    }
                    return Ok(Some(commit.event));
                }
                Err(StoreError::VersionConflict {
                    expected, actual, ..
                }) => {
                    log::warn!(
                        "condense {}: version moved {} -> {} (attempt {}), retrying",
                        soul.handle,
                        expected,
                        actual,
                        attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CondensationError::Contended {
            soul_id: soul_id.to_string(),
            attempts: self.config.max_retries,
        })
    }
}
