//! Curation pipeline.
//!
//! Every fragment of a batch is judged independently and concurrently. A
//! judge call that fails or times out is retried a bounded number of times;
//! a fragment that still has no verdict stays `pending` and is left for
//! [`CurationPipeline::retry_pending`]. Terminal verdicts go through the
//! store's compare-and-set so each fragment is resolved exactly once.

pub mod judge;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;

use crate::condensation::Condenser;
use crate::store::{SoulStore, StoreError};
use crate::types::{Fragment, FragmentStatus, Soul};

pub use judge::{
    HttpJudge, HttpJudgeConfig, Judge, JudgeError, JudgeRequest, Judgment, SiblingFragment,
    SoulContext, Verdict,
};

#[derive(Debug, Clone)]
pub struct CurationConfig {
    /// Upper bound on a single judge call.
    pub judge_timeout: Duration,
    /// Judge attempts per curation pass.
    pub max_attempts: u32,
    /// Pause between attempts within a pass.
    pub retry_backoff: Duration,
    /// Total failed attempts after which a fragment is no longer retried
    /// automatically.
    pub attempt_ceiling: i64,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            judge_timeout: Duration::from_secs(30),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(500),
            attempt_ceiling: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CurationOutcome {
    Accepted { fragment_id: String, confidence: f64 },
    Rejected { fragment_id: String, reason: String },
    /// No verdict this pass; the fragment stays pending.
    Deferred { fragment_id: String, attempts: i64 },
    /// Another writer resolved the fragment first.
    AlreadyResolved { fragment_id: String },
}

impl CurationOutcome {
    pub fn fragment_id(&self) -> &str {
        match self {
            CurationOutcome::Accepted { fragment_id, .. }
            | CurationOutcome::Rejected { fragment_id, .. }
            | CurationOutcome::Deferred { fragment_id, .. }
            | CurationOutcome::AlreadyResolved { fragment_id } => fragment_id,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, CurationOutcome::Accepted { .. })
    }
}

#[derive(Debug)]
pub struct CurationPipeline {
    store: Arc<dyn SoulStore>,
    judge: Arc<dyn Judge>,
    condenser: Arc<Condenser>,
    config: CurationConfig,
}

impl CurationPipeline {
    pub fn new(
        store: Arc<dyn SoulStore>,
        judge: Arc<dyn Judge>,
        condenser: Arc<Condenser>,
        config: CurationConfig,
    ) -> Self {
        Self {
            store,
            judge,
            condenser,
            config,
        }
    }

    /// Judge every fragment of one batch, then give the condenser a chance
    /// to run if anything was accepted.
    pub async fn curate_batch(&self, soul: &Soul, fragments: &[Fragment]) -> Vec<CurationOutcome> {
        let outcomes = join_all(
            fragments
                .iter()
                .map(|fragment| self.curate_one(soul, fragment, fragments)),
        )
        .await;

        let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
        tracing::info!(
            soul = %soul.handle,
            fragments = fragments.len(),
            accepted,
            "batch curated"
        );

        if accepted > 0 {
            if let Err(e) = self.condenser.maybe_condense(&soul.id).await {
                tracing::error!(soul = %soul.handle, error = %e, "condensation after curation failed");
            }
        }
        outcomes
    }

    async fn curate_one(&self, soul: &Soul, fragment: &Fragment, batch: &[Fragment]) -> CurationOutcome {
        let request = JudgeRequest {
            soul: SoulContext {
                handle: soul.handle.clone(),
                display_name: soul.display_name.clone(),
                stage: soul.stage,
                dimension_summary: soul.profile.get(fragment.dimension).summary.clone(),
            },
            dimension: fragment.dimension,
            content: fragment.content.clone(),
            siblings: batch
                .iter()
                .filter(|f| f.id != fragment.id)
                .map(|f| SiblingFragment {
                    dimension: f.dimension,
                    content: f.content.clone(),
                })
                .collect(),
        };

        let mut attempts = fragment.attempts;
        for attempt in 1..=self.config.max_attempts {
            let failure = match tokio::time::timeout(self.config.judge_timeout, self.judge.judge(&request)).await {
                Ok(Ok(judgment)) => return self.apply(fragment, judgment),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.config.judge_timeout),
            };
            tracing::warn!(
                fragment = %fragment.id,
                attempt,
                error = %failure,
                "judge attempt failed"
            );
            match self.store.record_judge_failure(&fragment.id) {
                Ok(total) => attempts = total,
                Err(e) => tracing::error!(fragment = %fragment.id, error = %e, "could not record judge failure"),
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }

        tracing::warn!(
            fragment = %fragment.id,
            soul = %soul.handle,
            attempts,
            "fragment left pending without a verdict"
        );
        CurationOutcome::Deferred {
            fragment_id: fragment.id.clone(),
            attempts,
        }
    }

    fn apply(&self, fragment: &Fragment, judgment: Judgment) -> CurationOutcome {
        let record = judgment.into_record();
        match self.store.apply_verdict(&fragment.id, &record, Utc::now()) {
            Ok(Some(applied)) => {
                if let Some(t) = applied.transition {
                    tracing::info!(soul = %applied.soul.handle, from = %t.from, to = %t.to, "stage transition");
                }
                match record.status {
                    FragmentStatus::Accepted => CurationOutcome::Accepted {
                        fragment_id: fragment.id.clone(),
                        confidence: record.confidence,
                    },
                    _ => CurationOutcome::Rejected {
                        fragment_id: fragment.id.clone(),
                        reason: record.reason.unwrap_or_default(),
                    },
                }
            }
            Ok(None) => {
                log::debug!("fragment {} was already resolved", fragment.id);
                CurationOutcome::AlreadyResolved {
                    fragment_id: fragment.id.clone(),
                }
            }
            Err(e) => {
                tracing::error!(fragment = %fragment.id, error = %e, "failed to persist verdict");
                CurationOutcome::Deferred {
                    fragment_id: fragment.id.clone(),
                    attempts: fragment.attempts,
                }
            }
        }
    }

    /// Re-judge pending fragments below the attempt ceiling, oldest first,
    /// grouped back into their batches.
    pub async fn retry_pending(&self, limit: usize) -> Result<Vec<CurationOutcome>, StoreError> {
        let pending = self
            .store
            .retryable_fragments(self.config.attempt_ceiling, limit)?;

        let mut batches: Vec<(String, Vec<Fragment>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for fragment in pending {
            match index.get(&fragment.batch_id) {
                Some(&i) => batches[i].1.push(fragment),
                None => {
                    index.insert(fragment.batch_id.clone(), batches.len());
                    batches.push((fragment.soul_id.clone(), vec![fragment]));
                }
            }
        }

        let mut outcomes = Vec::new();
        for (soul_id, fragments) in batches {
            let Some(soul) = self.store.soul_by_id(&soul_id)? else {
                log::warn!("pending fragments reference missing soul {}", soul_id);
                continue;
            };
            outcomes.extend(self.curate_batch(&soul, &fragments).await);
        }
        Ok(outcomes)
    }

    /// Pending fragments older than `older_than`, for operators.
    pub fn stale_fragments(
        &self,
        older_than: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<Fragment>, StoreError> {
        let stale = self.store.pending_fragments(Utc::now() - older_than, limit)?;
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "stale pending fragments");
        }
        Ok(stale)
    }
}
