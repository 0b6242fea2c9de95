//! In-memory [`SoulStore`].
//!
//! All state sits behind one mutex, so every trait method is trivially
//! atomic. Nothing survives a restart.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    AppliedVerdict, CondensationCommit, SetOnce, SoulStore, StoreError, VerdictRecord,
};
use crate::lifecycle::{self, Transition, REWARD_PER_ACCEPTED_FRAGMENT};
use crate::quota::QuotaPolicy;
use crate::types::{
    CondensationEvent, Contributor, ContributorStatus, Fragment, FragmentStatus, Session, Soul,
    WalletBinding,
};

#[derive(Debug, Default)]
struct State {
    souls: HashMap<String, Soul>,
    contributors: HashMap<String, Contributor>,
    /// Insertion order is creation order.
    fragments: Vec<Fragment>,
    condensations: Vec<CondensationEvent>,
    sessions: HashMap<String, Session>,
    bindings: Vec<WalletBinding>,
    /// Soul ids in insertion order.
    soul_order: Vec<String>,
    reconcile_checked: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn soul_mut(&mut self, id: &str) -> Result<&mut Soul, StoreError> {
        self.souls
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("soul {}", id)))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SoulStore for MemoryStore {
    fn insert_soul(&self, soul: &Soul, policy: &QuotaPolicy) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.souls.values().any(|s| s.handle == soul.handle) {
            return Err(StoreError::Conflict(format!(
                "soul '{}' already exists",
                soul.handle
            )));
        }
        let minted = state
            .souls
            .values()
            .filter(|s| s.creator_wallet == soul.creator_wallet)
            .count();
        policy.check_mint_ceiling(minted as u32)?;
        state.souls.insert(soul.id.clone(), soul.clone());
        state.soul_order.push(soul.id.clone());
        Ok(())
    }

    fn soul_by_handle(&self, handle: &str) -> Result<Option<Soul>, StoreError> {
        let state = self.state.lock();
        Ok(state.souls.values().find(|s| s.handle == handle).cloned())
    }

    fn soul_by_id(&self, id: &str) -> Result<Option<Soul>, StoreError> {
        Ok(self.state.lock().souls.get(id).cloned())
    }

    fn record_mint_tx(
        &self,
        soul_id: &str,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let soul = state.soul_mut(soul_id)?;
        if soul.agent_id.is_some() || soul.mint_tx_hash.as_deref() == Some(tx_hash) {
            return Ok(false);
        }
        soul.mint_tx_hash = Some(tx_hash.to_string());
        soul.updated_at = now;
        Ok(true)
    }

    fn set_agent_id(
        &self,
        soul_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SetOnce, StoreError> {
        let mut state = self.state.lock();
        let soul = state.soul_mut(soul_id)?;
        if let Some(existing) = &soul.agent_id {
            return Ok(SetOnce::from_existing(existing, agent_id));
        }
        soul.agent_id = Some(agent_id.to_string());
        soul.updated_at = now;
        Ok(SetOnce::Written)
    }

    fn souls_awaiting_agent_id(&self, limit: usize) -> Result<Vec<Soul>, StoreError> {
        let state = self.state.lock();
        let mut waiting: Vec<Soul> = state
            .soul_order
            .iter()
            .filter_map(|id| state.souls.get(id))
            .filter(|s| s.mint_tx_hash.is_some() && s.agent_id.is_none())
            .cloned()
            .collect();
        // Stable: never-checked souls keep insertion order ahead of the rest.
        waiting.sort_by_key(|s| state.reconcile_checked.get(&s.id).copied());
        waiting.truncate(limit);
        Ok(waiting)
    }

    fn mark_reconcile_checked(&self, soul_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.soul_mut(soul_id)?;
        state.reconcile_checked.insert(soul_id.to_string(), now);
        Ok(())
    }

    fn record_chat(&self, soul_id: &str, now: DateTime<Utc>) -> Result<Soul, StoreError> {
        let mut state = self.state.lock();
        let soul = state.soul_mut(soul_id)?;
        soul.chat_count += 1;
        soul.updated_at = now;
        Ok(soul.clone())
    }

    fn insert_contributor(&self, contributor: &Contributor) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.contributors.values().any(|c| c.name == contributor.name) {
            return Err(StoreError::Conflict(format!(
                "contributor name '{}' is taken",
                contributor.name
            )));
        }
        state
            .contributors
            .insert(contributor.id.clone(), contributor.clone());
        Ok(())
    }

    fn contributor_by_id(&self, id: &str) -> Result<Option<Contributor>, StoreError> {
        Ok(self.state.lock().contributors.get(id).cloned())
    }

    fn contributor_by_api_key_hash(&self, hash: &str) -> Result<Option<Contributor>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .contributors
            .values()
            .find(|c| c.api_key_hash == hash)
            .cloned())
    }

    fn claim_contributor(
        &self,
        claim_code: &str,
        wallet: &str,
        now: DateTime<Utc>,
    ) -> Result<Contributor, StoreError> {
        let mut state = self.state.lock();
        let contributor = state
            .contributors
            .values_mut()
            .find(|c| c.claim_code == claim_code)
            .ok_or_else(|| StoreError::NotFound("unknown claim code".into()))?;
        if contributor.status == ContributorStatus::Claimed {
            return Err(StoreError::Conflict("claim code has already been used".into()));
        }
        contributor.status = ContributorStatus::Claimed;
        contributor.wallet = Some(wallet.to_string());
        contributor.claimed_at = Some(now);
        let claimed = contributor.clone();

        let exists = state
            .bindings
            .iter()
            .any(|b| b.wallet == wallet && b.contributor_id == claimed.id);
        if !exists {
            state.bindings.push(WalletBinding {
                wallet: wallet.to_string(),
                contributor_id: claimed.id.clone(),
                created_at: now,
            });
        }
        Ok(claimed)
    }

    fn bindings_for_wallet(&self, wallet: &str) -> Result<Vec<WalletBinding>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .bindings
            .iter()
            .filter(|b| b.wallet == wallet)
            .cloned()
            .collect())
    }

    fn insert_batch(
        &self,
        contributor_id: &str,
        fragments: &[Fragment],
        policy: &QuotaPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for fragment in fragments {
            if !state.souls.contains_key(&fragment.soul_id) {
                return Err(StoreError::NotFound(format!("soul {}", fragment.soul_id)));
            }
        }
        let contributor = state
            .contributors
            .get_mut(contributor_id)
            .ok_or_else(|| StoreError::NotFound(format!("contributor {}", contributor_id)))?;
        policy.check_cooldown(contributor.last_batch_at, now)?;
        contributor.last_batch_at = Some(now);
        contributor.submitted_count += fragments.len() as i64;
        state.fragments.extend(fragments.iter().cloned());
        Ok(())
    }

    fn fragment(&self, id: &str) -> Result<Option<Fragment>, StoreError> {
        let state = self.state.lock();
        Ok(state.fragments.iter().find(|f| f.id == id).cloned())
    }

    fn apply_verdict(
        &self,
        fragment_id: &str,
        verdict: &VerdictRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedVerdict>, StoreError> {
        let mut state = self.state.lock();
        let index = state
            .fragments
            .iter()
            .position(|f| f.id == fragment_id)
            .ok_or_else(|| StoreError::NotFound(format!("fragment {}", fragment_id)))?;
        if state.fragments[index].status.is_terminal() {
            return Ok(None);
        }

        let accepted = verdict.status == FragmentStatus::Accepted;
        let (soul_id, contributor_id) = {
            let f = &state.fragments[index];
            (f.soul_id.clone(), f.contributor_id.clone())
        };
        let first_from_contributor = accepted
            && !state.fragments.iter().any(|f| {
                f.soul_id == soul_id
                    && f.contributor_id == contributor_id
                    && f.status == FragmentStatus::Accepted
            });

        let fragment = {
            let f = &mut state.fragments[index];
            f.status = verdict.status;
            f.confidence = verdict.confidence;
            f.rejection_reason = verdict.reason.clone();
            f.curated_at = Some(now);
            f.clone()
        };

        let soul = state.soul_mut(&soul_id)?;
        let transition = lifecycle::record_verdict(soul, accepted, first_from_contributor, now);
        let soul = soul.clone();

        if accepted {
            if let Some(c) = state.contributors.get_mut(&contributor_id) {
                c.accepted_count += 1;
                c.reward += REWARD_PER_ACCEPTED_FRAGMENT;
            }
        }

        Ok(Some(AppliedVerdict {
            fragment,
            soul,
            transition,
        }))
    }

    fn record_judge_failure(&self, fragment_id: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        let fragment = state
            .fragments
            .iter_mut()
            .find(|f| f.id == fragment_id)
            .ok_or_else(|| StoreError::NotFound(format!("fragment {}", fragment_id)))?;
        fragment.attempts += 1;
        Ok(fragment.attempts)
    }

    fn pending_fragments(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Fragment>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .fragments
            .iter()
            .filter(|f| f.status == FragmentStatus::Pending && f.created_at < created_before)
            .take(limit)
            .cloned()
            .collect())
    }

    fn retryable_fragments(
        &self,
        attempts_below: i64,
        limit: usize,
    ) -> Result<Vec<Fragment>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .fragments
            .iter()
            .filter(|f| f.status == FragmentStatus::Pending && f.attempts < attempts_below)
            .take(limit)
            .cloned()
            .collect())
    }

    fn fragments_for_soul(&self, soul_id: &str) -> Result<Vec<Fragment>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .fragments
            .iter()
            .filter(|f| f.soul_id == soul_id)
            .cloned()
            .collect())
    }

    fn unconsumed_accepted(&self, soul_id: &str) -> Result<Vec<Fragment>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .fragments
            .iter()
            .filter(|f| {
                f.soul_id == soul_id
                    && f.status == FragmentStatus::Accepted
                    && f.condensation_id.is_none()
            })
            .cloned()
            .collect())
    }

    fn count_unconsumed_accepted(&self, soul_id: &str) -> Result<i64, StoreError> {
        Ok(self.unconsumed_accepted(soul_id)?.len() as i64)
    }

    fn commit_condensation(
        &self,
        commit: &CondensationCommit,
        now: DateTime<Utc>,
    ) -> Result<(Soul, Option<Transition>), StoreError> {
        let mut state = self.state.lock();
        let event = &commit.event;
        let soul = state.soul_mut(&event.soul_id)?;
        if soul.version != event.version_from {
            return Err(StoreError::VersionConflict {
                soul_id: soul.id.clone(),
                expected: event.version_from,
                actual: soul.version,
            });
        }
        soul.profile = commit.profile.clone();
        soul.system_prompt = event.system_prompt.clone();
        let transition = lifecycle::record_condensation(soul, event.version_to, now);
        let soul = soul.clone();

        for fragment in state.fragments.iter_mut() {
            if fragment.condensation_id.is_none()
                && fragment.status == FragmentStatus::Accepted
                && commit.fragment_ids.contains(&fragment.id)
            {
                fragment.condensation_id = Some(event.id.clone());
            }
        }
        state.condensations.push(event.clone());
        Ok((soul, transition))
    }

    fn condensations(&self, soul_id: &str) -> Result<Vec<CondensationEvent>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .condensations
            .iter()
            .filter(|e| e.soul_id == soul_id)
            .cloned()
            .collect())
    }

    fn replace_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.sessions.retain(|_, s| s.wallet != session.wallet);
        state
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    fn session_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.state.lock().sessions.get(token_hash).cloned())
    }

    fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().sessions.remove(token_hash).is_some())
    }
}
