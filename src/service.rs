//! The `Ensoul` facade: every externally visible operation, wired in
//! data-flow order over one injected store.
//!
//! All operations take the current time explicitly so tests can move the
//! clock without sleeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::condensation::{render_system_prompt, CondensationConfig, Condenser};
use crate::curation::{CurationConfig, CurationOutcome, CurationPipeline, Judge};
use crate::errors::{EnsoulError, Result, ValidationError};
use crate::identity::{Identity, IssuedSession, Registration};
use crate::quota::QuotaPolicy;
use crate::store::{SetOnce, SoulStore};
use crate::types::{new_id, CondensationEvent, Contributor, Fragment, Session, Soul};
use crate::validator::{normalize_handle, validate_batch, BatchRequest};

const MAX_DISPLAY_NAME_CHARS: usize = 64;

static TX_HASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid tx hash regex"));
static AGENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{1,78}$").expect("valid agent id regex"));

#[derive(Debug, Clone, Default)]
pub struct EnsoulConfig {
    pub quota: QuotaPolicy,
    pub curation: CurationConfig,
    pub condensation: CondensationConfig,
}

/// A batch persisted as pending and waiting for curation.
#[derive(Debug, Clone)]
pub struct AcceptedBatch {
    pub batch_id: String,
    pub soul: Soul,
    pub fragments: Vec<Fragment>,
}

#[derive(Debug)]
pub struct Ensoul {
    store: Arc<dyn SoulStore>,
    identity: Identity,
    curation: CurationPipeline,
    condenser: Arc<Condenser>,
    quota: QuotaPolicy,
}

impl Ensoul {
    pub fn new(store: Arc<dyn SoulStore>, judge: Arc<dyn Judge>, config: EnsoulConfig) -> Self {
        let condenser = Arc::new(Condenser::new(store.clone(), config.condensation));
        let curation =
            CurationPipeline::new(store.clone(), judge, condenser.clone(), config.curation);
        Self {
            identity: Identity::new(store.clone()),
            store,
            curation,
            condenser,
            quota: config.quota,
        }
    }

    pub fn store(&self) -> &Arc<dyn SoulStore> {
        &self.store
    }

    // ----- identity -----

    pub fn register_contributor(&self, name: &str, now: DateTime<Utc>) -> Result<Registration> {
        self.identity.register(name, now)
    }

    pub fn contributor(&self, api_key: &str) -> Result<Contributor> {
        self.identity.authenticate_contributor(api_key)
    }

    pub fn login(
        &self,
        address: &str,
        message: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession> {
        self.identity.login(address, message, signature, now)
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        self.identity.logout(token)
    }

    pub fn session(&self, token: &str, now: DateTime<Utc>) -> Result<Session> {
        self.identity.authenticate_session(token, now)
    }

    pub fn claim(&self, token: &str, claim_code: &str, now: DateTime<Utc>) -> Result<Contributor> {
        let session = self.session(token, now)?;
        self.identity.claim(&session, claim_code, now)
    }

    // ----- souls -----

    pub fn create_soul(
        &self,
        token: &str,
        handle: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Soul> {
        let session = self.session(token, now)?;
        let handle = normalize_handle(handle)?;
        let display_name = display_name.trim();
        let name_chars = display_name.chars().count();
        if name_chars == 0 || name_chars > MAX_DISPLAY_NAME_CHARS {
            return Err(ValidationError::field(
                "display_name",
                format!("must be 1-{} characters", MAX_DISPLAY_NAME_CHARS),
            )
            .into());
        }

        let mut soul = Soul::new(handle, display_name, session.wallet, now);
        soul.system_prompt = render_system_prompt(&soul, &soul.profile, soul.version)
            .map_err(|e| EnsoulError::Internal(e.to_string()))?;
        self.store.insert_soul(&soul, &self.quota)?;
        tracing::info!(soul = %soul.handle, creator = %soul.creator_wallet, "soul created");
        Ok(soul)
    }

    pub fn soul(&self, handle: &str) -> Result<Soul> {
        let handle = normalize_handle(handle)?;
        self.store
            .soul_by_handle(&handle)?
            .ok_or_else(|| EnsoulError::NotFound(format!("soul @{}", handle)))
    }

    pub fn condensations(&self, handle: &str) -> Result<Vec<CondensationEvent>> {
        let soul = self.soul(handle)?;
        Ok(self.store.condensations(&soul.id)?)
    }

    /// Count one chat turn and return the soul with its current prompt.
    pub fn record_chat(&self, handle: &str, now: DateTime<Utc>) -> Result<Soul> {
        let soul = self.soul(handle)?;
        Ok(self.store.record_chat(&soul.id, now)?)
    }

    /// Client-side mint confirmation. Records the transaction hash and, when
    /// the client already knows it, the agent id. Repeating the call is
    /// harmless; a conflicting agent id never overwrites the stored one.
    pub fn confirm_mint(
        &self,
        token: &str,
        handle: &str,
        tx_hash: &str,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Soul> {
        let session = self.session(token, now)?;
        let soul = self.soul(handle)?;
        if soul.creator_wallet != session.wallet {
            return Err(EnsoulError::Forbidden(format!(
                "@{} was not created by this wallet",
                soul.handle
            )));
        }
        let tx_hash = tx_hash.trim();
        if !TX_HASH_RE.is_match(tx_hash) {
            return Err(ValidationError::field("tx_hash", "must be 0x followed by 64 hex digits").into());
        }
        let agent_id = agent_id.map(str::trim).filter(|a| !a.is_empty());
        if let Some(id) = agent_id {
            if !AGENT_ID_RE.is_match(id) {
                return Err(ValidationError::field("agent_id", "must be a decimal integer").into());
            }
        }

        let tx_hash = tx_hash.to_ascii_lowercase();
        if !self.store.record_mint_tx(&soul.id, &tx_hash, now)? {
            log::debug!("mint tx for @{} already final", soul.handle);
        }
        if let Some(id) = agent_id {
            match self.store.set_agent_id(&soul.id, id, now)? {
                SetOnce::Written => {
                    tracing::info!(soul = %soul.handle, agent_id = id, "agent id confirmed by client")
                }
                SetOnce::Unchanged => {}
                SetOnce::AlreadySet(existing) => tracing::warn!(
                    soul = %soul.handle,
                    existing = %existing,
                    claimed = id,
                    "ignoring conflicting agent id"
                ),
            }
        }

        self.store
            .soul_by_id(&soul.id)?
            .ok_or_else(|| EnsoulError::NotFound(format!("soul @{}", soul.handle)))
    }

    // ----- fragments -----

    /// The single-fragment endpoint was replaced by batches.
    pub fn submit_single(&self) -> Result<()> {
        Err(EnsoulError::Retired(
            "single fragment submission was removed; submit 3-6 fragments to /api/v1/fragments/batch".into(),
        ))
    }

    /// Authenticate, rate-limit, validate and persist a batch as pending.
    /// Curation is a separate step: see [`Ensoul::curate`].
    pub fn submit_batch(
        &self,
        api_key: &str,
        request: &BatchRequest,
        now: DateTime<Utc>,
    ) -> Result<AcceptedBatch> {
        let contributor = self.identity.authenticate_contributor(api_key)?;
        if !contributor.is_claimed() {
            return Err(EnsoulError::NotClaimed);
        }
        // Cheap read-only check first; the store repeats it atomically.
        self.quota.check_cooldown(contributor.last_batch_at, now)?;

        let batch = validate_batch(request)?;
        let soul = self
            .store
            .soul_by_handle(&batch.handle)?
            .ok_or_else(|| EnsoulError::NotFound(format!("soul @{}", batch.handle)))?;

        let batch_id = new_id();
        let fragments: Vec<Fragment> = batch
            .fragments
            .into_iter()
            .map(|f| Fragment::pending(&soul.id, &contributor.id, &batch_id, f.dimension, f.content, now))
            .collect();
        self.store
            .insert_batch(&contributor.id, &fragments, &self.quota, now)?;

        tracing::info!(
            soul = %soul.handle,
            contributor = %contributor.name,
            batch = %batch_id,
            count = fragments.len(),
            "batch accepted for curation"
        );
        Ok(AcceptedBatch {
            batch_id,
            soul,
            fragments,
        })
    }

    pub async fn curate(&self, batch: &AcceptedBatch) -> Vec<CurationOutcome> {
        self.curation.curate_batch(&batch.soul, &batch.fragments).await
    }

    // ----- operator -----

    pub async fn condense(&self, handle: &str) -> Result<Option<CondensationEvent>> {
        let soul = self.soul(handle)?;
        Ok(self.condenser.condense(&soul.id).await?)
    }

    pub fn stale_fragments(&self, older_than: chrono::Duration, limit: usize) -> Result<Vec<Fragment>> {
        Ok(self.curation.stale_fragments(older_than, limit)?)
    }

    pub async fn retry_pending(&self, limit: usize) -> Result<Vec<CurationOutcome>> {
        Ok(self.curation.retry_pending(limit).await?)
    }
}


#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::testing::*;
    use super::*;
    use crate::errors::QuotaError;
    use crate::types::{Dimension, FragmentStatus, Stage};
    use crate::validator::FragmentInput;

    const THREE: [Dimension; 3] = [Dimension::Personality, Dimension::Knowledge, Dimension::Style];

    #[tokio::test]
    async fn test_batch_two_accepted_one_rejected() {
        let svc = service(EnsoulConfig::default());
        let now = Utc::now();
        let session = login(&svc, 1, now);
        let api_key = claimed_claw(&svc, &session.token, "claw-one", now);
        svc.create_soul(&session.token, "@Satoshi", "Satoshi Nakamoto", now).unwrap();

        let mut req = request("satoshi", &THREE, 0);
        req.fragments[2].content = format!("{} {}", REJECT_MARKER, req.fragments[2].content);
        let batch = svc.submit_batch(&api_key, &req, now).unwrap();
        assert_eq!(batch.fragments.len(), 3);
        assert!(batch.fragments.iter().all(|f| f.status == FragmentStatus::Pending));

        let outcomes = svc.curate(&batch).await;
        assert_eq!(outcomes.iter().filter(|o| o.is_accepted()).count(), 2);

        let soul = svc.soul("satoshi").unwrap();
        assert_eq!(soul.stage, Stage::Growing);
        assert_eq!(soul.accepted_fragments, 2);
        assert_eq!(soul.total_fragments, 3);
        assert_eq!(soul.contributor_count, 1);

        let claw = svc.contributor(&api_key).unwrap();
        assert_eq!(claw.submitted_count, 3);
        assert_eq!(claw.accepted_count, 2);
        assert_eq!(claw.reward, 20);
    }

    #[tokio::test]
    async fn test_fifty_accepted_then_three_condensations() {
        let svc = service(EnsoulConfig {
            condensation: CondensationConfig {
                threshold: 1_000,
                ..CondensationConfig::default()
            },
            ..EnsoulConfig::default()
        });
        let start = Utc::now();
        let session = login(&svc, 2, start);
        let api_key = claimed_claw(&svc, &session.token, "claw-two", start);
        svc.create_soul(&session.token, "ada", "Ada", start).unwrap();

        let mut clock = start;
        let mut submit = |n: usize| {
            clock = clock + Duration::minutes(5);
            svc.submit_batch(&api_key, &request("ada", &Dimension::ALL, n), clock)
                .unwrap()
        };

        for n in 0..9 {
            let batch = submit(n);
            svc.curate(&batch).await;
        }
        let soul = svc.soul("ada").unwrap();
        assert_eq!(soul.accepted_fragments, 54);
        assert_eq!(soul.stage, Stage::Mature);

        for round in 0..3 {
            if round > 0 {
                let batch = submit(100 + round);
                svc.curate(&batch).await;
            }
            let event = svc.condense("ada").await.unwrap().unwrap();
            assert_eq!(event.version_to, round as i64 + 1);
        }

        let soul = svc.soul("ada").unwrap();
        assert_eq!(soul.stage, Stage::Evolving);
        assert_eq!(soul.version, 3);
        assert_eq!(svc.condensations("ada").unwrap().len(), 3);
        assert!(soul.system_prompt.contains("version 3"));
    }

    #[test]
    fn test_unclaimed_contributor_cannot_submit() {
        let svc = service(EnsoulConfig::default());
        let now = Utc::now();
        let session = login(&svc, 3, now);
        svc.create_soul(&session.token, "bob", "Bob", now).unwrap();
        let reg = svc.register_contributor("loose-claw", now).unwrap();

        let err = svc
            .submit_batch(&reg.api_key, &request("bob", &THREE, 0), now)
            .unwrap_err();
        assert!(matches!(err, EnsoulError::NotClaimed));
    }

    #[test]
    fn test_cooldown_between_batches() {
        let svc = service(EnsoulConfig::default());
        let now = Utc::now();
        let session = login(&svc, 4, now);
        let api_key = claimed_claw(&svc, &session.token, "claw-four", now);
        svc.create_soul(&session.token, "carol", "Carol", now).unwrap();

        svc.submit_batch(&api_key, &request("carol", &THREE, 0), now).unwrap();
        let err = svc
            .submit_batch(&api_key, &request("carol", &THREE, 1), now + Duration::seconds(90))
            .unwrap_err();
        assert!(matches!(
            err,
            EnsoulError::Quota(QuotaError::Cooldown { retry_after_secs: 210 })
        ));
        svc.submit_batch(&api_key, &request("carol", &THREE, 2), now + Duration::minutes(5))
            .unwrap();
    }

    #[test]
    fn test_invalid_batches_persist_nothing() {
        let svc = service(EnsoulConfig::default());
        let now = Utc::now();
        let session = login(&svc, 5, now);
        let api_key = claimed_claw(&svc, &session.token, "claw-five", now);
        let soul = svc.create_soul(&session.token, "dave", "Dave", now).unwrap();

        let mut dup = request("dave", &THREE, 0);
        dup.fragments[1].dimension = "personality".into();
        assert!(matches!(
            svc.submit_batch(&api_key, &dup, now),
            Err(EnsoulError::Validation(ValidationError::DuplicateDimension(Dimension::Personality)))
        ));

        let mut short = request("dave", &THREE, 0);
        short.fragments.push(FragmentInput {
            dimension: "timeline".into(),
            content: "too short".into(),
        });
        assert!(matches!(
            svc.submit_batch(&api_key, &short, now),
            Err(EnsoulError::Validation(ValidationError::ContentLength { .. }))
        ));

        assert!(matches!(
            svc.submit_batch(&api_key, &request("nobody", &THREE, 0), now),
            Err(EnsoulError::NotFound(_))
        ));

        assert!(svc.store().fragments_for_soul(&soul.id).unwrap().is_empty());
        // Rejected submissions do not start the cooldown.
        assert!(svc.contributor(&api_key).unwrap().last_batch_at.is_none());
    }

    #[test]
    fn test_create_soul_rules() {
        let svc = service(EnsoulConfig::default());
        let now = Utc::now();
        let session = login(&svc, 6, now);

        let soul = svc.create_soul(&session.token, "@Vitalik", "Vitalik", now).unwrap();
        assert_eq!(soul.handle, "vitalik");
        assert_eq!(soul.stage, Stage::Embryo);
        assert!(soul.system_prompt.contains("Vitalik"));

        assert!(matches!(
            svc.create_soul(&session.token, "vitalik", "Again", now),
            Err(EnsoulError::Conflict(_))
        ));
        assert!(matches!(
            svc.create_soul(&session.token, "bad handle!", "x", now),
            Err(EnsoulError::Validation(_))
        ));
        assert!(matches!(
            svc.create_soul("ens_bogus", "someone", "x", now),
            Err(EnsoulError::Unauthenticated(_))
        ));

        svc.create_soul(&session.token, "second", "Second", now).unwrap();
        svc.create_soul(&session.token, "third", "Third", now).unwrap();
        assert!(matches!(
            svc.create_soul(&session.token, "fourth", "Fourth", now),
            Err(EnsoulError::Quota(QuotaError::MintCeiling { limit: 3 }))
        ));
    }

    #[test]
    fn test_confirm_mint_is_idempotent_and_first_writer_wins() {
        let svc = service(EnsoulConfig::default());
        let now = Utc::now();
        let creator = login(&svc, 7, now);
        let stranger = login(&svc, 8, now);
        svc.create_soul(&creator.token, "eve", "Eve", now).unwrap();
        let tx = format!("0x{}", "ab".repeat(32));

        assert!(matches!(
            svc.confirm_mint(&stranger.token, "eve", &tx, None, now),
            Err(EnsoulError::Forbidden(_))
        ));
        assert!(matches!(
            svc.confirm_mint(&creator.token, "eve", "0x1234", None, now),
            Err(EnsoulError::Validation(_))
        ));

        let soul = svc.confirm_mint(&creator.token, "eve", &tx, None, now).unwrap();
        assert_eq!(soul.mint_tx_hash.as_deref(), Some(tx.as_str()));
        assert!(soul.agent_id.is_none());

        let soul = svc.confirm_mint(&creator.token, "eve", &tx, Some("12"), now).unwrap();
        assert_eq!(soul.agent_id.as_deref(), Some("12"));
        let soul = svc.confirm_mint(&creator.token, "eve", &tx, Some("13"), now).unwrap();
        assert_eq!(soul.agent_id.as_deref(), Some("12"));
    }

    #[test]
    fn test_chat_counts_and_returns_prompt() {
        let svc = service(EnsoulConfig::default());
        let now = Utc::now();
        let session = login(&svc, 9, now);
        svc.create_soul(&session.token, "frank", "Frank", now).unwrap();

        svc.record_chat("frank", now).unwrap();
        let soul = svc.record_chat("@FRANK", now).unwrap();
        assert_eq!(soul.chat_count, 2);
        assert!(!soul.system_prompt.is_empty());
    }

    #[test]
    fn test_single_submission_is_retired() {
        let svc = service(EnsoulConfig::default());
        assert!(matches!(svc.submit_single(), Err(EnsoulError::Retired(_))));
    }
}
