//! Identity and sessions.
//!
//! Two kinds of principal exist. Humans log in with a wallet signature and
//! receive a bearer session token. Contributors ("claws") are automated
//! agents holding an API key; they become usable once a logged-in wallet
//! claims them with their one-time claim code.

pub mod token;
pub mod wallet;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::errors::{EnsoulError, Result, ValidationError};
use crate::store::SoulStore;
use crate::types::{Contributor, Session};

pub use wallet::IdentityError;

pub const DEFAULT_SESSION_TTL_DAYS: i64 = 7;

static CONTRIBUTOR_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{2,40}$").expect("valid contributor name regex"));

impl From<IdentityError> for EnsoulError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidAddress(_)
            | IdentityError::MalformedMessage(_)
            | IdentityError::MalformedSignature(_) => {
                EnsoulError::Validation(ValidationError::field("login", err.to_string()))
            }
            IdentityError::AddressMismatch
            | IdentityError::StaleTimestamp
            | IdentityError::SignerMismatch => EnsoulError::Unauthenticated(err.to_string()),
        }
    }
}

/// Credentials returned once at registration. The API key is never
/// retrievable again.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub contributor_id: String,
    pub name: String,
    pub api_key: String,
    pub claim_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub wallet: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Identity {
    store: Arc<dyn SoulStore>,
    session_ttl: Duration,
}

impl Identity {
    pub fn new(store: Arc<dyn SoulStore>) -> Self {
        Self {
            store,
            session_ttl: Duration::days(DEFAULT_SESSION_TTL_DAYS),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Register a new contributor in `pending_claim` state.
    pub fn register(&self, name: &str, now: DateTime<Utc>) -> Result<Registration> {
        let name = name.trim();
        if !CONTRIBUTOR_NAME_RE.is_match(name) {
            return Err(ValidationError::field(
                "name",
                "must be 2-40 characters of letters, digits, '_' or '-'",
            )
            .into());
        }
        let api_key = token::new_api_key();
        let claim_code = token::new_claim_code();
        let contributor = Contributor::new(name, token::hash_secret(&api_key), claim_code.clone(), now);
        self.store.insert_contributor(&contributor)?;
        log::info!("registered contributor {} ({})", contributor.name, contributor.id);
        Ok(Registration {
            contributor_id: contributor.id,
            name: contributor.name,
            api_key,
            claim_code,
        })
    }

    /// Verify a signed login message and issue a session, replacing any
    /// earlier session of the same wallet.
    pub fn login(
        &self,
        address: &str,
        message: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession> {
        let wallet = wallet::verify_login(address, message, signature, now)?;
        let token = token::new_session_token();
        let session = Session {
            token_hash: token::hash_secret(&token),
            wallet: wallet.clone(),
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        self.store.replace_session(&session)?;
        log::info!("wallet {} logged in", wallet);
        Ok(IssuedSession {
            token,
            wallet,
            expires_at: session.expires_at,
        })
    }

    pub fn authenticate_session(&self, token: &str, now: DateTime<Utc>) -> Result<Session> {
        let session = self
            .store
            .session_by_token_hash(&token::hash_secret(token))?
            .ok_or_else(|| EnsoulError::Unauthenticated("unknown session".into()))?;
        if session.is_expired(now) {
            return Err(EnsoulError::Unauthenticated("session expired".into()));
        }
        Ok(session)
    }

    pub fn authenticate_contributor(&self, api_key: &str) -> Result<Contributor> {
        self.store
            .contributor_by_api_key_hash(&token::hash_secret(api_key))?
            .ok_or_else(|| EnsoulError::Unauthenticated("unknown api key".into()))
    }

    /// Delete the session. Logging out twice is not an error.
    pub fn logout(&self, token: &str) -> Result<()> {
        if !self.store.delete_session(&token::hash_secret(token))? {
            log::debug!("logout for a session that no longer exists");
        }
        Ok(())
    }

    /// Bind the session's wallet to the contributor holding `claim_code`.
    pub fn claim(&self, session: &Session, claim_code: &str, now: DateTime<Utc>) -> Result<Contributor> {
        let contributor = self
            .store
            .claim_contributor(claim_code.trim(), &session.wallet, now)?;
        log::info!("contributor {} claimed by {}", contributor.name, session.wallet);
        Ok(contributor)
    }
}

#[cfg(test)]
mod tests {
    use super::wallet::testing::{address, key, sign};
    use super::*;
    use crate::store::MemoryStore;

    fn identity() -> Identity {
        Identity::new(Arc::new(MemoryStore::new()))
    }

    fn login(identity: &Identity, seed: u8, now: DateTime<Utc>) -> IssuedSession {
        let key = key(seed);
        let addr = address(&key);
        let message = wallet::login_message(&addr, now);
        identity.login(&addr, &message, &sign(&key, &message), now).unwrap()
    }

    #[test]
    fn test_register_and_authenticate() {
        let identity = identity();
        let reg = identity.register("deep-claw", Utc::now()).unwrap();
        let contributor = identity.authenticate_contributor(&reg.api_key).unwrap();
        assert_eq!(contributor.id, reg.contributor_id);
        assert!(!contributor.is_claimed());
        assert_ne!(contributor.api_key_hash, reg.api_key);

        assert!(matches!(
            identity.authenticate_contributor("claw_nope"),
            Err(EnsoulError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_register_rejects_bad_or_duplicate_names() {
        let identity = identity();
        let long = "a".repeat(41);
        for bad in ["x", "has space", long.as_str()] {
            assert!(matches!(
                identity.register(bad, Utc::now()),
                Err(EnsoulError::Validation(_))
            ));
        }
        identity.register("twin", Utc::now()).unwrap();
        assert!(matches!(
            identity.register("twin", Utc::now()),
            Err(EnsoulError::Conflict(_))
        ));
    }

    #[test]
    fn test_login_replaces_previous_session() {
        let identity = identity();
        let now = Utc::now();
        let first = login(&identity, 5, now);
        let second = login(&identity, 5, now);
        assert!(identity.authenticate_session(&first.token, now).is_err());
        let session = identity.authenticate_session(&second.token, now).unwrap();
        assert_eq!(session.wallet, second.wallet);
    }

    #[test]
    fn test_expired_session_is_unauthenticated() {
        let identity = identity();
        let now = Utc::now();
        let issued = login(&identity, 6, now);
        let later = now + Duration::days(DEFAULT_SESSION_TTL_DAYS) + Duration::seconds(1);
        assert!(matches!(
            identity.authenticate_session(&issued.token, later),
            Err(EnsoulError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_logout_revokes_session() {
        let identity = identity();
        let now = Utc::now();
        let issued = login(&identity, 8, now);
        identity.logout(&issued.token).unwrap();
        assert!(identity.authenticate_session(&issued.token, now).is_err());
        identity.logout(&issued.token).unwrap();
    }

    #[test]
    fn test_bad_signature_is_unauthenticated() {
        let identity = identity();
        let now = Utc::now();
        let alice = key(1);
        let message = wallet::login_message(&address(&alice), now);
        let err = identity
            .login(&address(&alice), &message, &sign(&key(2), &message), now)
            .unwrap_err();
        assert!(matches!(err, EnsoulError::Unauthenticated(_)));
    }

    #[test]
    fn test_claim_flow() {
        let identity = identity();
        let now = Utc::now();
        let reg = identity.register("claimable", now).unwrap();
        let issued = login(&identity, 4, now);
        let session = identity.authenticate_session(&issued.token, now).unwrap();

        let claimed = identity.claim(&session, &reg.claim_code, now).unwrap();
        assert!(claimed.is_claimed());
        assert_eq!(claimed.wallet.as_deref(), Some(issued.wallet.as_str()));

        assert!(matches!(
            identity.claim(&session, &reg.claim_code, now),
            Err(EnsoulError::Conflict(_))
        ));
        assert!(matches!(
            identity.claim(&session, "reef-00000000", now),
            Err(EnsoulError::NotFound(_))
        ));
    }
}
