//! SQLite-backed [`SoulStore`].
//!
//! Every mutating method runs inside a `BEGIN IMMEDIATE` transaction so the
//! write lock is taken before any read that guards the write. Multiple
//! processes sharing one database file therefore serialise the same way
//! threads sharing one `SqliteStore` do.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use super::{
    AppliedVerdict, CondensationCommit, SetOnce, SoulStore, StoreError, VerdictRecord,
};
use crate::lifecycle::{self, Transition, REWARD_PER_ACCEPTED_FRAGMENT};
use crate::quota::QuotaPolicy;
use crate::types::{
    CondensationEvent, Contributor, ContributorStatus, Fragment, FragmentStatus, Profile, Session,
    Soul, WalletBinding,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS souls (
    id                 TEXT PRIMARY KEY,
    handle             TEXT NOT NULL UNIQUE,
    display_name       TEXT NOT NULL,
    creator_wallet     TEXT NOT NULL,
    stage              TEXT NOT NULL,
    version            INTEGER NOT NULL DEFAULT 0,
    system_prompt      TEXT NOT NULL DEFAULT '',
    profile_json       TEXT NOT NULL,
    total_fragments    INTEGER NOT NULL DEFAULT 0,
    accepted_fragments INTEGER NOT NULL DEFAULT 0 CHECK (accepted_fragments <= total_fragments),
    contributor_count  INTEGER NOT NULL DEFAULT 0,
    chat_count         INTEGER NOT NULL DEFAULT 0,
    condensation_count INTEGER NOT NULL DEFAULT 0,
    agent_id           TEXT,
    mint_tx_hash       TEXT,
    reconcile_checked_at TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_souls_creator_wallet ON souls(creator_wallet);

CREATE TABLE IF NOT EXISTS contributors (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    api_key_hash    TEXT NOT NULL UNIQUE,
    claim_code      TEXT NOT NULL UNIQUE,
    status          TEXT NOT NULL,
    wallet          TEXT,
    submitted_count INTEGER NOT NULL DEFAULT 0,
    accepted_count  INTEGER NOT NULL DEFAULT 0,
    reward          INTEGER NOT NULL DEFAULT 0,
    last_batch_at   TEXT,
    created_at      TEXT NOT NULL,
    claimed_at      TEXT
);

CREATE TABLE IF NOT EXISTS fragments (
    id               TEXT PRIMARY KEY,
    soul_id          TEXT NOT NULL REFERENCES souls(id) ON DELETE CASCADE,
    contributor_id   TEXT NOT NULL REFERENCES contributors(id),
    batch_id         TEXT NOT NULL,
    dimension        TEXT NOT NULL,
    content          TEXT NOT NULL,
    status           TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
    confidence       REAL NOT NULL DEFAULT 0,
    rejection_reason TEXT,
    condensation_id  TEXT,
    attempts         INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    curated_at       TEXT,
    UNIQUE (batch_id, dimension)
);
CREATE INDEX IF NOT EXISTS idx_fragments_soul_status ON fragments(soul_id, status);

CREATE TABLE IF NOT EXISTS condensations (
    id               TEXT PRIMARY KEY,
    soul_id          TEXT NOT NULL REFERENCES souls(id) ON DELETE CASCADE,
    version_from     INTEGER NOT NULL,
    version_to       INTEGER NOT NULL,
    fragments_merged INTEGER NOT NULL,
    summary_diff     TEXT NOT NULL,
    system_prompt    TEXT NOT NULL,
    tx_hash          TEXT,
    created_at       TEXT NOT NULL,
    UNIQUE (soul_id, version_to)
);

CREATE TABLE IF NOT EXISTS sessions (
    token_hash TEXT PRIMARY KEY,
    wallet     TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wallet_bindings (
    wallet         TEXT NOT NULL,
    contributor_id TEXT NOT NULL REFERENCES contributors(id),
    created_at     TEXT NOT NULL,
    PRIMARY KEY (wallet, contributor_id)
);
"#;

const SOUL_COLUMNS: &str = "id, handle, display_name, creator_wallet, stage, version, \
     system_prompt, profile_json, total_fragments, accepted_fragments, contributor_count, \
     chat_count, condensation_count, agent_id, mint_tx_hash, created_at, updated_at";

const CONTRIBUTOR_COLUMNS: &str = "id, name, api_key_hash, claim_code, status, wallet, \
     submitted_count, accepted_count, reward, last_batch_at, created_at, claimed_at";

const FRAGMENT_COLUMNS: &str = "id, soul_id, contributor_id, batch_id, dimension, content, \
     status, confidence, rejection_reason, condensation_id, attempts, created_at, curated_at";

const CONDENSATION_COLUMNS: &str = "id, soul_id, version_from, version_to, fragments_merged, \
     summary_diff, system_prompt, tx_hash, created_at";

/// Parse a text column into a domain enum.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn soul_from_row(row: &Row<'_>) -> rusqlite::Result<Soul> {
    let profile_json: String = row.get(7)?;
    let profile: Profile = serde_json::from_str(&profile_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Soul {
        id: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        creator_wallet: row.get(3)?,
        stage: parse_col(row, 4)?,
        version: row.get(5)?,
        system_prompt: row.get(6)?,
        profile,
        total_fragments: row.get(8)?,
        accepted_fragments: row.get(9)?,
        contributor_count: row.get(10)?,
        chat_count: row.get(11)?,
        condensation_count: row.get(12)?,
        agent_id: row.get(13)?,
        mint_tx_hash: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn contributor_from_row(row: &Row<'_>) -> rusqlite::Result<Contributor> {
    Ok(Contributor {
        id: row.get(0)?,
        name: row.get(1)?,
        api_key_hash: row.get(2)?,
        claim_code: row.get(3)?,
        status: parse_col(row, 4)?,
        wallet: row.get(5)?,
        submitted_count: row.get(6)?,
        accepted_count: row.get(7)?,
        reward: row.get(8)?,
        last_batch_at: row.get(9)?,
        created_at: row.get(10)?,
        claimed_at: row.get(11)?,
    })
}

fn fragment_from_row(row: &Row<'_>) -> rusqlite::Result<Fragment> {
    Ok(Fragment {
        id: row.get(0)?,
        soul_id: row.get(1)?,
        contributor_id: row.get(2)?,
        batch_id: row.get(3)?,
        dimension: parse_col(row, 4)?,
        content: row.get(5)?,
        status: parse_col(row, 6)?,
        confidence: row.get(7)?,
        rejection_reason: row.get(8)?,
        condensation_id: row.get(9)?,
        attempts: row.get(10)?,
        created_at: row.get(11)?,
        curated_at: row.get(12)?,
    })
}

fn condensation_from_row(row: &Row<'_>) -> rusqlite::Result<CondensationEvent> {
    Ok(CondensationEvent {
        id: row.get(0)?,
        soul_id: row.get(1)?,
        version_from: row.get(2)?,
        version_to: row.get(3)?,
        fragments_merged: row.get(4)?,
        summary_diff: row.get(5)?,
        system_prompt: row.get(6)?,
        tx_hash: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        token_hash: row.get(0)?,
        wallet: row.get(1)?,
        created_at: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

fn load_soul(conn: &Connection, id: &str) -> Result<Option<Soul>, StoreError> {
    let sql = format!("SELECT {} FROM souls WHERE id = ?1", SOUL_COLUMNS);
    Ok(conn.query_row(&sql, params![id], soul_from_row).optional()?)
}

fn require_soul(conn: &Connection, id: &str) -> Result<Soul, StoreError> {
    load_soul(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("soul {}", id)))
}

/// Persist every mutable soul column.
fn write_soul(tx: &Transaction<'_>, soul: &Soul) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE souls SET stage = ?2, version = ?3, system_prompt = ?4, profile_json = ?5,
             total_fragments = ?6, accepted_fragments = ?7, contributor_count = ?8,
             chat_count = ?9, condensation_count = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            soul.id,
            soul.stage.as_str(),
            soul.version,
            soul.system_prompt,
            serde_json::to_string(&soul.profile)?,
            soul.total_fragments,
            soul.accepted_fragments,
            soul.contributor_count,
            soul.chat_count,
            soul.condensation_count,
            soul.updated_at,
        ],
    )?;
    Ok(())
}

#[derive(Debug)]
pub struct SqliteStore {
    /// Path of the database file, or `:memory:`.
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, path.to_string_lossy().into_owned())
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn with_connection(conn: Connection, db_path: String) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("SqliteStore opened at {}", db_path);
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside an immediate transaction, committing on success.
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn query_fragments(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
        limit: Option<usize>,
    ) -> Result<Vec<Fragment>, StoreError> {
        let conn = self.conn.lock();
        let mut sql = format!(
            "SELECT {} FROM fragments WHERE {} ORDER BY rowid",
            FRAGMENT_COLUMNS, where_clause
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, fragment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl SoulStore for SqliteStore {
    fn insert_soul(&self, soul: &Soul, policy: &QuotaPolicy) -> Result<(), StoreError> {
        self.write(|tx| {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM souls WHERE handle = ?1)",
                params![soul.handle],
                |row| row.get(0),
            )?;
            if taken {
                return Err(StoreError::Conflict(format!(
                    "soul '{}' already exists",
                    soul.handle
                )));
            }
            let minted: u32 = tx.query_row(
                "SELECT COUNT(*) FROM souls WHERE creator_wallet = ?1",
                params![soul.creator_wallet],
                |row| row.get(0),
            )?;
            policy.check_mint_ceiling(minted)?;

            let sql = format!(
                "INSERT INTO souls ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                SOUL_COLUMNS
            );
            tx.execute(
                &sql,
                params![
                    soul.id,
                    soul.handle,
                    soul.display_name,
                    soul.creator_wallet,
                    soul.stage.as_str(),
                    soul.version,
                    soul.system_prompt,
                    serde_json::to_string(&soul.profile)?,
                    soul.total_fragments,
                    soul.accepted_fragments,
                    soul.contributor_count,
                    soul.chat_count,
                    soul.condensation_count,
                    soul.agent_id,
                    soul.mint_tx_hash,
                    soul.created_at,
                    soul.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    fn soul_by_handle(&self, handle: &str) -> Result<Option<Soul>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM souls WHERE handle = ?1", SOUL_COLUMNS);
        Ok(conn.query_row(&sql, params![handle], soul_from_row).optional()?)
    }

    fn soul_by_id(&self, id: &str) -> Result<Option<Soul>, StoreError> {
        let conn = self.conn.lock();
        load_soul(&conn, id)
    }

    fn record_mint_tx(
        &self,
        soul_id: &str,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.write(|tx| {
            require_soul(tx, soul_id)?;
            let changed = tx.execute(
                "UPDATE souls SET mint_tx_hash = ?2, updated_at = ?3
                 WHERE id = ?1 AND agent_id IS NULL
                   AND (mint_tx_hash IS NULL OR mint_tx_hash <> ?2)",
                params![soul_id, tx_hash, now],
            )?;
            Ok(changed == 1)
        })
    }

    fn set_agent_id(
        &self,
        soul_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SetOnce, StoreError> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE souls SET agent_id = ?2, updated_at = ?3
                 WHERE id = ?1 AND agent_id IS NULL",
                params![soul_id, agent_id, now],
            )?;
            if changed == 1 {
                return Ok(SetOnce::Written);
            }
            let soul = require_soul(tx, soul_id)?;
            let existing = soul.agent_id.unwrap_or_default();
            Ok(SetOnce::from_existing(&existing, agent_id))
        })
    }

    fn souls_awaiting_agent_id(&self, limit: usize) -> Result<Vec<Soul>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM souls
             WHERE mint_tx_hash IS NOT NULL AND agent_id IS NULL
             ORDER BY reconcile_checked_at IS NOT NULL, julianday(reconcile_checked_at), rowid
             LIMIT ?1",
            SOUL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let souls = stmt
            .query_map(params![limit as i64], soul_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(souls)
    }

    fn mark_reconcile_checked(&self, soul_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE souls SET reconcile_checked_at = ?2 WHERE id = ?1",
                params![soul_id, now],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("soul {}", soul_id)));
            }
            Ok(())
        })
    }

    fn record_chat(&self, soul_id: &str, now: DateTime<Utc>) -> Result<Soul, StoreError> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE souls SET chat_count = chat_count + 1, updated_at = ?2 WHERE id = ?1",
                params![soul_id, now],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("soul {}", soul_id)));
            }
            require_soul(tx, soul_id)
        })
    }

    fn insert_contributor(&self, contributor: &Contributor) -> Result<(), StoreError> {
        self.write(|tx| {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM contributors WHERE name = ?1)",
                params![contributor.name],
                |row| row.get(0),
            )?;
            if taken {
                return Err(StoreError::Conflict(format!(
                    "contributor name '{}' is taken",
                    contributor.name
                )));
            }
            let sql = format!(
                "INSERT INTO contributors ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                CONTRIBUTOR_COLUMNS
            );
            tx.execute(
                &sql,
                params![
                    contributor.id,
                    contributor.name,
                    contributor.api_key_hash,
                    contributor.claim_code,
                    contributor.status.as_str(),
                    contributor.wallet,
                    contributor.submitted_count,
                    contributor.accepted_count,
                    contributor.reward,
                    contributor.last_batch_at,
                    contributor.created_at,
                    contributor.claimed_at,
                ],
            )?;
            Ok(())
        })
    }

    fn contributor_by_id(&self, id: &str) -> Result<Option<Contributor>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM contributors WHERE id = ?1", CONTRIBUTOR_COLUMNS);
        Ok(conn.query_row(&sql, params![id], contributor_from_row).optional()?)
    }

    fn contributor_by_api_key_hash(&self, hash: &str) -> Result<Option<Contributor>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM contributors WHERE api_key_hash = ?1",
            CONTRIBUTOR_COLUMNS
        );
        Ok(conn.query_row(&sql, params![hash], contributor_from_row).optional()?)
    }

    fn claim_contributor(
        &self,
        claim_code: &str,
        wallet: &str,
        now: DateTime<Utc>,
    ) -> Result<Contributor, StoreError> {
        self.write(|tx| {
            let sql = format!(
                "SELECT {} FROM contributors WHERE claim_code = ?1",
                CONTRIBUTOR_COLUMNS
            );
            let mut contributor = tx
                .query_row(&sql, params![claim_code], contributor_from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound("unknown claim code".into()))?;
            if contributor.status == ContributorStatus::Claimed {
                return Err(StoreError::Conflict(
                    "claim code has already been used".into(),
                ));
            }

            tx.execute(
                "UPDATE contributors SET status = ?2, wallet = ?3, claimed_at = ?4
                 WHERE id = ?1 AND status = ?5",
                params![
                    contributor.id,
                    ContributorStatus::Claimed.as_str(),
                    wallet,
                    now,
                    ContributorStatus::PendingClaim.as_str(),
                ],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO wallet_bindings (wallet, contributor_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![wallet, contributor.id, now],
            )?;

            contributor.status = ContributorStatus::Claimed;
            contributor.wallet = Some(wallet.to_string());
            contributor.claimed_at = Some(now);
            Ok(contributor)
        })
    }

    fn bindings_for_wallet(&self, wallet: &str) -> Result<Vec<WalletBinding>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT wallet, contributor_id, created_at FROM wallet_bindings
             WHERE wallet = ?1 ORDER BY rowid",
        )?;
        let bindings = stmt
            .query_map(params![wallet], |row| {
                Ok(WalletBinding {
                    wallet: row.get(0)?,
                    contributor_id: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }

    fn insert_batch(
        &self,
        contributor_id: &str,
        fragments: &[Fragment],
        policy: &QuotaPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write(|tx| {
            let last_batch_at: Option<DateTime<Utc>> = tx
                .query_row(
                    "SELECT last_batch_at FROM contributors WHERE id = ?1",
                    params![contributor_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("contributor {}", contributor_id)))?;
            policy.check_cooldown(last_batch_at, now)?;

            let sql = format!(
                "INSERT INTO fragments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                FRAGMENT_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            for f in fragments {
                stmt.execute(params![
                    f.id,
                    f.soul_id,
                    f.contributor_id,
                    f.batch_id,
                    f.dimension.as_str(),
                    f.content,
                    f.status.as_str(),
                    f.confidence,
                    f.rejection_reason,
                    f.condensation_id,
                    f.attempts,
                    f.created_at,
                    f.curated_at,
                ])?;
            }

            tx.execute(
                "UPDATE contributors
                 SET last_batch_at = ?2, submitted_count = submitted_count + ?3
                 WHERE id = ?1",
                params![contributor_id, now, fragments.len() as i64],
            )?;
            Ok(())
        })
    }

    fn fragment(&self, id: &str) -> Result<Option<Fragment>, StoreError> {
        Ok(self
            .query_fragments("id = ?1", params![id], Some(1))?
            .into_iter()
            .next())
    }

    fn apply_verdict(
        &self,
        fragment_id: &str,
        verdict: &VerdictRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedVerdict>, StoreError> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE fragments
                 SET status = ?2, confidence = ?3, rejection_reason = ?4, curated_at = ?5
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    fragment_id,
                    verdict.status.as_str(),
                    verdict.confidence,
                    verdict.reason,
                    now,
                ],
            )?;

            let sql = format!("SELECT {} FROM fragments WHERE id = ?1", FRAGMENT_COLUMNS);
            let fragment = tx
                .query_row(&sql, params![fragment_id], fragment_from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("fragment {}", fragment_id)))?;
            if changed == 0 {
                return Ok(None);
            }

            let accepted = verdict.status == FragmentStatus::Accepted;
            let first_from_contributor = if accepted {
                let earlier: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM fragments
                     WHERE soul_id = ?1 AND contributor_id = ?2 AND status = 'accepted' AND id <> ?3",
                    params![fragment.soul_id, fragment.contributor_id, fragment.id],
                    |row| row.get(0),
                )?;
                earlier == 0
            } else {
                false
            };

            let mut soul = require_soul(tx, &fragment.soul_id)?;
            let transition =
                lifecycle::record_verdict(&mut soul, accepted, first_from_contributor, now);
            write_soul(tx, &soul)?;

            if accepted {
                tx.execute(
                    "UPDATE contributors
                     SET accepted_count = accepted_count + 1, reward = reward + ?2
                     WHERE id = ?1",
                    params![fragment.contributor_id, REWARD_PER_ACCEPTED_FRAGMENT],
                )?;
            }

            Ok(Some(AppliedVerdict {
                fragment,
                soul,
                transition,
            }))
        })
    }

    fn record_judge_failure(&self, fragment_id: &str) -> Result<i64, StoreError> {
        self.write(|tx| {
            tx.query_row(
                "UPDATE fragments SET attempts = attempts + 1 WHERE id = ?1 RETURNING attempts",
                params![fragment_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("fragment {}", fragment_id)))
        })
    }

    fn pending_fragments(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Fragment>, StoreError> {
        // The stored text form is not fixed-width, so compare as julian days.
        self.query_fragments(
            "status = 'pending' AND julianday(created_at) < julianday(?1)",
            params![created_before],
            Some(limit),
        )
    }

    fn retryable_fragments(
        &self,
        attempts_below: i64,
        limit: usize,
    ) -> Result<Vec<Fragment>, StoreError> {
        self.query_fragments(
            "status = 'pending' AND attempts < ?1",
            params![attempts_below],
            Some(limit),
        )
    }

    fn fragments_for_soul(&self, soul_id: &str) -> Result<Vec<Fragment>, StoreError> {
        self.query_fragments("soul_id = ?1", params![soul_id], None)
    }

    fn unconsumed_accepted(&self, soul_id: &str) -> Result<Vec<Fragment>, StoreError> {
        self.query_fragments(
            "soul_id = ?1 AND status = 'accepted' AND condensation_id IS NULL",
            params![soul_id],
            None,
        )
    }

    fn count_unconsumed_accepted(&self, soul_id: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM fragments
             WHERE soul_id = ?1 AND status = 'accepted' AND condensation_id IS NULL",
            params![soul_id],
            |row| row.get(0),
        )?)
    }

    fn commit_condensation(
        &self,
        commit: &CondensationCommit,
        now: DateTime<Utc>,
    ) -> Result<(Soul, Option<Transition>), StoreError> {
        let event = &commit.event;
        self.write(|tx| {
            let mut soul = require_soul(tx, &event.soul_id)?;
            if soul.version != event.version_from {
                return Err(StoreError::VersionConflict {
                    soul_id: soul.id.clone(),
                    expected: event.version_from,
                    actual: soul.version,
                });
            }
            soul.profile = commit.profile.clone();
            soul.system_prompt = event.system_prompt.clone();
            let transition = lifecycle::record_condensation(&mut soul, event.version_to, now);
            write_soul(tx, &soul)?;

            let sql = format!(
                "INSERT INTO condensations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                CONDENSATION_COLUMNS
            );
            tx.execute(
                &sql,
                params![
                    event.id,
                    event.soul_id,
                    event.version_from,
                    event.version_to,
                    event.fragments_merged,
                    event.summary_diff,
                    event.system_prompt,
                    event.tx_hash,
                    event.created_at,
                ],
            )?;

            let mut stamp = tx.prepare(
                "UPDATE fragments SET condensation_id = ?2
                 WHERE id = ?1 AND status = 'accepted' AND condensation_id IS NULL",
            )?;
            for id in &commit.fragment_ids {
                stamp.execute(params![id, event.id])?;
            }
            Ok((soul, transition))
        })
    }

    fn condensations(&self, soul_id: &str) -> Result<Vec<CondensationEvent>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM condensations WHERE soul_id = ?1 ORDER BY version_to",
            CONDENSATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![soul_id], condensation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn replace_session(&self, session: &Session) -> Result<(), StoreError> {
        self.write(|tx| {
            tx.execute(
                "DELETE FROM sessions WHERE wallet = ?1",
                params![session.wallet],
            )?;
            tx.execute(
                "INSERT INTO sessions (token_hash, wallet, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.token_hash,
                    session.wallet,
                    session.created_at,
                    session.expires_at,
                ],
            )?;
            Ok(())
        })
    }

    fn session_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT token_hash, wallet, created_at, expires_at FROM sessions
                 WHERE token_hash = ?1",
                params![token_hash],
                session_from_row,
            )
            .optional()?)
    }

    fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        self.write(|tx| {
            let deleted = tx.execute(
                "DELETE FROM sessions WHERE token_hash = ?1",
                params![token_hash],
            )?;
            Ok(deleted > 0)
        })
    }
}
