//! Sqlite adapter for the four x402-ledger persistence ports.
//!
//! One connection behind a mutex; every hot-path mutation is a single
//! conditional statement, so the uniqueness and atomicity invariants hold
//! identically to the in-memory adapter. Constraint violations surface as
//! `Error::Conflict`, which is what the settlement workflow's race-loser
//! fallback keys on.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use x402_ledger::{
    errors::{Error, Result},
    store::{ChallengeStore, ConsumeOutcome, PolicyAgentStore, ReceiptSessionStore, UsageStore},
    types::{
        Agent, ChallengeStatus, PaymentChallenge, Receipt, ReceiptStatus, SessionToken, SpendPolicy,
    },
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS challenges (
    challenge_id            TEXT PRIMARY KEY,
    resource_id             TEXT NOT NULL,
    amount_required         INTEGER NOT NULL,
    currency                TEXT NOT NULL,
    chain                   TEXT NOT NULL,
    payee_address           TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    expires_at              TEXT NOT NULL,
    credits_offered         INTEGER NOT NULL,
    status                  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS receipts (
    receipt_id              TEXT PRIMARY KEY,
    challenge_id            TEXT NOT NULL UNIQUE,
    resource_id             TEXT NOT NULL,
    session_token_id        TEXT NOT NULL,
    amount_paid             INTEGER NOT NULL,
    currency                TEXT NOT NULL,
    transaction_ref         TEXT NOT NULL UNIQUE,
    tx_hash                 TEXT UNIQUE,
    explorer_url            TEXT,
    block_number            INTEGER,
    amount_native           TEXT,
    payer_address           TEXT,
    payee_address           TEXT,
    verified_at             TEXT NOT NULL,
    expires_at              TEXT NOT NULL,
    credits_purchased       INTEGER NOT NULL,
    status                  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    token_id                TEXT PRIMARY KEY,
    credits                 INTEGER NOT NULL,
    currency                TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    expires_at              TEXT NOT NULL,
    access_count            INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS policies (
    user_id                 TEXT PRIMARY KEY,
    policy_json             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    agent_id                TEXT PRIMARY KEY,
    agent_token             TEXT NOT NULL UNIQUE,
    owner_user_id           TEXT NOT NULL,
    name                    TEXT NOT NULL,
    policy_json             TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    last_used_at            TEXT
);

CREATE TABLE IF NOT EXISTS usage (
    subject_id              TEXT NOT NULL,
    day_key                 TEXT NOT NULL,
    spend                   INTEGER NOT NULL,
    PRIMARY KEY (subject_id, day_key)
);
";

/// Durable backend implementing all four persistence ports.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database; used by tests that want the real SQL
    /// paths without a file on disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!("sqlite ledger schema ready");
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // Nothing panics while holding the guard; a poisoned lock is a bug.
        self.conn.lock().expect("sqlite connection lock poisoned")
    }
}

fn db_err(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(format!("uniqueness constraint violated: {err}"))
        }
        _ => Error::internal(format!("sqlite failure: {err}")),
    }
}

fn to_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn from_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| Error::internal(format!("bad timestamp in sqlite row: {err}")))
}

fn challenge_from_row(row: &Row) -> rusqlite::Result<(PaymentChallenge, String, String, String)> {
    let created_at: String = row.get("created_at")?;
    let expires_at: String = row.get("expires_at")?;
    let status: String = row.get("status")?;
    let challenge = PaymentChallenge {
        challenge_id: row.get("challenge_id")?,
        resource_id: row.get("resource_id")?,
        amount_required_minor_units: row.get::<_, i64>("amount_required")? as u64,
        currency: row.get("currency")?,
        chain: row.get("chain")?,
        payee_address: row.get("payee_address")?,
        created_at: DateTime::UNIX_EPOCH, // patched by the caller
        expires_at: DateTime::UNIX_EPOCH,
        credits_offered: row.get::<_, i64>("credits_offered")? as u64,
        status: ChallengeStatus::Pending,
    };
    Ok((challenge, created_at, expires_at, status))
}

fn finish_challenge(
    (mut challenge, created_at, expires_at, status): (PaymentChallenge, String, String, String),
) -> Result<PaymentChallenge> {
    challenge.created_at = from_ts(&created_at)?;
    challenge.expires_at = from_ts(&expires_at)?;
    challenge.status = status
        .parse::<ChallengeStatus>()
        .map_err(Error::internal)?;
    Ok(challenge)
}

fn receipt_from_row(row: &Row) -> rusqlite::Result<(Receipt, String, String)> {
    let verified_at: String = row.get("verified_at")?;
    let expires_at: String = row.get("expires_at")?;
    let receipt = Receipt {
        receipt_id: row.get("receipt_id")?,
        challenge_id: row.get("challenge_id")?,
        resource_id: row.get("resource_id")?,
        session_token_id: row.get("session_token_id")?,
        amount_paid_minor_units: row.get::<_, i64>("amount_paid")? as u64,
        currency: row.get("currency")?,
        transaction_ref: row.get("transaction_ref")?,
        tx_hash: row.get("tx_hash")?,
        explorer_url: row.get("explorer_url")?,
        block_number: row.get::<_, Option<i64>>("block_number")?.map(|n| n as u64),
        amount_native: row.get("amount_native")?,
        payer_address: row.get("payer_address")?,
        payee_address: row.get("payee_address")?,
        verified_at: DateTime::UNIX_EPOCH,
        expires_at: DateTime::UNIX_EPOCH,
        credits_purchased: row.get::<_, i64>("credits_purchased")? as u64,
        status: ReceiptStatus::Confirmed,
    };
    Ok((receipt, verified_at, expires_at))
}

fn finish_receipt((mut receipt, verified_at, expires_at): (Receipt, String, String)) -> Result<Receipt> {
    receipt.verified_at = from_ts(&verified_at)?;
    receipt.expires_at = from_ts(&expires_at)?;
    Ok(receipt)
}

fn session_from_row(row: &Row) -> rusqlite::Result<(SessionToken, String, String)> {
    let created_at: String = row.get("created_at")?;
    let expires_at: String = row.get("expires_at")?;
    let session = SessionToken {
        token_id: row.get("token_id")?,
        credits: row.get::<_, i64>("credits")? as u64,
        currency: row.get("currency")?,
        created_at: DateTime::UNIX_EPOCH,
        expires_at: DateTime::UNIX_EPOCH,
        access_count: row.get::<_, i64>("access_count")? as u64,
    };
    Ok((session, created_at, expires_at))
}

fn finish_session(
    (mut session, created_at, expires_at): (SessionToken, String, String),
) -> Result<SessionToken> {
    session.created_at = from_ts(&created_at)?;
    session.expires_at = from_ts(&expires_at)?;
    Ok(session)
}

fn agent_from_row(row: &Row) -> rusqlite::Result<(Agent, String, String, Option<String>)> {
    let policy_json: String = row.get("policy_json")?;
    let created_at: String = row.get("created_at")?;
    let last_used_at: Option<String> = row.get("last_used_at")?;
    let agent = Agent {
        agent_id: row.get("agent_id")?,
        agent_token: row.get("agent_token")?,
        owner_user_id: row.get("owner_user_id")?,
        name: row.get("name")?,
        policy: SpendPolicy::default(), // patched by the caller
        created_at: DateTime::UNIX_EPOCH,
        last_used_at: None,
    };
    Ok((agent, policy_json, created_at, last_used_at))
}

fn finish_agent(
    (mut agent, policy_json, created_at, last_used_at): (Agent, String, String, Option<String>),
) -> Result<Agent> {
    agent.policy = serde_json::from_str(&policy_json)
        .map_err(|err| Error::internal(format!("bad policy json in sqlite row: {err}")))?;
    agent.created_at = from_ts(&created_at)?;
    agent.last_used_at = last_used_at.as_deref().map(from_ts).transpose()?;
    Ok(agent)
}

impl ChallengeStore for SqliteStore {
    fn insert_challenge(&self, challenge: PaymentChallenge) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO challenges (challenge_id, resource_id, amount_required, currency,
                     chain, payee_address, created_at, expires_at, credits_offered, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    challenge.challenge_id,
                    challenge.resource_id,
                    challenge.amount_required_minor_units as i64,
                    challenge.currency,
                    challenge.chain,
                    challenge.payee_address,
                    to_ts(challenge.created_at),
                    to_ts(challenge.expires_at),
                    challenge.credits_offered as i64,
                    challenge.status.as_str(),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn challenge(&self, challenge_id: &str) -> Result<Option<PaymentChallenge>> {
        self.lock()
            .query_row(
                "SELECT * FROM challenges WHERE challenge_id = ?1",
                params![challenge_id],
                challenge_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_challenge)
            .transpose()
    }

    fn transition_challenge(
        &self,
        challenge_id: &str,
        to: ChallengeStatus,
    ) -> Result<PaymentChallenge> {
        let conn = self.lock();
        let affected = conn
            .execute(
                "UPDATE challenges SET status = ?2
                 WHERE challenge_id = ?1 AND status = 'pending'",
                params![challenge_id, to.as_str()],
            )
            .map_err(db_err)?;

        let row = conn
            .query_row(
                "SELECT * FROM challenges WHERE challenge_id = ?1",
                params![challenge_id],
                challenge_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_challenge)
            .transpose()?;

        match row {
            None => Err(Error::not_found("challenge", challenge_id)),
            Some(challenge) if affected == 0 => Err(Error::Conflict(format!(
                "challenge {challenge_id} is already {}",
                challenge.status
            ))),
            Some(challenge) => Ok(challenge),
        }
    }
}

impl ReceiptSessionStore for SqliteStore {
    fn insert_receipt(&self, receipt: Receipt) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO receipts (receipt_id, challenge_id, resource_id, session_token_id,
                     amount_paid, currency, transaction_ref, tx_hash, explorer_url, block_number,
                     amount_native, payer_address, payee_address, verified_at, expires_at,
                     credits_purchased, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    receipt.receipt_id,
                    receipt.challenge_id,
                    receipt.resource_id,
                    receipt.session_token_id,
                    receipt.amount_paid_minor_units as i64,
                    receipt.currency,
                    receipt.transaction_ref,
                    receipt.tx_hash,
                    receipt.explorer_url,
                    receipt.block_number.map(|n| n as i64),
                    receipt.amount_native,
                    receipt.payer_address,
                    receipt.payee_address,
                    to_ts(receipt.verified_at),
                    to_ts(receipt.expires_at),
                    receipt.credits_purchased as i64,
                    receipt.status.as_str(),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn receipt(&self, receipt_id: &str) -> Result<Option<Receipt>> {
        self.lock()
            .query_row(
                "SELECT * FROM receipts WHERE receipt_id = ?1",
                params![receipt_id],
                receipt_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_receipt)
            .transpose()
    }

    fn receipt_by_challenge(&self, challenge_id: &str) -> Result<Option<Receipt>> {
        self.lock()
            .query_row(
                "SELECT * FROM receipts WHERE challenge_id = ?1",
                params![challenge_id],
                receipt_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_receipt)
            .transpose()
    }

    fn receipt_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Receipt>> {
        self.lock()
            .query_row(
                "SELECT * FROM receipts WHERE tx_hash = ?1 OR transaction_ref = ?1",
                params![dedup_key],
                receipt_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_receipt)
            .transpose()
    }

    fn insert_session(&self, session: SessionToken) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO sessions (token_id, credits, currency, created_at, expires_at, access_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.token_id,
                    session.credits as i64,
                    session.currency,
                    to_ts(session.created_at),
                    to_ts(session.expires_at),
                    session.access_count as i64,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn session(&self, token_id: &str) -> Result<Option<SessionToken>> {
        self.lock()
            .query_row(
                "SELECT * FROM sessions WHERE token_id = ?1",
                params![token_id],
                session_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_session)
            .transpose()
    }

    fn add_credits(&self, token_id: &str, amount: u64) -> Result<Option<SessionToken>> {
        let conn = self.lock();
        let affected = conn
            .execute(
                "UPDATE sessions SET credits = credits + ?2 WHERE token_id = ?1",
                params![token_id, amount as i64],
            )
            .map_err(db_err)?;
        if affected == 0 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT * FROM sessions WHERE token_id = ?1",
            params![token_id],
            session_from_row,
        )
        .optional()
        .map_err(db_err)?
        .map(finish_session)
        .transpose()
    }

    fn consume_credits(&self, token_id: &str, amount: u64) -> Result<ConsumeOutcome> {
        let conn = self.lock();
        // One conditional statement; concurrent consumers serialize on the
        // row and the balance can never go below zero.
        let affected = conn
            .execute(
                "UPDATE sessions SET credits = credits - ?2, access_count = access_count + 1
                 WHERE token_id = ?1 AND credits >= ?2",
                params![token_id, amount as i64],
            )
            .map_err(db_err)?;

        let session = conn
            .query_row(
                "SELECT * FROM sessions WHERE token_id = ?1",
                params![token_id],
                session_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_session)
            .transpose()?;

        match session {
            None => Ok(ConsumeOutcome::NotFound),
            Some(session) if affected == 0 => Ok(ConsumeOutcome::Insufficient {
                available: session.credits,
            }),
            Some(session) => Ok(ConsumeOutcome::Consumed(session)),
        }
    }
}

impl PolicyAgentStore for SqliteStore {
    fn user_policy(&self, user_id: &str) -> Result<Option<SpendPolicy>> {
        let raw: Option<String> = self
            .lock()
            .query_row(
                "SELECT policy_json FROM policies WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|err| Error::internal(format!("bad policy json in sqlite row: {err}")))
        })
        .transpose()
    }

    fn set_user_policy(&self, user_id: &str, policy: SpendPolicy) -> Result<()> {
        let json = serde_json::to_string(&policy)
            .map_err(|err| Error::internal(format!("policy serialization failed: {err}")))?;
        self.lock()
            .execute(
                "INSERT INTO policies (user_id, policy_json) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET policy_json = excluded.policy_json",
                params![user_id, json],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn insert_agent(&self, agent: Agent) -> Result<()> {
        let json = serde_json::to_string(&agent.policy)
            .map_err(|err| Error::internal(format!("policy serialization failed: {err}")))?;
        self.lock()
            .execute(
                "INSERT INTO agents (agent_id, agent_token, owner_user_id, name, policy_json,
                     created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    agent.agent_id,
                    agent.agent_token,
                    agent.owner_user_id,
                    agent.name,
                    json,
                    to_ts(agent.created_at),
                    agent.last_used_at.map(to_ts),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn agent_by_id(&self, agent_id: &str) -> Result<Option<Agent>> {
        self.lock()
            .query_row(
                "SELECT * FROM agents WHERE agent_id = ?1",
                params![agent_id],
                agent_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_agent)
            .transpose()
    }

    fn agent_by_token(&self, token: &str) -> Result<Option<Agent>> {
        self.lock()
            .query_row(
                "SELECT * FROM agents WHERE agent_token = ?1",
                params![token],
                agent_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_agent)
            .transpose()
    }

    fn agents_by_owner(&self, owner_user_id: &str) -> Result<Vec<Agent>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM agents WHERE owner_user_id = ?1
                 ORDER BY created_at DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![owner_user_id], agent_from_row)
            .map_err(db_err)?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(finish_agent(row.map_err(db_err)?)?);
        }
        Ok(agents)
    }

    fn touch_agent(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()> {
        let affected = self
            .lock()
            .execute(
                "UPDATE agents SET last_used_at = ?2 WHERE agent_id = ?1",
                params![agent_id, to_ts(at)],
            )
            .map_err(db_err)?;
        if affected == 0 {
            return Err(Error::not_found("agent", agent_id));
        }
        Ok(())
    }

    fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        let affected = self
            .lock()
            .execute("DELETE FROM agents WHERE agent_id = ?1", params![agent_id])
            .map_err(db_err)?;
        Ok(affected > 0)
    }
}

impl UsageStore for SqliteStore {
    fn daily_spend(&self, subject_key: &str, day_key: &str) -> Result<u64> {
        let spend: Option<i64> = self
            .lock()
            .query_row(
                "SELECT spend FROM usage WHERE subject_id = ?1 AND day_key = ?2",
                params![subject_key, day_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(spend.unwrap_or(0) as u64)
    }

    fn add_spend(&self, subject_key: &str, day_key: &str, amount: u64) -> Result<u64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO usage (subject_id, day_key, spend) VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_id, day_key) DO UPDATE SET spend = spend + excluded.spend",
            params![subject_key, day_key, amount as i64],
        )
        .map_err(db_err)?;
        let total: i64 = conn
            .query_row(
                "SELECT spend FROM usage WHERE subject_id = ?1 AND day_key = ?2",
                params![subject_key, day_key],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(total as u64)
    }

    fn reset_daily_spend(&self, subject_key: &str, day_key: &str) -> Result<()> {
        self.lock()
            .execute(
                "DELETE FROM usage WHERE subject_id = ?1 AND day_key = ?2",
                params![subject_key, day_key],
            )
            .map_err(db_err)?;
        Ok(())
    }
}
