//! Narrow persistence ports.
//!
//! Four interfaces, one per concern. Both adapters (the in-memory store here
//! and the sqlite store in `x402-ledger-sqlite`) must uphold the same
//! uniqueness and atomicity invariants: hot-path mutations are single
//! conditional operations, never read-then-write in two steps.

pub mod memory;

use chrono::{DateTime, Utc};

use crate::{
    errors::Result,
    types::{Agent, ChallengeStatus, PaymentChallenge, Receipt, SessionToken, SpendPolicy},
};

/// Challenge CRUD plus the conditional status transition.
pub trait ChallengeStore: Send + Sync {
    fn insert_challenge(&self, challenge: PaymentChallenge) -> Result<()>;

    fn challenge(&self, challenge_id: &str) -> Result<Option<PaymentChallenge>>;

    /// Flip a pending challenge to a terminal status. Fails with `Conflict`
    /// if the challenge is already terminal, `NotFound` if absent. The only
    /// legal writer of `status`.
    fn transition_challenge(
        &self,
        challenge_id: &str,
        to: ChallengeStatus,
    ) -> Result<PaymentChallenge>;
}

/// Receipts and sessions share a store: the settlement workflow's
/// uniqueness gate lives on receipt insert, and sessions are minted in the
/// same breath.
pub trait ReceiptSessionStore: Send + Sync {
    /// Insert a receipt, enforcing uniqueness of `challenge_id`,
    /// `transaction_ref`, and `tx_hash` across all receipts. A duplicate
    /// fails with `Conflict`; the caller falls back to the idempotent
    /// lookup path.
    fn insert_receipt(&self, receipt: Receipt) -> Result<()>;

    fn receipt(&self, receipt_id: &str) -> Result<Option<Receipt>>;

    fn receipt_by_challenge(&self, challenge_id: &str) -> Result<Option<Receipt>>;

    fn receipt_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Receipt>>;

    fn insert_session(&self, session: SessionToken) -> Result<()>;

    fn session(&self, token_id: &str) -> Result<Option<SessionToken>>;

    /// Atomic increment. Returns the updated session, or `None` if absent.
    fn add_credits(&self, token_id: &str, amount: u64) -> Result<Option<SessionToken>>;

    /// Single atomic conditional decrement: subtract `amount` and bump
    /// `access_count` only where `credits >= amount`.
    fn consume_credits(&self, token_id: &str, amount: u64) -> Result<ConsumeOutcome>;
}

/// Outcome of a conditional consume. When the conditional write affects
/// nothing, the adapter re-reads to distinguish absence from a short balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed(SessionToken),
    NotFound,
    Insufficient { available: u64 },
}

/// User policies and agent records.
pub trait PolicyAgentStore: Send + Sync {
    fn user_policy(&self, user_id: &str) -> Result<Option<SpendPolicy>>;

    fn set_user_policy(&self, user_id: &str, policy: SpendPolicy) -> Result<()>;

    /// Insert an agent, enforcing uniqueness of `agent_token`.
    fn insert_agent(&self, agent: Agent) -> Result<()>;

    fn agent_by_id(&self, agent_id: &str) -> Result<Option<Agent>>;

    fn agent_by_token(&self, token: &str) -> Result<Option<Agent>>;

    /// Agents owned by a user, newest first.
    fn agents_by_owner(&self, owner_user_id: &str) -> Result<Vec<Agent>>;

    fn touch_agent(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Remove the agent and invalidate its token in one step. Returns
    /// whether the agent existed.
    fn delete_agent(&self, agent_id: &str) -> Result<bool>;
}

/// Per-subject, per-UTC-day cumulative spend.
pub trait UsageStore: Send + Sync {
    /// Defaults to 0 when no record exists for the day.
    fn daily_spend(&self, subject_key: &str, day_key: &str) -> Result<u64>;

    /// Atomic upsert-and-increment; returns the new total for the day.
    fn add_spend(&self, subject_key: &str, day_key: &str, amount: u64) -> Result<u64>;

    /// Deletes the day's record. Test/administrative use only; production
    /// flow lets new day keys age old records out naturally.
    fn reset_daily_spend(&self, subject_key: &str, day_key: &str) -> Result<()>;
}
