//! In-memory adapter implementing all four persistence ports.
//!
//! One mutex guards the whole state, which makes every port operation
//! trivially atomic. Uniqueness and conditional-write behavior match the
//! sqlite adapter exactly, so tests against this store exercise the same
//! invariants production relies on.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};

use crate::{
    errors::{Error, Result},
    store::{ChallengeStore, ConsumeOutcome, PolicyAgentStore, ReceiptSessionStore, UsageStore},
    types::{Agent, ChallengeStatus, PaymentChallenge, Receipt, SessionToken, SpendPolicy},
};

#[derive(Debug, Default)]
struct State {
    challenges: HashMap<String, PaymentChallenge>,
    receipts: HashMap<String, Receipt>,
    sessions: HashMap<String, SessionToken>,
    user_policies: HashMap<String, SpendPolicy>,
    agents: HashMap<String, Agent>,
    usage: HashMap<(String, String), u64>,
}

/// Mutex-held backend for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock means a panic mid-write; nothing here panics while
        // holding the guard, so propagate rather than limp on.
        self.state.lock().expect("memory store lock poisoned")
    }
}

impl ChallengeStore for MemoryStore {
    fn insert_challenge(&self, challenge: PaymentChallenge) -> Result<()> {
        let mut state = self.lock();
        if state.challenges.contains_key(&challenge.challenge_id) {
            return Err(Error::Conflict(format!(
                "challenge already exists: {}",
                challenge.challenge_id
            )));
        }
        state
            .challenges
            .insert(challenge.challenge_id.clone(), challenge);
        Ok(())
    }

    fn challenge(&self, challenge_id: &str) -> Result<Option<PaymentChallenge>> {
        Ok(self.lock().challenges.get(challenge_id).cloned())
    }

    fn transition_challenge(
        &self,
        challenge_id: &str,
        to: ChallengeStatus,
    ) -> Result<PaymentChallenge> {
        let mut state = self.lock();
        let challenge = state
            .challenges
            .get_mut(challenge_id)
            .ok_or_else(|| Error::not_found("challenge", challenge_id))?;
        if challenge.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "challenge {challenge_id} is already {}",
                challenge.status
            )));
        }
        challenge.status = to;
        Ok(challenge.clone())
    }
}

impl ReceiptSessionStore for MemoryStore {
    fn insert_receipt(&self, receipt: Receipt) -> Result<()> {
        let mut state = self.lock();
        if state.receipts.contains_key(&receipt.receipt_id) {
            return Err(Error::Conflict(format!(
                "receipt already exists: {}",
                receipt.receipt_id
            )));
        }
        let duplicate = state.receipts.values().any(|existing| {
            existing.challenge_id == receipt.challenge_id
                || existing.transaction_ref == receipt.transaction_ref
                || (receipt.tx_hash.is_some() && existing.tx_hash == receipt.tx_hash)
        });
        if duplicate {
            return Err(Error::Conflict(format!(
                "receipt for challenge {} or proof {} already recorded",
                receipt.challenge_id,
                receipt.dedup_key()
            )));
        }
        state.receipts.insert(receipt.receipt_id.clone(), receipt);
        Ok(())
    }

    fn receipt(&self, receipt_id: &str) -> Result<Option<Receipt>> {
        Ok(self.lock().receipts.get(receipt_id).cloned())
    }

    fn receipt_by_challenge(&self, challenge_id: &str) -> Result<Option<Receipt>> {
        Ok(self
            .lock()
            .receipts
            .values()
            .find(|r| r.challenge_id == challenge_id)
            .cloned())
    }

    fn receipt_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Receipt>> {
        Ok(self
            .lock()
            .receipts
            .values()
            .find(|r| r.dedup_key() == dedup_key || r.transaction_ref == dedup_key)
            .cloned())
    }

    fn insert_session(&self, session: SessionToken) -> Result<()> {
        let mut state = self.lock();
        if state.sessions.contains_key(&session.token_id) {
            return Err(Error::Conflict(format!(
                "session already exists: {}",
                session.token_id
            )));
        }
        state.sessions.insert(session.token_id.clone(), session);
        Ok(())
    }

    fn session(&self, token_id: &str) -> Result<Option<SessionToken>> {
        Ok(self.lock().sessions.get(token_id).cloned())
    }

    fn add_credits(&self, token_id: &str, amount: u64) -> Result<Option<SessionToken>> {
        let mut state = self.lock();
        Ok(state.sessions.get_mut(token_id).map(|session| {
            session.credits += amount;
            session.clone()
        }))
    }

    fn consume_credits(&self, token_id: &str, amount: u64) -> Result<ConsumeOutcome> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(token_id) else {
            return Ok(ConsumeOutcome::NotFound);
        };
        if session.credits < amount {
            return Ok(ConsumeOutcome::Insufficient {
                available: session.credits,
            });
        }
        session.credits -= amount;
        session.access_count += 1;
        Ok(ConsumeOutcome::Consumed(session.clone()))
    }
}

impl PolicyAgentStore for MemoryStore {
    fn user_policy(&self, user_id: &str) -> Result<Option<SpendPolicy>> {
        Ok(self.lock().user_policies.get(user_id).cloned())
    }

    fn set_user_policy(&self, user_id: &str, policy: SpendPolicy) -> Result<()> {
        self.lock().user_policies.insert(user_id.to_string(), policy);
        Ok(())
    }

    fn insert_agent(&self, agent: Agent) -> Result<()> {
        let mut state = self.lock();
        if state.agents.contains_key(&agent.agent_id) {
            return Err(Error::Conflict(format!(
                "agent already exists: {}",
                agent.agent_id
            )));
        }
        if state
            .agents
            .values()
            .any(|a| a.agent_token == agent.agent_token)
        {
            return Err(Error::Conflict("agent token already in use".to_string()));
        }
        state.agents.insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    fn agent_by_id(&self, agent_id: &str) -> Result<Option<Agent>> {
        Ok(self.lock().agents.get(agent_id).cloned())
    }

    fn agent_by_token(&self, token: &str) -> Result<Option<Agent>> {
        Ok(self
            .lock()
            .agents
            .values()
            .find(|a| a.agent_token == token)
            .cloned())
    }

    fn agents_by_owner(&self, owner_user_id: &str) -> Result<Vec<Agent>> {
        let state = self.lock();
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.owner_user_id == owner_user_id)
            .cloned()
            .collect();
        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(agents)
    }

    fn touch_agent(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found("agent", agent_id))?;
        agent.last_used_at = Some(at);
        Ok(())
    }

    fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        Ok(self.lock().agents.remove(agent_id).is_some())
    }
}

impl UsageStore for MemoryStore {
    fn daily_spend(&self, subject_key: &str, day_key: &str) -> Result<u64> {
        Ok(self
            .lock()
            .usage
            .get(&(subject_key.to_string(), day_key.to_string()))
            .copied()
            .unwrap_or(0))
    }

    fn add_spend(&self, subject_key: &str, day_key: &str, amount: u64) -> Result<u64> {
        let mut state = self.lock();
        let total = state
            .usage
            .entry((subject_key.to_string(), day_key.to_string()))
            .or_insert(0);
        *total = total.saturating_add(amount);
        Ok(*total)
    }

    fn reset_daily_spend(&self, subject_key: &str, day_key: &str) -> Result<()> {
        self.lock()
            .usage
            .remove(&(subject_key.to_string(), day_key.to_string()));
        Ok(())
    }
}
