//! Challenge lifecycle: creation, lookup, and the only legal terminal
//! transitions.

use bon::Builder;
use chrono::TimeDelta;

use crate::{
    clock::Clock,
    errors::{Error, Result},
    id::{IdGenerator, prefix},
    store::ChallengeStore,
    types::{ChallengeStatus, PaymentChallenge},
};

/// Parameters for a fresh challenge.
#[derive(Builder, Debug, Clone)]
pub struct NewChallenge {
    #[builder(into)]
    pub resource_id: String,
    pub amount_required_minor_units: u64,
    pub credits_offered: u64,
    pub ttl: TimeDelta,
    #[builder(into)]
    pub currency: String,
    #[builder(into)]
    pub chain: String,
    #[builder(into)]
    pub payee_address: String,
}

/// Creates challenges and performs the pending→paid / pending→expired
/// transitions. Expiry is evaluated lazily against the clock, never by a
/// background sweep.
pub struct ChallengeManager<'g, S, C, I> {
    store: &'g S,
    clock: &'g C,
    ids: &'g I,
}

impl<'g, S, C, I> ChallengeManager<'g, S, C, I>
where
    S: ChallengeStore,
    C: Clock,
    I: IdGenerator,
{
    pub fn new(store: &'g S, clock: &'g C, ids: &'g I) -> Self {
        ChallengeManager { store, clock, ids }
    }

    pub fn create(&self, new: NewChallenge) -> Result<PaymentChallenge> {
        let now = self.clock.now();
        let challenge = PaymentChallenge {
            challenge_id: self.ids.id(prefix::CHALLENGE),
            resource_id: new.resource_id,
            amount_required_minor_units: new.amount_required_minor_units,
            currency: new.currency,
            chain: new.chain,
            payee_address: new.payee_address,
            created_at: now,
            expires_at: now + new.ttl,
            credits_offered: new.credits_offered,
            status: ChallengeStatus::Pending,
        };
        self.store.insert_challenge(challenge.clone())?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Challenge created: id='{}', resource='{}', amount={}, expires_at='{}'",
            challenge.challenge_id,
            challenge.resource_id,
            challenge.amount_required_minor_units,
            challenge.expires_at
        );

        Ok(challenge)
    }

    pub fn get(&self, challenge_id: &str) -> Result<PaymentChallenge> {
        self.store
            .challenge(challenge_id)?
            .ok_or_else(|| Error::not_found("challenge", challenge_id))
    }

    /// Fails with `Conflict` if the challenge is already terminal.
    pub fn mark_paid(&self, challenge_id: &str) -> Result<PaymentChallenge> {
        self.store
            .transition_challenge(challenge_id, ChallengeStatus::Paid)
    }

    /// Fails with `Conflict` if the challenge is already terminal.
    pub fn mark_expired(&self, challenge_id: &str) -> Result<PaymentChallenge> {
        self.store
            .transition_challenge(challenge_id, ChallengeStatus::Expired)
    }

    /// A pending, unexpired challenge, suitable for reuse; anything else is
    /// `None`.
    pub fn reusable(&self, challenge_id: &str) -> Result<Option<PaymentChallenge>> {
        let Some(challenge) = self.store.challenge(challenge_id)? else {
            return Ok(None);
        };
        if challenge.status != ChallengeStatus::Pending || challenge.is_expired(self.clock.now()) {
            return Ok(None);
        }
        Ok(Some(challenge))
    }
}
