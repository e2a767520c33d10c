//! Atomic credit operations on a session.

use crate::{
    errors::{Error, Result},
    store::{ConsumeOutcome, ReceiptSessionStore},
    types::SessionToken,
};

/// Credit consume / add / balance reads, keyed by session id. Balances are
/// read-after-write consistent from the backing store; no cache sits between
/// a write and a policy decision.
pub struct SessionLedger<'g, S> {
    store: &'g S,
}

impl<'g, S: ReceiptSessionStore> SessionLedger<'g, S> {
    pub fn new(store: &'g S) -> Self {
        SessionLedger { store }
    }

    pub fn get(&self, token_id: &str) -> Result<SessionToken> {
        self.store
            .session(token_id)?
            .ok_or_else(|| Error::not_found("session", token_id))
    }

    /// One conditional decrement; concurrent consumers can never drive the
    /// balance negative. `access_count` bumps only on success.
    pub fn consume(&self, token_id: &str, amount: u64) -> Result<SessionToken> {
        match self.store.consume_credits(token_id, amount)? {
            ConsumeOutcome::Consumed(session) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Credits consumed: session='{token_id}', amount={amount}, remaining={}",
                    session.credits
                );
                Ok(session)
            }
            ConsumeOutcome::NotFound => Err(Error::not_found("session", token_id)),
            ConsumeOutcome::Insufficient { available } => Err(Error::InsufficientCredits {
                required: amount,
                available,
            }),
        }
    }

    pub fn add(&self, token_id: &str, amount: u64) -> Result<SessionToken> {
        self.store
            .add_credits(token_id, amount)?
            .ok_or_else(|| Error::not_found("session", token_id))
    }
}
