//! The verification & ledger workflow: load → validate → verify → mint,
//! exactly once per settlement proof.

use bon::Builder;
use chrono::TimeDelta;

use crate::{
    clock::Clock,
    errors::{Error, Result},
    id::{IdGenerator, prefix},
    store::{ChallengeStore, ReceiptSessionStore},
    types::{ChallengeStatus, PaymentChallenge, Receipt, ReceiptStatus, SessionToken},
    verifier::{PaymentVerifier, SettlementProof, VerifyOutcome},
};

/// Input to [`SettlementWorkflow::verify_and_issue`].
#[derive(Builder, Debug, Clone)]
pub struct SettleRequest {
    #[builder(into)]
    pub challenge_id: String,
    pub proof: SettlementProof,
    /// Credit this session instead of minting a new one.
    #[builder(into)]
    pub existing_session_token_id: Option<String>,
}

/// A settled challenge: the (possibly pre-existing) receipt and the session
/// holding the minted credits.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub receipt: Receipt,
    pub session: SessionToken,
}

/// Orchestrates settlement. Duplicate calls for the same proof return the
/// previously minted receipt and session; under concurrent duplicates the
/// receipt store's uniqueness gate picks exactly one winner and the loser
/// falls back to the same lookup path.
pub struct SettlementWorkflow<'g, S, V, C, I> {
    store: &'g S,
    verifier: &'g V,
    clock: &'g C,
    ids: &'g I,
    session_ttl: TimeDelta,
}

impl<'g, S, V, C, I> SettlementWorkflow<'g, S, V, C, I>
where
    S: ChallengeStore + ReceiptSessionStore,
    V: PaymentVerifier,
    C: Clock,
    I: IdGenerator,
{
    pub fn new(
        store: &'g S,
        verifier: &'g V,
        clock: &'g C,
        ids: &'g I,
        session_ttl: TimeDelta,
    ) -> Self {
        SettlementWorkflow {
            store,
            verifier,
            clock,
            ids,
            session_ttl,
        }
    }

    pub async fn verify_and_issue(&self, request: SettleRequest) -> Result<Settlement> {
        let challenge = self
            .store
            .challenge(&request.challenge_id)?
            .ok_or_else(|| Error::not_found("challenge", &request.challenge_id))?;

        let now = self.clock.now();
        match challenge.status {
            ChallengeStatus::Pending => {
                if challenge.is_expired(now) {
                    return Err(Error::invalid_payment(format!(
                        "challenge {} expired at {}",
                        challenge.challenge_id, challenge.expires_at
                    )));
                }
            }
            // A retry of the settling proof is the one legitimate success
            // for a paid challenge: it returns the minted result, not a new
            // one. Any other proof fails below.
            ChallengeStatus::Paid => {
                let dedup_key = request.proof.dedup_key().ok_or_else(|| {
                    Error::invalid_payment(format!(
                        "challenge {} already paid",
                        challenge.challenge_id
                    ))
                })?;
                return self.existing_settlement(&challenge, dedup_key);
            }
            ChallengeStatus::Expired => {
                return Err(Error::invalid_payment(format!(
                    "challenge {} already expired",
                    challenge.challenge_id
                )));
            }
        }

        let dedup_key = request
            .proof
            .dedup_key()
            .ok_or_else(|| Error::invalid_payment("settlement proof missing"))?
            .to_string();

        // An existing session must be present before anything is minted into
        // it; failing here leaves the challenge untouched.
        if let Some(token_id) = &request.existing_session_token_id
            && self.store.session(token_id)?.is_none()
        {
            return Err(Error::not_found("session", token_id));
        }

        // Idempotency gate: a used proof is only a success if it already
        // settled this exact challenge.
        let used = self
            .verifier
            .is_proof_used(&dedup_key)
            .await
            .map_err(|err| Error::internal(format!("payment verifier failure: {err}")))?;
        if used {
            return self.existing_settlement(&challenge, &dedup_key);
        }

        let outcome = self
            .verifier
            .verify(&challenge, &request.proof)
            .await
            .map_err(|err| Error::internal(format!("payment verifier failure: {err}")))?;
        let verified = match outcome {
            VerifyOutcome::Valid(v) => v,
            VerifyOutcome::Invalid(invalid) => {
                return Err(Error::InvalidPayment(invalid.invalid_reason));
            }
        };

        let session_token_id = request
            .existing_session_token_id
            .clone()
            .unwrap_or_else(|| self.ids.id(prefix::SESSION));

        let receipt = Receipt {
            receipt_id: self.ids.id(prefix::RECEIPT),
            challenge_id: challenge.challenge_id.clone(),
            resource_id: challenge.resource_id.clone(),
            session_token_id: session_token_id.clone(),
            amount_paid_minor_units: verified.amount_minor_units,
            currency: challenge.currency.clone(),
            transaction_ref: request
                .proof
                .transaction_ref
                .clone()
                .unwrap_or_else(|| dedup_key.clone()),
            tx_hash: verified.tx_hash.clone().or(request.proof.tx_hash.clone()),
            explorer_url: verified.explorer_url,
            block_number: verified.block_number,
            amount_native: verified.amount_native,
            payer_address: verified
                .payer_address
                .or(request.proof.payer_address.clone()),
            payee_address: verified.payee_address,
            verified_at: verified.verified_at,
            expires_at: now + self.session_ttl,
            credits_purchased: challenge.credits_offered,
            status: ReceiptStatus::Confirmed,
        };

        // The receipt insert is the uniqueness gate: exactly one of any
        // concurrent duplicate callers gets past it.
        if let Err(err) = self.store.insert_receipt(receipt.clone()) {
            return match err {
                Error::Conflict(_) => self.existing_settlement(&challenge, &dedup_key),
                other => Err(other),
            };
        }

        // The session is written immediately after the receipt: once both
        // exist, a failure in any later step leaves state a retry can
        // resolve through the lookup path.
        let session = match &request.existing_session_token_id {
            Some(token_id) => self
                .store
                .add_credits(token_id, challenge.credits_offered)?
                .ok_or_else(|| Error::not_found("session", token_id))?,
            None => {
                let session = SessionToken {
                    token_id: session_token_id,
                    credits: challenge.credits_offered,
                    currency: challenge.currency.clone(),
                    created_at: now,
                    expires_at: now + self.session_ttl,
                    access_count: 0,
                };
                self.store.insert_session(session.clone())?;
                session
            }
        };

        self.store
            .transition_challenge(&challenge.challenge_id, ChallengeStatus::Paid)?;
        self.verifier
            .mark_proof_used(&dedup_key)
            .await
            .map_err(|err| Error::internal(format!("payment verifier failure: {err}")))?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Settlement recorded: receipt='{}', session='{}', credits={}",
            receipt.receipt_id,
            session.token_id,
            session.credits
        );

        Ok(Settlement { receipt, session })
    }

    /// The retried-call success path: locate the receipt already minted for
    /// this challenge and return it with the current session. A proof that
    /// settled a *different* challenge is a reused proof, not a retry.
    fn existing_settlement(
        &self,
        challenge: &PaymentChallenge,
        dedup_key: &str,
    ) -> Result<Settlement> {
        let receipt = match self.store.receipt_by_challenge(&challenge.challenge_id)? {
            Some(receipt) => receipt,
            None => self
                .store
                .receipt_by_dedup_key(dedup_key)?
                .filter(|r| r.challenge_id == challenge.challenge_id)
                .ok_or_else(|| {
                    Error::invalid_payment(format!("payment proof already used: {dedup_key}"))
                })?,
        };

        if receipt.dedup_key() != dedup_key && receipt.transaction_ref != dedup_key {
            return Err(Error::invalid_payment(format!(
                "challenge {} was settled by a different proof",
                challenge.challenge_id
            )));
        }

        // A concurrent winner may still be between its receipt insert and
        // its session write; that window is retryable, not a lost session.
        let session = self.store.session(&receipt.session_token_id)?.ok_or_else(|| {
            Error::Conflict(format!(
                "settlement for challenge {} is still being recorded",
                challenge.challenge_id
            ))
        })?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Duplicate settlement call returned existing receipt '{}'",
            receipt.receipt_id
        );

        Ok(Settlement { receipt, session })
    }
}
