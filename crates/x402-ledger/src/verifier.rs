//! Settlement verification as a pluggable port.

use std::{collections::HashSet, convert::Infallible, sync::Mutex};

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::PaymentChallenge;

/// What a client presents after settling a challenge.
#[derive(Builder, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementProof {
    #[builder(into)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_ref: Option<String>,
    #[builder(into)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[builder(into)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_address: Option<String>,
}

impl SettlementProof {
    /// The on-chain hash when present, else the transaction reference.
    /// `None` means the proof cannot be deduplicated and is rejected.
    pub fn dedup_key(&self) -> Option<&str> {
        self.tx_hash.as_deref().or(self.transaction_ref.as_deref())
    }
}

/// A verifier's verdict on a settlement proof.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Valid(VerifiedSettlement),
    Invalid(VerifyInvalid),
}

impl VerifyOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyOutcome::Valid(_))
    }

    pub fn as_valid(&self) -> Option<&VerifiedSettlement> {
        match self {
            VerifyOutcome::Valid(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_invalid(&self) -> Option<&VerifyInvalid> {
        match self {
            VerifyOutcome::Invalid(v) => Some(v),
            _ => None,
        }
    }
}

/// On-chain metadata reported by a successful verification.
#[derive(Builder, Debug, Clone)]
pub struct VerifiedSettlement {
    pub amount_minor_units: u64,
    pub verified_at: DateTime<Utc>,
    #[builder(into)]
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    #[builder(into)]
    pub amount_native: Option<String>,
    #[builder(into)]
    pub payer_address: Option<String>,
    #[builder(into)]
    pub payee_address: Option<String>,
    #[builder(into)]
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyInvalid {
    pub invalid_reason: String,
    pub payer_address: Option<String>,
}

/// Pluggable settlement verifier.
///
/// A transport failure from an implementation surfaces to the workflow as an
/// infrastructure error, never as an implicit success.
pub trait PaymentVerifier {
    type Error: std::error::Error;

    fn verify(
        &self,
        challenge: &PaymentChallenge,
        proof: &SettlementProof,
    ) -> impl Future<Output = Result<VerifyOutcome, Self::Error>>;

    /// Whether the dedup key has already settled some challenge.
    fn is_proof_used(&self, dedup_key: &str) -> impl Future<Output = Result<bool, Self::Error>>;

    fn mark_proof_used(&self, dedup_key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Verifier test double: accepts any proof carrying a dedup key and records
/// used keys in process memory. Used in tests and local development.
#[derive(Debug, Default)]
pub struct DevVerifier {
    used: Mutex<HashSet<String>>,
}

impl DevVerifier {
    pub fn new() -> Self {
        DevVerifier::default()
    }
}

impl PaymentVerifier for DevVerifier {
    type Error = Infallible;

    async fn verify(
        &self,
        challenge: &PaymentChallenge,
        proof: &SettlementProof,
    ) -> Result<VerifyOutcome, Self::Error> {
        if proof.dedup_key().is_none() {
            return Ok(VerifyOutcome::Invalid(VerifyInvalid {
                invalid_reason: "settlement proof carries no transaction reference".to_string(),
                payer_address: proof.payer_address.clone(),
            }));
        }

        Ok(VerifyOutcome::Valid(
            VerifiedSettlement::builder()
                .amount_minor_units(challenge.amount_required_minor_units)
                .verified_at(Utc::now())
                .maybe_tx_hash(proof.tx_hash.clone())
                .maybe_payer_address(proof.payer_address.clone())
                .payee_address(challenge.payee_address.clone())
                .build(),
        ))
    }

    async fn is_proof_used(&self, dedup_key: &str) -> Result<bool, Self::Error> {
        Ok(self.used.lock().unwrap().contains(dedup_key))
    }

    async fn mark_proof_used(&self, dedup_key: &str) -> Result<(), Self::Error> {
        self.used.lock().unwrap().insert(dedup_key.to_string());
        Ok(())
    }
}
