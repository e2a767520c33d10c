use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A priced, time-boxed request for payment tied to one resource.
///
/// Challenges are created by the challenge lifecycle manager and never
/// deleted; terminal statuses are retained for audit and idempotency lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    pub challenge_id: String,
    pub resource_id: String,
    pub amount_required_minor_units: u64,
    /// ISO currency code of the minor units, e.g. "USD".
    pub currency: String,
    /// Label of the chain the payment is expected on.
    pub chain: String,
    pub payee_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Credits minted into the session when this challenge settles.
    pub credits_offered: u64,
    pub status: ChallengeStatus,
}

impl PaymentChallenge {
    /// Expiry is evaluated lazily against the clock at the moment of use.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Status transitions are one-way: `pending` may become `paid` or `expired`,
/// and both of those are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Paid,
    Expired,
}

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChallengeStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Paid => "paid",
            ChallengeStatus::Expired => "expired",
        }
    }
}

impl Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChallengeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChallengeStatus::Pending),
            "paid" => Ok(ChallengeStatus::Paid),
            "expired" => Ok(ChallengeStatus::Expired),
            other => Err(format!("unknown challenge status: {other}")),
        }
    }
}
