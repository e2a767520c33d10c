use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable proof that a specific challenge was settled.
///
/// Created exactly once per challenge by the settlement workflow and
/// immutable thereafter. `transaction_ref` is unique across all receipts and
/// doubles as the dedup key when no on-chain hash is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub receipt_id: String,
    pub challenge_id: String,
    pub resource_id: String,
    /// The session this receipt minted into. A retried settlement returns
    /// the same receipt and the same session.
    pub session_token_id: String,
    pub amount_paid_minor_units: u64,
    pub currency: String,
    pub transaction_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Amount in the chain's native representation, as reported on-chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_native: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee_address: Option<String>,
    pub verified_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub credits_purchased: u64,
    pub status: ReceiptStatus,
}

impl Receipt {
    /// The settlement proof identifier used to prevent re-minting.
    pub fn dedup_key(&self) -> &str {
        self.tx_hash.as_deref().unwrap_or(&self.transaction_ref)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Confirmed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Confirmed => "confirmed",
        }
    }
}

impl Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
