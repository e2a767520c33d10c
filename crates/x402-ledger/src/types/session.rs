use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bearer-credentialed credit balance usable across resource accesses.
///
/// `credits` never goes negative; `access_count` increments only on a
/// successful consume. Settling a challenge against an existing session
/// credits this record instead of creating a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    /// The bearer credential itself.
    pub token_id: String,
    pub credits: u64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}
