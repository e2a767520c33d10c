use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SpendPolicy;

/// A delegated credential acting on behalf of a user, with its own spend
/// policy independent of the owner's.
///
/// `agent_token` is the bearer secret, returned once at creation and
/// immutable for the agent's lifetime. Deleting the agent invalidates the
/// token atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub agent_id: String,
    pub agent_token: String,
    pub owner_user_id: String,
    pub name: String,
    pub policy: SpendPolicy,
    pub created_at: DateTime<Utc>,
    /// Updated on every policy check performed on behalf of this agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}
