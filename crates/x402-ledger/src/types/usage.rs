use serde::{Deserialize, Serialize};

/// Cumulative spend for one subject on one UTC day.
///
/// There is no midnight reset job: a new day key simply starts a fresh
/// zero-valued record while prior days remain untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// `user:<id>` or `agent:<id>`.
    pub subject_key: String,
    /// UTC calendar date, `YYYY-MM-DD`.
    pub day_key: String,
    pub spend_minor_units: u64,
}
