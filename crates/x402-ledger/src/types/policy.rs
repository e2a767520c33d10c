use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::pattern::PatternSet;

/// Per-subject spend limits. A value object: owners and agents each carry
/// their own copy, evaluated independently.
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendPolicy {
    /// Hard ceiling for a single action.
    pub max_per_action_minor_units: u64,
    /// Cumulative ceiling per subject per UTC day.
    pub daily_cap_minor_units: u64,
    /// Amounts at or under this auto-approve without confirmation.
    pub auto_approve_under_minor_units: u64,
    /// Amounts at or above this always require confirmation, regardless of
    /// the auto-approve threshold.
    pub require_confirm_above_minor_units: u64,
    #[builder(into, default = PatternSet::match_all())]
    pub allowed_origins: PatternSet,
    #[builder(into, default = PatternSet::match_all())]
    pub allowed_paths: PatternSet,
}

impl Default for SpendPolicy {
    /// The policy applied to users with no stored policy and to anonymous
    /// subjects: 100¢ per action, 500¢ per day, auto-approve up to 25¢.
    fn default() -> Self {
        SpendPolicy {
            max_per_action_minor_units: 100,
            daily_cap_minor_units: 500,
            auto_approve_under_minor_units: 25,
            require_confirm_above_minor_units: 100,
            allowed_origins: PatternSet::match_all(),
            allowed_paths: PatternSet::match_all(),
        }
    }
}
