//! Pure spend-policy evaluation.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::types::SpendPolicy;

/// Machine-readable denial reasons, serialized snake_case for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    PathNotAllowed,
    OriginNotAllowed,
    ExceedsMaxPerAction,
    ExceedsDailyCap,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::PathNotAllowed => "path_not_allowed",
            DenyReason::OriginNotAllowed => "origin_not_allowed",
            DenyReason::ExceedsMaxPerAction => "exceeds_max_per_action",
            DenyReason::ExceedsDailyCap => "exceeds_daily_cap",
        }
    }
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed {
        /// The caller must surface a confirmation step before spending.
        needs_confirm: bool,
    },
    Denied {
        reason: DenyReason,
    },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allowed { .. })
    }
}

/// Evaluates a proposed spend against a policy. Pure: the decision is a
/// function of exactly these inputs, so repeated calls are identical.
///
/// Rules apply in order, first match wins: path allow-list, origin
/// allow-list, per-action ceiling, daily cap, then allow.
///
/// `needs_confirm` is true when the amount exceeds
/// `auto_approve_under_minor_units` or reaches
/// `require_confirm_above_minor_units`. The two thresholds are independently
/// configurable and may overlap or leave a gap; the confirm floor always
/// wins, so a gap between them widens the confirmation range rather than
/// creating an undefined band.
pub fn check_policy(
    policy: &SpendPolicy,
    amount_minor_units: u64,
    path: Option<&str>,
    origin: Option<&str>,
    daily_spend_minor_units: u64,
) -> PolicyDecision {
    if let Some(path) = path
        && !policy.allowed_paths.matches(path)
    {
        return PolicyDecision::Denied {
            reason: DenyReason::PathNotAllowed,
        };
    }

    if let Some(origin) = origin
        && !policy.allowed_origins.matches(origin)
    {
        return PolicyDecision::Denied {
            reason: DenyReason::OriginNotAllowed,
        };
    }

    if amount_minor_units > policy.max_per_action_minor_units {
        return PolicyDecision::Denied {
            reason: DenyReason::ExceedsMaxPerAction,
        };
    }

    // An overflowing projected total can only be over the cap.
    if daily_spend_minor_units
        .checked_add(amount_minor_units)
        .is_none_or(|projected| projected > policy.daily_cap_minor_units)
    {
        return PolicyDecision::Denied {
            reason: DenyReason::ExceedsDailyCap,
        };
    }

    let needs_confirm = amount_minor_units > policy.auto_approve_under_minor_units
        || amount_minor_units >= policy.require_confirm_above_minor_units;

    PolicyDecision::Allowed { needs_confirm }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article_policy() -> SpendPolicy {
        SpendPolicy::builder()
            .max_per_action_minor_units(25)
            .daily_cap_minor_units(100)
            .auto_approve_under_minor_units(10)
            .require_confirm_above_minor_units(20)
            .allowed_paths(vec!["/article/*"])
            .build()
    }

    #[test]
    fn denies_amount_over_per_action_ceiling() {
        let decision = check_policy(&article_policy(), 50, Some("/article/a1"), None, 0);
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                reason: DenyReason::ExceedsMaxPerAction
            }
        );
    }

    #[test]
    fn denies_path_outside_allow_list() {
        let decision = check_policy(&article_policy(), 20, Some("/transfer"), None, 0);
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                reason: DenyReason::PathNotAllowed
            }
        );
    }

    #[test]
    fn denies_origin_outside_allow_list() {
        let policy = SpendPolicy::builder()
            .max_per_action_minor_units(25)
            .daily_cap_minor_units(100)
            .auto_approve_under_minor_units(10)
            .require_confirm_above_minor_units(20)
            .allowed_origins(vec!["https://example.com"])
            .build();
        let decision = check_policy(&policy, 5, None, Some("https://evil.example"), 0);
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                reason: DenyReason::OriginNotAllowed
            }
        );
    }

    #[test]
    fn path_rule_wins_over_amount_rule() {
        // First matching rule in order decides the reason.
        let decision = check_policy(&article_policy(), 50, Some("/transfer"), None, 0);
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                reason: DenyReason::PathNotAllowed
            }
        );
    }

    #[test]
    fn denies_when_daily_cap_would_be_exceeded() {
        // 80¢ already spent today; another 25¢ would exceed the 100¢ cap.
        let decision = check_policy(&article_policy(), 25, Some("/article/a1"), None, 80);
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                reason: DenyReason::ExceedsDailyCap
            }
        );
    }

    #[test]
    fn denies_when_projected_daily_total_overflows() {
        let decision = check_policy(&article_policy(), 25, Some("/article/a1"), None, u64::MAX);
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                reason: DenyReason::ExceedsDailyCap
            }
        );
    }

    #[test]
    fn small_amounts_auto_approve() {
        let decision = check_policy(&article_policy(), 5, Some("/article/a1"), None, 0);
        assert_eq!(
            decision,
            PolicyDecision::Allowed {
                needs_confirm: false
            }
        );
    }

    #[test]
    fn amounts_over_auto_approve_need_confirmation() {
        let decision = check_policy(&article_policy(), 15, Some("/article/a1"), None, 0);
        assert_eq!(decision, PolicyDecision::Allowed { needs_confirm: true });
    }

    #[test]
    fn confirm_floor_wins_when_thresholds_overlap() {
        // Auto-approve up to 50 but confirm from 20: 30 still needs confirm.
        let policy = SpendPolicy::builder()
            .max_per_action_minor_units(100)
            .daily_cap_minor_units(500)
            .auto_approve_under_minor_units(50)
            .require_confirm_above_minor_units(20)
            .build();
        let decision = check_policy(&policy, 30, None, None, 0);
        assert_eq!(decision, PolicyDecision::Allowed { needs_confirm: true });
    }

    #[test]
    fn decision_is_deterministic() {
        let policy = article_policy();
        let first = check_policy(&policy, 15, Some("/article/a1"), None, 40);
        for _ in 0..10 {
            assert_eq!(
                first,
                check_policy(&policy, 15, Some("/article/a1"), None, 40)
            );
        }
    }
}
