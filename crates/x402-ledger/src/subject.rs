//! Resolution of a bearer credential to the policy-bearing subject.

use crate::{
    clock::Clock,
    errors::{Error, Result},
    store::PolicyAgentStore,
    types::{Agent, SpendPolicy},
};

/// What the edge layer extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectCredential {
    /// An opaque agent bearer token.
    AgentToken(String),
    /// A known user id (the edge layer's own authentication).
    User(String),
    Anonymous,
}

/// The rate/cap-limited entity: a scoped agent or a (possibly anonymous)
/// user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Agent(Agent),
    User(String),
    Anonymous,
}

impl Subject {
    /// The usage-store key: `agent:<id>` or `user:<id>`.
    pub fn key(&self) -> String {
        match self {
            Subject::Agent(agent) => format!("agent:{}", agent.agent_id),
            Subject::User(user_id) => format!("user:{user_id}"),
            Subject::Anonymous => "user:anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedSubject {
    pub subject: Subject,
    pub policy: SpendPolicy,
}

/// Resolves a credential to its subject and governing policy.
///
/// An agent token selects the agent's own policy, not its owner's, and
/// stamps `last_used_at`. A known user gets their stored policy or the
/// default; anonymous callers get the default.
pub fn resolve_subject<S: PolicyAgentStore, C: Clock>(
    store: &S,
    clock: &C,
    credential: &SubjectCredential,
    default_policy: &SpendPolicy,
) -> Result<ResolvedSubject> {
    match credential {
        SubjectCredential::AgentToken(token) => {
            let agent = store
                .agent_by_token(token)?
                .ok_or_else(|| Error::Unauthorized("invalid agent token".to_string()))?;
            store.touch_agent(&agent.agent_id, clock.now())?;
            let policy = agent.policy.clone();
            Ok(ResolvedSubject {
                subject: Subject::Agent(agent),
                policy,
            })
        }
        SubjectCredential::User(user_id) => {
            let policy = store
                .user_policy(user_id)?
                .unwrap_or_else(|| default_policy.clone());
            Ok(ResolvedSubject {
                subject: Subject::User(user_id.clone()),
                policy,
            })
        }
        SubjectCredential::Anonymous => Ok(ResolvedSubject {
            subject: Subject::Anonymous,
            policy: default_policy.clone(),
        }),
    }
}
