//! Agent directory: delegated, independently policy-scoped credentials.

use crate::{
    clock::Clock,
    errors::{Error, Result},
    id::{IdGenerator, prefix},
    store::PolicyAgentStore,
    types::{Agent, SpendPolicy},
};

/// CRUD and token resolution for agents. The agent token is generated once
/// at creation and is the only credential that authenticates the agent.
pub struct AgentDirectory<'g, S, C, I> {
    store: &'g S,
    clock: &'g C,
    ids: &'g I,
}

impl<'g, S, C, I> AgentDirectory<'g, S, C, I>
where
    S: PolicyAgentStore,
    C: Clock,
    I: IdGenerator,
{
    pub fn new(store: &'g S, clock: &'g C, ids: &'g I) -> Self {
        AgentDirectory { store, clock, ids }
    }

    /// Creates an agent under `owner_user_id`. The returned record carries
    /// the bearer token; this is the one time it is handed out.
    pub fn create(
        &self,
        owner_user_id: impl Into<String>,
        name: impl Into<String>,
        policy: SpendPolicy,
    ) -> Result<Agent> {
        let agent = Agent {
            agent_id: self.ids.id(prefix::AGENT),
            agent_token: self.ids.token(),
            owner_user_id: owner_user_id.into(),
            name: name.into(),
            policy,
            created_at: self.clock.now(),
            last_used_at: None,
        };
        self.store.insert_agent(agent.clone())?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Agent created: id='{}', owner='{}', name='{}'",
            agent.agent_id,
            agent.owner_user_id,
            agent.name
        );

        Ok(agent)
    }

    pub fn get_by_token(&self, token: &str) -> Result<Agent> {
        self.store
            .agent_by_token(token)?
            .ok_or_else(|| Error::Unauthorized("invalid agent token".to_string()))
    }

    pub fn get_by_id(&self, agent_id: &str) -> Result<Agent> {
        self.store
            .agent_by_id(agent_id)?
            .ok_or_else(|| Error::not_found("agent", agent_id))
    }

    /// Newest first.
    pub fn list_by_owner(&self, owner_user_id: &str) -> Result<Vec<Agent>> {
        self.store.agents_by_owner(owner_user_id)
    }

    /// Stamps `last_used_at`; called on every policy check performed on
    /// behalf of the agent.
    pub fn touch_last_used(&self, agent_id: &str) -> Result<()> {
        self.store.touch_agent(agent_id, self.clock.now())
    }

    /// Removes the agent; its token stops authenticating in the same step.
    pub fn delete(&self, agent_id: &str) -> Result<()> {
        if !self.store.delete_agent(agent_id)? {
            return Err(Error::not_found("agent", agent_id));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Agent deleted: id='{agent_id}'");

        Ok(())
    }
}
