//! The facade the edge layer talks to.
//!
//! [`Gate`] owns one storage backend (bound by all four persistence ports),
//! the payment verifier, the clock, and the id generator, and exposes the
//! four edge call shapes: issue-or-reuse challenge, verify-and-issue
//! session, check spend policy, consume-and-record spend. Everything takes
//! plain data in and returns plain data or a tagged [`Error`] out; transport
//! mapping belongs to the caller.

use bon::Builder;
use chrono::TimeDelta;

use crate::{
    agents::AgentDirectory,
    challenge::{ChallengeManager, NewChallenge},
    clock::Clock,
    errors::{Error, Result},
    id::IdGenerator,
    policy::{PolicyDecision, check_policy},
    session::SessionLedger,
    settlement::{Settlement, SettlementWorkflow},
    store::{ChallengeStore, PolicyAgentStore, ReceiptSessionStore, UsageStore},
    subject::{SubjectCredential, resolve_subject},
    types::{PaymentChallenge, SessionToken, SpendPolicy},
    usage::UsageAggregator,
    verifier::PaymentVerifier,
};

pub use crate::settlement::SettleRequest;

/// Ledger-wide configuration: where payments go and how long artifacts live.
#[derive(Builder, Debug, Clone)]
pub struct GateConfig {
    /// Destination address written into every challenge.
    #[builder(into)]
    pub payee_address: String,
    /// ISO currency code of all minor-unit amounts.
    #[builder(into, default = String::from("USD"))]
    pub currency: String,
    /// Chain label written into every challenge.
    #[builder(into, default = String::from("base"))]
    pub chain: String,
    /// How long a challenge stays settleable.
    #[builder(default = TimeDelta::minutes(10))]
    pub challenge_ttl: TimeDelta,
    /// How long minted sessions stay usable.
    #[builder(default = TimeDelta::days(30))]
    pub session_ttl: TimeDelta,
    /// Applied to users with no stored policy and to anonymous subjects.
    #[builder(default)]
    pub default_policy: SpendPolicy,
}

/// Request for [`Gate::issue_or_reuse_challenge`].
#[derive(Builder, Debug, Clone)]
pub struct ChallengeRequest {
    #[builder(into)]
    pub resource_id: String,
    pub amount_required_minor_units: u64,
    pub credits_offered: u64,
    /// Reuse this challenge if it is still pending and unexpired.
    #[builder(into)]
    pub existing_challenge_id: Option<String>,
}

/// Request for [`Gate::check_spend_policy`].
#[derive(Builder, Debug, Clone)]
pub struct SpendCheck {
    pub credential: SubjectCredential,
    pub amount_minor_units: u64,
    #[builder(into)]
    pub path: Option<String>,
    #[builder(into)]
    pub origin: Option<String>,
}

/// An allowed spend check. Denials surface as [`Error::PolicyDenied`].
#[derive(Debug, Clone)]
pub struct SpendApproval {
    pub subject_key: String,
    pub policy: SpendPolicy,
    /// The caller must surface a confirmation step before spending.
    pub needs_confirm: bool,
    pub daily_spend_minor_units: u64,
}

/// Request for [`Gate::consume_and_record_spend`].
#[derive(Builder, Debug, Clone)]
pub struct SpendRequest {
    #[builder(into)]
    pub session_token_id: String,
    pub credits: u64,
    #[builder(into)]
    pub subject_key: String,
    pub amount_minor_units: u64,
}

#[derive(Debug, Clone)]
pub struct SpendOutcome {
    pub session: SessionToken,
    pub daily_spend_minor_units: u64,
}

/// The payment & policy ledger behind one protected origin.
#[derive(Builder, Debug)]
pub struct Gate<S, V, C, I> {
    pub store: S,
    pub verifier: V,
    pub clock: C,
    pub ids: I,
    pub config: GateConfig,
}

impl<S, V, C, I> Gate<S, V, C, I>
where
    S: ChallengeStore + ReceiptSessionStore + PolicyAgentStore + UsageStore,
    V: PaymentVerifier,
    C: Clock,
    I: IdGenerator,
{
    pub fn challenges(&self) -> ChallengeManager<'_, S, C, I> {
        ChallengeManager::new(&self.store, &self.clock, &self.ids)
    }

    pub fn settlements(&self) -> SettlementWorkflow<'_, S, V, C, I> {
        SettlementWorkflow::new(
            &self.store,
            &self.verifier,
            &self.clock,
            &self.ids,
            self.config.session_ttl,
        )
    }

    pub fn sessions(&self) -> SessionLedger<'_, S> {
        SessionLedger::new(&self.store)
    }

    pub fn usage(&self) -> UsageAggregator<'_, S, C> {
        UsageAggregator::new(&self.store, &self.clock)
    }

    pub fn agents(&self) -> AgentDirectory<'_, S, C, I> {
        AgentDirectory::new(&self.store, &self.clock, &self.ids)
    }

    /// Returns the caller's still-pending challenge when one is supplied,
    /// else issues a fresh one priced from the request and the gate config.
    pub fn issue_or_reuse_challenge(&self, request: ChallengeRequest) -> Result<PaymentChallenge> {
        let challenges = self.challenges();
        if let Some(existing_id) = &request.existing_challenge_id
            && let Some(challenge) = challenges.reusable(existing_id)?
        {
            return Ok(challenge);
        }
        challenges.create(
            NewChallenge::builder()
                .resource_id(request.resource_id)
                .amount_required_minor_units(request.amount_required_minor_units)
                .credits_offered(request.credits_offered)
                .ttl(self.config.challenge_ttl)
                .currency(self.config.currency.clone())
                .chain(self.config.chain.clone())
                .payee_address(self.config.payee_address.clone())
                .build(),
        )
    }

    /// The settlement workflow: verify the proof once, mint credits once,
    /// and return the prior result on any retry of the same proof.
    pub async fn verify_and_issue_session(&self, request: SettleRequest) -> Result<Settlement> {
        self.settlements().verify_and_issue(request).await
    }

    /// Resolves the subject, loads its running daily spend, and evaluates
    /// the pure policy engine. Denials carry the reason, the evaluated
    /// policy, and the current spend so clients can react.
    pub fn check_spend_policy(&self, check: SpendCheck) -> Result<SpendApproval> {
        let resolved = resolve_subject(
            &self.store,
            &self.clock,
            &check.credential,
            &self.config.default_policy,
        )?;
        let subject_key = resolved.subject.key();
        let daily_spend = self.usage().daily_spend(&subject_key)?;

        match check_policy(
            &resolved.policy,
            check.amount_minor_units,
            check.path.as_deref(),
            check.origin.as_deref(),
            daily_spend,
        ) {
            PolicyDecision::Allowed { needs_confirm } => Ok(SpendApproval {
                subject_key,
                policy: resolved.policy,
                needs_confirm,
                daily_spend_minor_units: daily_spend,
            }),
            PolicyDecision::Denied { reason } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Spend denied: subject='{subject_key}', reason='{reason}', amount={}",
                    check.amount_minor_units
                );

                Err(Error::PolicyDenied {
                    reason,
                    subject_key,
                    policy: resolved.policy,
                    amount_minor_units: check.amount_minor_units,
                    daily_spend_minor_units: daily_spend,
                })
            }
        }
    }

    /// Consumes session credits and records the spend against the subject's
    /// daily total. Runs after a successful [`Gate::check_spend_policy`].
    pub fn consume_and_record_spend(&self, request: SpendRequest) -> Result<SpendOutcome> {
        let session = self
            .sessions()
            .consume(&request.session_token_id, request.credits)?;
        let daily_spend_minor_units = self
            .usage()
            .add_spend(&request.subject_key, request.amount_minor_units)?;
        Ok(SpendOutcome {
            session,
            daily_spend_minor_units,
        })
    }
}
