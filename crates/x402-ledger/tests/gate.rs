//! End-to-end ledger behavior against the in-memory adapter and the dev
//! verifier.

use chrono::{TimeDelta, TimeZone, Utc};
use x402_ledger::{
    clock::{Clock, ManualClock},
    errors::Error,
    gate::{ChallengeRequest, Gate, GateConfig, SpendCheck, SpendRequest},
    id::UuidIds,
    policy::DenyReason,
    settlement::SettleRequest,
    store::{PolicyAgentStore, ReceiptSessionStore, UsageStore},
    subject::SubjectCredential,
    types::{ChallengeStatus, PaymentChallenge, SpendPolicy},
    verifier::{DevVerifier, PaymentVerifier, SettlementProof, VerifyOutcome},
};
use x402_ledger::store::memory::MemoryStore;

type TestGate = Gate<MemoryStore, DevVerifier, ManualClock, UuidIds>;

fn gate() -> TestGate {
    Gate::builder()
        .store(MemoryStore::new())
        .verifier(DevVerifier::new())
        .clock(ManualClock::at(
            Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap(),
        ))
        .ids(UuidIds)
        .config(
            GateConfig::builder()
                .payee_address("0x51ef9f8fcdeaf6ac4268if51d2a286c3f0b0e3b0")
                .build(),
        )
        .build()
}

fn article_challenge(gate: &TestGate) -> String {
    gate.issue_or_reuse_challenge(
        ChallengeRequest::builder()
            .resource_id("/article/a1")
            .amount_required_minor_units(50)
            .credits_offered(10)
            .build(),
    )
    .expect("challenge")
    .challenge_id
}

fn proof(reference: &str) -> SettlementProof {
    SettlementProof::builder().transaction_ref(reference).build()
}

#[tokio::test]
async fn settlement_is_idempotent() {
    let gate = gate();
    let challenge_id = article_challenge(&gate);

    let first = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id.clone())
                .proof(proof("tx1"))
                .build(),
        )
        .await
        .expect("first settlement");
    assert_eq!(first.session.credits, 10);
    assert_eq!(first.receipt.challenge_id, challenge_id);

    let second = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id.clone())
                .proof(proof("tx1"))
                .build(),
        )
        .await
        .expect("retried settlement");

    assert_eq!(second.receipt.receipt_id, first.receipt.receipt_id);
    assert_eq!(second.session.token_id, first.session.token_id);
    // Credits minted once, not twice.
    assert_eq!(second.session.credits, 10);
}

#[tokio::test]
async fn settlement_credits_an_existing_session() {
    let gate = gate();
    let first_challenge = article_challenge(&gate);
    let settled = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(first_challenge)
                .proof(proof("tx1"))
                .build(),
        )
        .await
        .expect("first settlement");

    let second_challenge = article_challenge(&gate);
    let topped_up = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(second_challenge)
                .proof(proof("tx2"))
                .existing_session_token_id(settled.session.token_id.clone())
                .build(),
        )
        .await
        .expect("top-up settlement");

    assert_eq!(topped_up.session.token_id, settled.session.token_id);
    assert_eq!(topped_up.session.credits, 20);
}

#[tokio::test]
async fn settling_into_an_unknown_session_fails_before_minting() {
    let gate = gate();
    let challenge_id = article_challenge(&gate);

    let err = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id.clone())
                .proof(proof("tx1"))
                .existing_session_token_id("sess_missing")
                .build(),
        )
        .await
        .expect_err("unknown session");
    assert!(matches!(err, Error::NotFound { entity: "session", .. }));

    // The failure left the challenge pending and settleable.
    let challenge = gate.challenges().get(&challenge_id).expect("challenge");
    assert_eq!(challenge.status, ChallengeStatus::Pending);
}

#[tokio::test]
async fn expired_challenges_reject_settlement() {
    let gate = gate();
    let challenge_id = article_challenge(&gate);
    gate.clock.advance(TimeDelta::minutes(11));

    let err = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id)
                .proof(proof("tx1"))
                .build(),
        )
        .await
        .expect_err("expired challenge");
    assert!(matches!(err, Error::InvalidPayment(reason) if reason.contains("expired")));
}

#[tokio::test]
async fn a_proof_cannot_settle_two_challenges() {
    let gate = gate();
    let first = article_challenge(&gate);
    gate.verify_and_issue_session(
        SettleRequest::builder()
            .challenge_id(first)
            .proof(proof("tx1"))
            .build(),
    )
    .await
    .expect("first settlement");

    let second = article_challenge(&gate);
    let err = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(second)
                .proof(proof("tx1"))
                .build(),
        )
        .await
        .expect_err("reused proof");
    assert!(matches!(err, Error::InvalidPayment(reason) if reason.contains("already used")));
}

#[tokio::test]
async fn a_proof_without_any_reference_is_rejected() {
    let gate = gate();
    let challenge_id = article_challenge(&gate);

    let err = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id)
                .proof(SettlementProof::default())
                .build(),
        )
        .await
        .expect_err("missing proof");
    assert!(matches!(err, Error::InvalidPayment(_)));
}

#[tokio::test]
async fn terminal_challenges_stay_terminal() {
    let gate = gate();
    let challenge_id = article_challenge(&gate);
    gate.verify_and_issue_session(
        SettleRequest::builder()
            .challenge_id(challenge_id.clone())
            .proof(proof("tx1"))
            .build(),
    )
    .await
    .expect("settlement");

    let challenge = gate.challenges().get(&challenge_id).expect("challenge");
    assert_eq!(challenge.status, ChallengeStatus::Paid);

    let err = gate
        .challenges()
        .mark_expired(&challenge_id)
        .expect_err("paid challenge cannot expire");
    assert!(matches!(err, Error::Conflict(_)));

    let err = gate
        .challenges()
        .mark_paid(&challenge_id)
        .expect_err("paid challenge cannot be re-paid");
    assert!(matches!(err, Error::Conflict(_)));
}

#[derive(Debug)]
struct ProofMarkerDown;

impl std::fmt::Display for ProofMarkerDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("proof marker unavailable")
    }
}

impl std::error::Error for ProofMarkerDown {}

/// Dev verifier whose `mark_proof_used` fails a configured number of times.
struct FlakyProofMarker {
    inner: DevVerifier,
    failures_left: std::sync::atomic::AtomicU32,
}

impl PaymentVerifier for FlakyProofMarker {
    type Error = ProofMarkerDown;

    async fn verify(
        &self,
        challenge: &PaymentChallenge,
        proof: &SettlementProof,
    ) -> Result<VerifyOutcome, Self::Error> {
        self.inner.verify(challenge, proof).await.map_err(|e| match e {})
    }

    async fn is_proof_used(&self, dedup_key: &str) -> Result<bool, Self::Error> {
        self.inner.is_proof_used(dedup_key).await.map_err(|e| match e {})
    }

    async fn mark_proof_used(&self, dedup_key: &str) -> Result<(), Self::Error> {
        let left = &self.failures_left;
        if left.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            left.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Err(ProofMarkerDown);
        }
        self.inner.mark_proof_used(dedup_key).await.map_err(|e| match e {})
    }
}

#[tokio::test]
async fn a_failed_proof_mark_does_not_strand_settled_credits() {
    let gate = Gate::builder()
        .store(MemoryStore::new())
        .verifier(FlakyProofMarker {
            inner: DevVerifier::new(),
            failures_left: std::sync::atomic::AtomicU32::new(1),
        })
        .clock(ManualClock::at(
            Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap(),
        ))
        .ids(UuidIds)
        .config(GateConfig::builder().payee_address("0xpayee").build())
        .build();

    let challenge_id = gate
        .issue_or_reuse_challenge(
            ChallengeRequest::builder()
                .resource_id("/article/a1")
                .amount_required_minor_units(50)
                .credits_offered(10)
                .build(),
        )
        .expect("challenge")
        .challenge_id;

    let err = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id.clone())
                .proof(proof("tx1"))
                .build(),
        )
        .await
        .expect_err("transient proof-marker failure");
    assert!(matches!(err, Error::Internal(_)));

    // The receipt and its session both landed before the failure.
    let receipt = gate
        .store
        .receipt_by_challenge(&challenge_id)
        .expect("lookup")
        .expect("receipt present");
    let session = gate
        .store
        .session(&receipt.session_token_id)
        .expect("lookup")
        .expect("session present");
    assert_eq!(session.credits, 10);

    // The retry resolves to the already-minted result.
    let retried = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id.clone())
                .proof(proof("tx1"))
                .build(),
        )
        .await
        .expect("retry succeeds");
    assert_eq!(retried.receipt.receipt_id, receipt.receipt_id);
    assert_eq!(retried.session.token_id, receipt.session_token_id);
    assert_eq!(retried.session.credits, 10);
    assert_eq!(
        gate.challenges().get(&challenge_id).expect("challenge").status,
        ChallengeStatus::Paid
    );
}

#[test]
fn credits_consume_to_zero_then_fail_with_amounts() {
    let gate = gate();
    let sessions = gate.sessions();
    gate.store
        .insert_session(x402_ledger::types::SessionToken {
            token_id: "sess_t".to_string(),
            credits: 10,
            currency: "USD".to_string(),
            created_at: gate.clock.now(),
            expires_at: gate.clock.now() + TimeDelta::days(30),
            access_count: 0,
        })
        .expect("seed session");

    let session = sessions.consume("sess_t", 10).expect("consume all");
    assert_eq!(session.credits, 0);
    assert_eq!(session.access_count, 1);

    let err = sessions.consume("sess_t", 1).expect_err("over-consume");
    assert!(matches!(
        err,
        Error::InsufficientCredits {
            required: 1,
            available: 0
        }
    ));
    // A failed consume does not bump the access count.
    assert_eq!(sessions.get("sess_t").expect("session").access_count, 1);
}

#[test]
fn concurrent_consumers_never_drive_a_balance_negative() {
    let gate = gate();
    gate.store
        .insert_session(x402_ledger::types::SessionToken {
            token_id: "sess_race".to_string(),
            credits: 10,
            currency: "USD".to_string(),
            created_at: gate.clock.now(),
            expires_at: gate.clock.now() + TimeDelta::days(30),
            access_count: 0,
        })
        .expect("seed session");

    let successes = std::sync::atomic::AtomicU64::new(0);
    std::thread::scope(|scope| {
        for _ in 0..20 {
            scope.spawn(|| {
                if gate.sessions().consume("sess_race", 1).is_ok() {
                    successes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(successes.load(std::sync::atomic::Ordering::SeqCst), 10);
    let session = gate.sessions().get("sess_race").expect("session");
    assert_eq!(session.credits, 0);
    assert_eq!(session.access_count, 10);
}

#[test]
fn daily_cap_accounts_for_prior_spend_and_rolls_over_at_midnight() {
    let gate = gate();
    gate.store
        .set_user_policy(
            "u1",
            SpendPolicy::builder()
                .max_per_action_minor_units(100)
                .daily_cap_minor_units(100)
                .auto_approve_under_minor_units(25)
                .require_confirm_above_minor_units(100)
                .build(),
        )
        .expect("policy");

    let check = |amount: u64| {
        gate.check_spend_policy(
            SpendCheck::builder()
                .credential(SubjectCredential::User("u1".to_string()))
                .amount_minor_units(amount)
                .build(),
        )
    };

    check(60).expect("first spend fits");
    gate.usage().add_spend("user:u1", 60).expect("record");

    let err = check(50).expect_err("60 + 50 exceeds the 100 cap");
    assert!(matches!(
        err,
        Error::PolicyDenied {
            reason: DenyReason::ExceedsDailyCap,
            daily_spend_minor_units: 60,
            ..
        }
    ));

    // Midnight UTC: a fresh day key starts at zero without touching the
    // prior day's record.
    gate.clock.advance(TimeDelta::days(1));
    let approval = check(50).expect("new day, fresh cap");
    assert_eq!(approval.daily_spend_minor_units, 0);
    assert_eq!(
        gate.store.daily_spend("user:u1", "2026-03-09").expect("prior day"),
        60
    );
}

#[test]
fn spend_totals_are_additive() {
    let gate = gate();
    let usage = gate.usage();
    for amount in [10, 20, 30] {
        usage.add_spend("agent:a1", amount).expect("add");
    }
    assert_eq!(usage.daily_spend("agent:a1").expect("total"), 60);

    let record = usage.today_record("agent:a1").expect("record");
    assert_eq!(record.subject_key, "agent:a1");
    assert_eq!(record.day_key, "2026-03-09");
    assert_eq!(record.spend_minor_units, 60);

    usage.reset_daily_spend("agent:a1").expect("reset");
    assert_eq!(usage.daily_spend("agent:a1").expect("after reset"), 0);
}

#[test]
fn spend_counters_saturate_instead_of_wrapping() {
    let gate = gate();
    let day = gate.usage().today();
    gate.store
        .add_spend("user:u1", &day, u64::MAX - 5)
        .expect("seed");
    assert_eq!(
        gate.store.add_spend("user:u1", &day, 10).expect("add"),
        u64::MAX
    );
}

#[test]
fn agent_tokens_authenticate_their_own_policy() {
    let gate = gate();
    let agent = gate
        .agents()
        .create(
            "u1",
            "research-agent",
            SpendPolicy::builder()
                .max_per_action_minor_units(25)
                .daily_cap_minor_units(100)
                .auto_approve_under_minor_units(10)
                .require_confirm_above_minor_units(20)
                .allowed_paths(vec!["/article/*"])
                .build(),
        )
        .expect("agent");

    // The agent's own policy applies, not the owner's default.
    let err = gate
        .check_spend_policy(
            SpendCheck::builder()
                .credential(SubjectCredential::AgentToken(agent.agent_token.clone()))
                .amount_minor_units(20)
                .path("/transfer")
                .build(),
        )
        .expect_err("path outside agent allow-list");
    assert!(matches!(
        err,
        Error::PolicyDenied {
            reason: DenyReason::PathNotAllowed,
            ..
        }
    ));

    let approval = gate
        .check_spend_policy(
            SpendCheck::builder()
                .credential(SubjectCredential::AgentToken(agent.agent_token.clone()))
                .amount_minor_units(15)
                .path("/article/a1")
                .build(),
        )
        .expect("allowed with confirmation");
    assert_eq!(approval.subject_key, format!("agent:{}", agent.agent_id));
    assert!(approval.needs_confirm);

    // Every policy check stamps last_used_at.
    let stored = gate.agents().get_by_id(&agent.agent_id).expect("agent");
    assert_eq!(stored.last_used_at, Some(gate.clock.now()));
}

#[test]
fn deleted_agents_stop_authenticating() {
    let gate = gate();
    let agent = gate
        .agents()
        .create("u1", "doomed", SpendPolicy::default())
        .expect("agent");

    gate.agents().delete(&agent.agent_id).expect("delete");

    let err = gate
        .agents()
        .get_by_token(&agent.agent_token)
        .expect_err("token invalidated");
    assert!(matches!(err, Error::Unauthorized(_)));

    let err = gate
        .check_spend_policy(
            SpendCheck::builder()
                .credential(SubjectCredential::AgentToken(agent.agent_token))
                .amount_minor_units(1)
                .build(),
        )
        .expect_err("credential no longer resolves");
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[test]
fn agents_list_newest_first() {
    let gate = gate();
    let older = gate
        .agents()
        .create("u1", "older", SpendPolicy::default())
        .expect("agent");
    gate.clock.advance(TimeDelta::minutes(5));
    let newer = gate
        .agents()
        .create("u1", "newer", SpendPolicy::default())
        .expect("agent");
    gate.agents()
        .create("u2", "other-owner", SpendPolicy::default())
        .expect("agent");

    let listed = gate.agents().list_by_owner("u1").expect("list");
    assert_eq!(
        listed.iter().map(|a| a.agent_id.as_str()).collect::<Vec<_>>(),
        vec![newer.agent_id.as_str(), older.agent_id.as_str()]
    );
}

#[test]
fn challenges_are_reused_while_pending_and_reissued_after_expiry() {
    let gate = gate();
    let first = gate
        .issue_or_reuse_challenge(
            ChallengeRequest::builder()
                .resource_id("/article/a1")
                .amount_required_minor_units(50)
                .credits_offered(10)
                .build(),
        )
        .expect("challenge");

    let reused = gate
        .issue_or_reuse_challenge(
            ChallengeRequest::builder()
                .resource_id("/article/a1")
                .amount_required_minor_units(50)
                .credits_offered(10)
                .existing_challenge_id(first.challenge_id.clone())
                .build(),
        )
        .expect("reuse");
    assert_eq!(reused.challenge_id, first.challenge_id);

    gate.clock.advance(TimeDelta::minutes(11));
    let fresh = gate
        .issue_or_reuse_challenge(
            ChallengeRequest::builder()
                .resource_id("/article/a1")
                .amount_required_minor_units(50)
                .credits_offered(10)
                .existing_challenge_id(first.challenge_id.clone())
                .build(),
        )
        .expect("reissue");
    assert_ne!(fresh.challenge_id, first.challenge_id);
}

#[test]
fn consume_and_record_spend_updates_both_ledgers() {
    let gate = gate();
    gate.store
        .insert_session(x402_ledger::types::SessionToken {
            token_id: "sess_s".to_string(),
            credits: 10,
            currency: "USD".to_string(),
            created_at: gate.clock.now(),
            expires_at: gate.clock.now() + TimeDelta::days(30),
            access_count: 0,
        })
        .expect("seed session");

    let outcome = gate
        .consume_and_record_spend(
            SpendRequest::builder()
                .session_token_id("sess_s")
                .credits(1)
                .subject_key("user:u1")
                .amount_minor_units(25)
                .build(),
        )
        .expect("spend");
    assert_eq!(outcome.session.credits, 9);
    assert_eq!(outcome.daily_spend_minor_units, 25);
    assert_eq!(gate.usage().daily_spend("user:u1").expect("usage"), 25);
}
