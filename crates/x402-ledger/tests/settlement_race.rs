//! Concurrent duplicate settlements must mint exactly once: the receipt
//! store's uniqueness gate picks one winner and every other caller either
//! returns the winner's result or a retryable conflict.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use x402_ledger::{
    clock::ManualClock,
    errors::Error,
    gate::{ChallengeRequest, Gate, GateConfig},
    id::UuidIds,
    settlement::SettleRequest,
    store::memory::MemoryStore,
    verifier::{DevVerifier, SettlementProof},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_settlements_mint_once() {
    let gate = Arc::new(
        Gate::builder()
            .store(MemoryStore::new())
            .verifier(DevVerifier::new())
            .clock(ManualClock::at(
                Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap(),
            ))
            .ids(UuidIds)
            .config(GateConfig::builder().payee_address("0xpayee").build())
            .build(),
    );

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

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gate = Arc::clone(&gate);
        let challenge_id = challenge_id.clone();
        handles.push(tokio::spawn(async move {
            gate.verify_and_issue_session(
                SettleRequest::builder()
                    .challenge_id(challenge_id)
                    .proof(SettlementProof::builder().transaction_ref("tx1").build())
                    .build(),
            )
            .await
        }));
    }

    let mut receipt_ids = Vec::new();
    let mut session_ids = Vec::new();
    for handle in handles {
        match handle.await.expect("task") {
            Ok(settlement) => {
                receipt_ids.push(settlement.receipt.receipt_id);
                session_ids.push(settlement.session.token_id);
            }
            // A loser may observe the winner mid-write; that conflict is
            // retryable, and a retry must then succeed.
            Err(Error::Conflict(_)) => {}
            Err(other) => panic!("unexpected settlement error: {other}"),
        }
    }

    assert!(!receipt_ids.is_empty());
    receipt_ids.sort();
    receipt_ids.dedup();
    session_ids.sort();
    session_ids.dedup();
    assert_eq!(receipt_ids.len(), 1, "exactly one receipt minted");
    assert_eq!(session_ids.len(), 1, "exactly one session lineage");

    // The balance reflects one mint, no matter how many callers raced.
    let session = gate.sessions().get(&session_ids[0]).expect("session");
    assert_eq!(session.credits, 10);

    // A calm retry after the dust settles returns the same receipt.
    let retried = gate
        .verify_and_issue_session(
            SettleRequest::builder()
                .challenge_id(challenge_id)
                .proof(SettlementProof::builder().transaction_ref("tx1").build())
                .build(),
        )
        .await
        .expect("retry");
    assert_eq!(retried.receipt.receipt_id, receipt_ids[0]);
}
