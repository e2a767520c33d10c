//! Payment & policy ledger for X402 pay-per-access servers.
//!
//! The crate models the server side of a 402-based payment flow: a resource
//! server issues a signed-amount [`PaymentChallenge`](types::PaymentChallenge),
//! a client settles it, the [`SettlementWorkflow`](settlement::SettlementWorkflow)
//! verifies the settlement exactly once and mints spendable credits into a
//! [`SessionToken`](types::SessionToken), and further spend is gated by the
//! [`policy`] engine under per-subject daily caps.
//!
//! Storage, time, id generation, and on-chain verification are ports
//! ([`store`], [`clock`], [`id`], [`verifier`]); production wiring selects
//! concrete adapters while tests inject in-memory fakes.

pub mod agents;
pub mod challenge;
pub mod clock;
pub mod errors;
pub mod gate;
pub mod id;
pub mod pattern;
pub mod policy;
pub mod session;
pub mod settlement;
pub mod store;
pub mod subject;
pub mod types;
pub mod usage;
pub mod verifier;
