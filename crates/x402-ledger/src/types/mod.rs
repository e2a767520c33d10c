//! Persisted record shapes of the ledger.

mod agent;
mod challenge;
mod policy;
mod receipt;
mod session;
mod usage;

pub use agent::Agent;
pub use challenge::{ChallengeStatus, PaymentChallenge};
pub use policy::SpendPolicy;
pub use receipt::{Receipt, ReceiptStatus};
pub use session::SessionToken;
pub use usage::UsageRecord;
