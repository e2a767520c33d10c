//! HTTP edge collaborator for the x402-ledger.
//!
//! Maps the ledger's tagged errors to transport status codes and gates
//! protected requests: no valid session means a 402 response carrying a
//! payment challenge; a valid session goes through policy, consume, and
//! usage recording before the wrapped handler runs.

pub mod errors;
pub mod paywall;

pub use errors::ErrorResponse;
pub use paywall::{AccessState, Paywall};
