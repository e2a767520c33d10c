use std::fmt::Display;

use crate::{policy::DenyReason, types::SpendPolicy};

/// Closed error taxonomy for the ledger.
///
/// Every workflow step fails fast with one of these variants; the edge layer
/// matches them exhaustively to translate into transport status codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A write lost to a terminal status or a uniqueness constraint.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Expired challenge, wrong/terminal status, reused proof, or verifier
    /// rejection.
    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: u64 },

    /// Carries the evaluated policy and current spend so the caller can
    /// decide whether to adjust the amount, wait for cap reset, or request a
    /// policy change.
    #[error("policy denied ({reason}) for {subject_key}")]
    PolicyDenied {
        reason: DenyReason,
        subject_key: String,
        policy: SpendPolicy,
        amount_minor_units: u64,
        daily_spend_minor_units: u64,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Storage or verifier infrastructure failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_payment(reason: impl Display) -> Self {
        Error::InvalidPayment(reason.to_string())
    }

    pub fn internal(reason: impl Display) -> Self {
        Error::Internal(reason.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
