use std::fmt::Display;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use x402_ledger::{
    errors::Error,
    types::{PaymentChallenge, SpendPolicy},
};

/// A ledger failure translated for the wire.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub body: ErrorBody,
}

/// JSON body of an error response. Denied checks and short balances carry
/// enough detail for the client to react without another round trip.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Present on 402 responses: settle this to obtain (or refill) a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<PaymentChallenge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<SpendPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_spend_minor_units: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<u64>,
}

impl ErrorBody {
    fn new(error: impl Display) -> Self {
        ErrorBody {
            error: error.to_string(),
            reason: None,
            challenge: None,
            policy: None,
            daily_spend_minor_units: None,
            required: None,
            available: None,
        }
    }
}

impl ErrorResponse {
    /// 402 with a settleable challenge in the body.
    pub fn payment_required(challenge: PaymentChallenge) -> Self {
        ErrorResponse {
            status: StatusCode::PAYMENT_REQUIRED,
            body: ErrorBody {
                challenge: Some(challenge),
                ..ErrorBody::new("payment required")
            },
        }
    }

    /// The policy allowed the spend but demands a confirmation step the
    /// request did not carry.
    pub fn confirmation_required(amount_minor_units: u64) -> Self {
        ErrorResponse {
            status: StatusCode::FORBIDDEN,
            body: ErrorBody {
                reason: Some("confirmation_required".to_string()),
                required: Some(amount_minor_units),
                ..ErrorBody::new("confirmation required before spending")
            },
        }
    }

    pub fn server_error(reason: impl Display) -> Self {
        ErrorResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody::new(reason),
        }
    }
}

impl From<Error> for ErrorResponse {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidPayment(_) | Error::InsufficientCredits { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            Error::PolicyDenied { .. } => StatusCode::FORBIDDEN,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = ErrorBody::new(&err);
        match err {
            Error::PolicyDenied {
                reason,
                policy,
                daily_spend_minor_units,
                amount_minor_units,
                ..
            } => {
                body.reason = Some(reason.as_str().to_string());
                body.policy = Some(policy);
                body.daily_spend_minor_units = Some(daily_spend_minor_units);
                body.required = Some(amount_minor_units);
            }
            Error::InsufficientCredits {
                required,
                available,
            } => {
                body.required = Some(required);
                body.available = Some(available);
            }
            _ => {}
        }

        ErrorResponse { status, body }
    }
}

impl From<ErrorResponse> for Response<Full<Bytes>> {
    fn from(value: ErrorResponse) -> Self {
        let body = match serde_json::to_vec(&value.body) {
            Ok(body) => body,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to serialize error response body to JSON bytes: {err}");
                #[cfg(not(feature = "tracing"))]
                let _ = err;

                let mut response = Response::new(Full::new(Bytes::from_static(
                    b"Failed to serialize error response body to JSON bytes",
                )));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return response;
            }
        };

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = value.status;
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        response
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (self.status, axum::extract::Json(self.body)).into_response()
    }
}
