use bon::Builder;
use http::{HeaderValue, Request, Response};
use x402_ledger::{
    clock::Clock,
    errors::Error,
    gate::{ChallengeRequest, Gate, SpendCheck, SpendRequest},
    id::IdGenerator,
    settlement::{SettleRequest, Settlement},
    store::{ChallengeStore, PolicyAgentStore, ReceiptSessionStore, UsageStore},
    subject::SubjectCredential,
    types::{PaymentChallenge, SessionToken},
    verifier::PaymentVerifier,
};

use crate::errors::ErrorResponse;

/// Session bearer credential for a paid caller.
pub const SESSION_HEADER: &str = "x-payment-session";
/// Agent bearer token; takes precedence over the user id.
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";
/// User id established by the embedding server's own authentication.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Set to any value to satisfy a needs-confirm policy decision.
pub const CONFIRM_HEADER: &str = "x-payment-confirm";
/// Remaining session credits, attached to successful responses.
pub const CREDITS_REMAINING_HEADER: &str = "x-credits-remaining";

/// One protected resource behind the ledger.
///
/// `price_per_access_minor_units` is what each access costs against spend
/// policies; `credits_per_access` is what it costs the session balance.
#[derive(Builder, Debug)]
pub struct Paywall<S, V, C, I> {
    pub gate: Gate<S, V, C, I>,
    #[builder(into)]
    pub resource_id: String,
    /// Price of a full credit bundle, written into challenges.
    pub amount_required_minor_units: u64,
    /// Credits minted when a challenge for this resource settles.
    pub credits_offered: u64,
    #[builder(default = 1)]
    pub credits_per_access: u64,
    pub price_per_access_minor_units: u64,
}

/// Attached to the request extensions before the wrapped handler runs.
#[derive(Debug, Clone)]
pub struct AccessState {
    pub session: SessionToken,
    pub subject_key: String,
    pub needs_confirm: bool,
    pub daily_spend_minor_units: u64,
}

impl<S, V, C, I> Paywall<S, V, C, I>
where
    S: ChallengeStore + ReceiptSessionStore + PolicyAgentStore + UsageStore,
    V: PaymentVerifier,
    C: Clock,
    I: IdGenerator,
{
    /// Gate one request: require a live session, run the policy check,
    /// consume credits, record the spend, then run the handler with an
    /// [`AccessState`] in the request extensions.
    pub async fn handle_request<Fun, Fut, Req, Res>(
        &self,
        mut request: Request<Req>,
        handler: Fun,
    ) -> Result<Response<Res>, ErrorResponse>
    where
        Fun: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Response<Res>>,
    {
        let Some(token_id) = header_str(&request, SESSION_HEADER).map(str::to_string) else {
            return Err(self.payment_required());
        };

        let session = match self.gate.sessions().get(&token_id) {
            Ok(session) => session,
            Err(Error::NotFound { .. }) => return Err(self.payment_required()),
            Err(other) => return Err(other.into()),
        };
        if session.expires_at <= self.gate.clock.now() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Session expired: token='{token_id}'");

            return Err(self.payment_required());
        }

        let credential = if let Some(token) = header_str(&request, AGENT_TOKEN_HEADER) {
            SubjectCredential::AgentToken(token.to_string())
        } else if let Some(user_id) = header_str(&request, USER_ID_HEADER) {
            SubjectCredential::User(user_id.to_string())
        } else {
            SubjectCredential::Anonymous
        };
        let path = request.uri().path().to_string();
        let origin = header_str(&request, "origin").map(str::to_string);
        let confirmed = request.headers().contains_key(CONFIRM_HEADER);

        let approval = self
            .gate
            .check_spend_policy(
                SpendCheck::builder()
                    .credential(credential)
                    .amount_minor_units(self.price_per_access_minor_units)
                    .path(path)
                    .maybe_origin(origin)
                    .build(),
            )
            .map_err(ErrorResponse::from)?;

        // Confirmation is checked before anything is consumed, so a refused
        // confirmation costs nothing.
        if approval.needs_confirm && !confirmed {
            return Err(ErrorResponse::confirmation_required(
                self.price_per_access_minor_units,
            ));
        }

        let outcome = match self.gate.consume_and_record_spend(
            SpendRequest::builder()
                .session_token_id(token_id)
                .credits(self.credits_per_access)
                .subject_key(approval.subject_key.clone())
                .amount_minor_units(self.price_per_access_minor_units)
                .build(),
        ) {
            Ok(outcome) => outcome,
            // A drained session gets a fresh challenge alongside the
            // required/available amounts, so the client can top up directly.
            Err(err @ Error::InsufficientCredits { .. }) => {
                let mut response = ErrorResponse::from(err);
                if let Ok(challenge) = self.issue_challenge() {
                    response.body.challenge = Some(challenge);
                }
                return Err(response);
            }
            Err(other) => return Err(other.into()),
        };

        request.extensions_mut().insert(AccessState {
            session: outcome.session.clone(),
            subject_key: approval.subject_key,
            needs_confirm: approval.needs_confirm,
            daily_spend_minor_units: outcome.daily_spend_minor_units,
        });

        let mut response = handler(request).await;
        if let Ok(value) = HeaderValue::from_str(&outcome.session.credits.to_string()) {
            response.headers_mut().insert(CREDITS_REMAINING_HEADER, value);
        }
        Ok(response)
    }

    /// Settle a challenge presented by a paying client; the edge route for
    /// payment confirmation.
    pub async fn settle(&self, request: SettleRequest) -> Result<Settlement, ErrorResponse> {
        self.gate
            .verify_and_issue_session(request)
            .await
            .map_err(ErrorResponse::from)
    }

    fn issue_challenge(&self) -> Result<PaymentChallenge, Error> {
        self.gate.issue_or_reuse_challenge(
            ChallengeRequest::builder()
                .resource_id(self.resource_id.clone())
                .amount_required_minor_units(self.amount_required_minor_units)
                .credits_offered(self.credits_offered)
                .build(),
        )
    }

    /// 402 with a fresh challenge for this resource.
    pub fn payment_required(&self) -> ErrorResponse {
        match self.issue_challenge() {
            Ok(challenge) => ErrorResponse::payment_required(challenge),
            Err(err) => ErrorResponse::server_error(err),
        }
    }
}

fn header_str<'r, Req>(request: &'r Request<Req>, name: &str) -> Option<&'r str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}
