//! Admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, instrument, warn, Instrument};

use crate::ratelimit::{Decision, IdentityResolver, RateDecisionEngine};

/// Request header carrying the caller's token. Matched case-insensitively.
pub const API_KEY_HEADER: &str = "API_KEY";

/// Body of every rejection, whichever quota caused it.
pub const REJECTION_BODY: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Address used when the connection's peer address is not available.
const UNKNOWN_ADDRESS: &str = "unknown";

/// Shared state for the admission middleware.
#[derive(Clone, Debug)]
pub struct AdmissionState {
    resolver: Arc<IdentityResolver>,
    engine: Arc<RateDecisionEngine>,
}

impl AdmissionState {
    /// Create admission state from a resolver and an engine.
    pub fn new(resolver: IdentityResolver, engine: RateDecisionEngine) -> Self {
        Self {
            resolver: Arc::new(resolver),
            engine: Arc::new(engine),
        }
    }
}

/// Admit or reject a request before it reaches the downstream handler.
///
/// Store failures reject the request exactly like an exceeded quota.
/// Evaluation runs on its own task so that a client hanging up mid-request
/// cannot leave a window counter without its expiry.
#[instrument(skip_all, fields(key = tracing::field::Empty, namespace = tracing::field::Empty))]
pub async fn admission(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let (key, quota) = {
        let token = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        let address = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string());

        state
            .resolver
            .resolve(token, address.as_deref().unwrap_or(UNKNOWN_ADDRESS))
    };
    let span = tracing::Span::current();
    span.record("key", key.as_str());
    span.record("namespace", key.namespace().prefix());

    let engine = state.engine.clone();
    let evaluation = tokio::spawn(
        async move {
            engine
                .evaluate(key.as_str(), quota.limit, quota.block_duration)
                .await
        }
        .instrument(span),
    );

    match evaluation.await {
        Ok(Ok(Decision::Admit)) => next.run(request).await,
        Ok(Ok(Decision::Deny(reason))) => {
            debug!(reason = ?reason, "Request rejected");
            reject()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Counter store failure, rejecting request");
            reject()
        }
        Err(e) => {
            error!(error = %e, "Admission evaluation task failed, rejecting request");
            reject()
        }
    }
}

fn reject() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, REJECTION_BODY).into_response()
}
