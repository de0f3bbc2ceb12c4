//! Rate limit middleware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, trace};

use crate::config::TurnstileConfig;
use crate::deadline::Deadline;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Identity, PolicyRules, RateLimiter};

/// Body returned with `429 Too Many Requests`.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Everything the middleware needs to make a decision.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    rules: Arc<PolicyRules>,
    token_header: HeaderName,
    decision_timeout: Duration,
}

impl RateLimitState {
    pub fn new(
        limiter: Arc<RateLimiter>,
        rules: PolicyRules,
        token_header: &str,
        decision_timeout: Duration,
    ) -> Result<Self> {
        let token_header = HeaderName::from_bytes(token_header.as_bytes()).map_err(|e| {
            TurnstileError::Config(format!("invalid token header '{}': {}", token_header, e))
        })?;

        Ok(Self {
            limiter,
            rules: Arc::new(rules),
            token_header,
            decision_timeout,
        })
    }

    /// Build the state from service configuration.
    pub fn from_config(limiter: Arc<RateLimiter>, config: &TurnstileConfig) -> Result<Self> {
        Self::new(
            limiter,
            PolicyRules::from_config(&config.rate_limiting),
            &config.rate_limiting.token_header,
            config.server.decision_timeout(),
        )
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Work out who `request` should be counted against.
    fn identify(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Identity {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        Identity::resolve(
            headers
                .get(&self.token_header)
                .and_then(|v| v.to_str().ok()),
            header(FORWARDED_FOR),
            header(REAL_IP),
            peer,
        )
    }
}

/// Admit the request, answer `429` if the identity is over its limit, or
/// `500` if the decision could not be made.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = state.identify(request.headers(), peer);
    let policy = state.rules.resolve(&identity);
    let key = identity.key();
    let deadline = Deadline::after(state.decision_timeout);

    match state.limiter.allow_request(&key, policy, deadline).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            trace!(key = %key, "Rejecting rate limited request");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": RATE_LIMITED_MESSAGE })),
            )
                .into_response()
        }
        Err(e) => {
            error!(
                key = %key,
                error = %e,
                timeout = e.is_timeout(),
                "Rate limit decision failed"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}
