//! HTTP front end.
//!
//! Every route except `/health` passes through the rate limit middleware.

mod middleware;
mod server;

pub use middleware::{rate_limit, RateLimitState, RATE_LIMITED_MESSAGE};
pub use server::HttpServer;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

/// Build the service router.
pub fn router(state: RateLimitState) -> Router {
    let limited = Router::new()
        .route("/", get(root))
        .layer(axum::middleware::from_fn_with_state(state, rate_limit));

    Router::new().route("/health", get(health)).merge(limited)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to Rate Limiter API",
        "status": "ok",
    }))
}
