//! Policy and rate-limit middleware
//!
//! Origin and ban rejections deliberately answer a delayed, generic 500
//! instead of a 403, so abusive clients learn nothing about the policy.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;
use serde_json::json;
use tracing::warn;

use crate::server::AppState;

/// Delay band for policy rejections, ms
const REJECT_DELAY_MS: std::ops::Range<u64> = 5_000..10_000;

/// Reject banned IPs and mismatched origins with a delayed generic 500
pub async fn policy_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = addr.ip().to_string();

    if state.banlist.contains(&ip).await {
        warn!("rejecting banned ip {}", ip);
        return delayed_rejection().await;
    }

    if let Some(origin) = &state.origin {
        if let Some(value) = request.headers().get(header::ORIGIN) {
            let value = value.to_str().unwrap_or_default();
            if !origin.is_match(value) {
                warn!("rejecting origin {:?} from {}", value, ip);
                return delayed_rejection().await;
            }
        }
    }

    next.run(request).await
}

/// Answer 429 when the client's bucket is dry
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.limiter {
        if !limiter.check(addr.ip()).await {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "too many requests" })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn delayed_rejection() -> Response {
    let delay = {
        let mut rng = rand::thread_rng();
        rng.gen_range(REJECT_DELAY_MS)
    };
    tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
        .into_response()
}
