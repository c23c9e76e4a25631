//! HTTP handlers: liveness and the historical range query

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use storage::{FetchPayload, FetchQuery, StorageFormat};
use tracing::debug;

use crate::error::QueryError;
use crate::server::AppState;
use crate::websocket;

/// Default point-format bucket width, ms
const DEFAULT_TIMEFRAME_MS: u64 = 60_000;

/// `GET /`: liveness probe, or a WebSocket subscription with no initial
/// markets when the client asks for an upgrade
pub async fn root(State(state): State<AppState>, ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(upgrade) => websocket::serve_upgrade(state, upgrade, String::new()),
        None => Json(json!({ "message": "hi" })).into_response(),
    }
}

/// `GET /historical/:from/:to`
pub async fn historical_range(
    State(state): State<AppState>,
    Path((from, to)): Path<(String, String)>,
) -> Result<Response, QueryError> {
    run_historical(state, &from, &to, None, None).await
}

/// `GET /historical/:from/:to/:timeframe`
pub async fn historical_timeframe(
    State(state): State<AppState>,
    Path((from, to, timeframe)): Path<(String, String, String)>,
) -> Result<Response, QueryError> {
    run_historical(state, &from, &to, Some(&timeframe), None).await
}

/// `GET /historical/:from/:to/:timeframe/:markets`
pub async fn historical_markets(
    State(state): State<AppState>,
    Path((from, to, timeframe, markets)): Path<(String, String, String, String)>,
) -> Result<Response, QueryError> {
    run_historical(state, &from, &to, Some(&timeframe), Some(&markets)).await
}

async fn run_historical(
    state: AppState,
    from_raw: &str,
    to_raw: &str,
    timeframe_raw: Option<&str>,
    markets_raw: Option<&str>,
) -> Result<Response, QueryError> {
    if !state.hub.config().api {
        return Err(QueryError::Disabled);
    }
    let storage = state
        .hub
        .primary_storage()
        .ok_or(QueryError::Disabled)?
        .clone();

    let mut from: u64 = from_raw.parse().map_err(|_| QueryError::MissingInterval)?;
    let mut to: u64 = to_raw.parse().map_err(|_| QueryError::MissingInterval)?;
    if from > to {
        std::mem::swap(&mut from, &mut to);
    }

    let timeframe = timeframe_raw
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_TIMEFRAME_MS)
        .max(1);
    let markets: Vec<String> = markets_raw
        .map(crate::broadcast::parse_pair_list)
        .unwrap_or_default();

    if storage.format() == StorageFormat::Point {
        from -= from % timeframe;
        to = to.div_ceil(timeframe) * timeframe;
        let length = (to - from) / timeframe;
        if length > state.hub.config().max_fetch_length {
            return Err(QueryError::TooManyBars(length));
        }
    }

    debug!(
        "historical fetch from={} to={} timeframe={} markets={}",
        from,
        to,
        timeframe,
        markets.len()
    );

    let payload = storage
        .fetch(FetchQuery {
            from,
            to,
            timeframe,
            markets,
        })
        .await
        .map_err(|e| QueryError::Storage(e.to_string()))?;

    // Trade-format responses get the unflushed tail merged in: everything
    // still buffered whose timestamp lies strictly inside (from, to).
    let payload = match payload {
        FetchPayload::Trades(mut trades) => {
            trades.extend(state.hub.chunk_tail(from, to).await);
            FetchPayload::Trades(trades)
        }
        points @ FetchPayload::Points(_) => points,
    };

    if payload.is_empty() {
        return Err(QueryError::NotFound);
    }

    Ok(Json(json!({
        "format": storage.format(),
        "results": payload,
    }))
    .into_response())
}
