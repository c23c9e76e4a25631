//! HTTP/WebSocket server assembly

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use regex::Regex;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::banlist::BanList;
use crate::handlers;
use crate::hub::Hub;
use crate::middleware::{policy_middleware, rate_limit_middleware};
use crate::rate_limiter::IpRateLimiter;
use crate::websocket;

/// Shared state handed to handlers and middleware
#[derive(Clone)]
pub struct AppState {
    /// The ingestion hub
    pub hub: Arc<Hub>,
    /// Banned client IPs
    pub banlist: Arc<BanList>,
    /// Per-IP limiter, when rate limiting is enabled
    pub limiter: Option<Arc<IpRateLimiter>>,
    /// Compiled origin allow pattern, when configured
    pub origin: Option<Arc<Regex>>,
}

impl AppState {
    /// Assemble state from the hub's configuration
    pub fn new(hub: Arc<Hub>, banlist: Arc<BanList>) -> Result<Self> {
        let config = hub.config();

        let limiter = if config.enable_rate_limit {
            Some(Arc::new(IpRateLimiter::new(
                config.rate_limit_max,
                config.rate_limit_time_window,
            )))
        } else {
            None
        };

        let origin = match &config.origin {
            Some(pattern) => Some(Arc::new(Regex::new(pattern)?)),
            None => None,
        };

        Ok(Self {
            hub,
            banlist,
            limiter,
            origin,
        })
    }
}

/// Build the router with every route and middleware layer
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/historical/:from/:to", get(handlers::historical_range))
        .route(
            "/historical/:from/:to/:timeframe",
            get(handlers::historical_timeframe),
        )
        .route(
            "/historical/:from/:to/:timeframe/:markets",
            get(handlers::historical_markets),
        )
        .route("/:pairs", get(websocket::ws_with_pairs))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(state, policy_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any))
}

/// Bind and serve until the shutdown signal flips
pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = state.hub.config().server_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
    })
    .await?;
    Ok(())
}
