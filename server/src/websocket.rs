//! WebSocket transport for broadcast clients
//!
//! The URL path tail is the initial `+`-delimited market list; inbound
//! text messages replace the subscription wholesale. Outbound frames are
//! produced by the dispatcher and forwarded verbatim.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broadcast::{close_code_label, parse_pair_list};
use crate::models::welcome_envelope;
use crate::server::AppState;

/// `GET /:pairs`: WebSocket subscription for a `+`-delimited market list
pub async fn ws_with_pairs(
    State(state): State<AppState>,
    Path(pairs): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(upgrade) => serve_upgrade(state, upgrade, pairs),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Upgrade a connection into a broadcast session
pub fn serve_upgrade(state: AppState, upgrade: WebSocketUpgrade, pairs_raw: String) -> Response {
    let pairs = parse_pair_list(&pairs_raw);
    upgrade.on_upgrade(move |socket| handle_socket(state, socket, pairs))
}

async fn handle_socket(state: AppState, socket: WebSocket, pairs: Vec<String>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let dispatcher = state.hub.dispatcher().clone();
    let session_id = dispatcher.register(pairs, outbound_tx).await;
    debug!("session {} connected", session_id);

    let (mut sink, mut stream) = socket.split();

    let welcome = welcome_envelope(
        &state.hub.markets().await,
        &state.hub.exchanges().await,
        &state.hub.products().await,
    );
    if sink.send(Message::Text(welcome.to_string())).await.is_err() {
        dispatcher.unregister(session_id).await;
        return;
    }

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // The dispatcher dropped the session (shutdown).
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    dispatcher
                        .resubscribe(session_id, parse_pair_list(&text))
                        .await;
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        if let Some(label) = close_code_label(frame.code) {
                            warn!(
                                "session {} closed: {} ({})",
                                session_id, label, frame.code
                            );
                        }
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("session {} socket error: {}", session_id, e);
                    break;
                }
                None => break,
            }
        }
    }

    dispatcher.unregister(session_id).await;
    debug!("session {} ended", session_id);
}
