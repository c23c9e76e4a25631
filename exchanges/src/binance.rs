//! Binance adapter: combined aggTrade + forceOrder streams
//!
//! One upstream socket carries every stream for its slice of pairs, so one
//! socket is one api id: a stalled socket is reconnected as a unit and the
//! server sees `Disconnected`/`Connected` for exactly the pairs it carried.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use common::{Side, Trade};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::{EventSender, ExchangeController, ExchangeEvent};

const EXCHANGE_ID: &str = "BINANCE";
const DEFAULT_WS_URL: &str = "wss://fstream.binance.com/stream";

/// Pairs carried per upstream socket; each pair subscribes two streams
const PAIRS_PER_SOCKET: usize = 100;

const RECONNECT_DELAY_MS: u64 = 1000;

/// Binance combined-stream message envelope
#[derive(Debug, Deserialize)]
struct StreamMessage {
    stream: String,
    data: serde_json::Value,
}

/// Binance aggregate trade payload
#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    timestamp: u64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

/// Binance liquidation order envelope
#[derive(Debug, Deserialize)]
struct ForceOrder {
    #[serde(rename = "o")]
    order: LiquidationOrder,
}

#[derive(Debug, Deserialize)]
struct LiquidationOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "ap")]
    avg_price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    timestamp: u64,
}

#[derive(Debug)]
enum ApiCommand {
    Restart,
    SetPairs(Vec<String>),
}

struct ApiHandle {
    pairs: Vec<String>,
    commands: mpsc::UnboundedSender<ApiCommand>,
}

/// Binance exchange adapter
pub struct BinanceAdapter {
    id: String,
    ws_url: String,
    events: EventSender,
    apis: RwLock<FxHashMap<String, ApiHandle>>,
    api_counter: AtomicU64,
}

impl BinanceAdapter {
    /// Create an adapter delivering events on `events`
    pub fn new(events: EventSender) -> Self {
        Self::with_url(DEFAULT_WS_URL, events)
    }

    /// Create an adapter against a non-default endpoint (testnets, tests)
    pub fn with_url(ws_url: impl Into<String>, events: EventSender) -> Self {
        Self {
            id: EXCHANGE_ID.to_string(),
            ws_url: ws_url.into(),
            events,
            apis: RwLock::new(FxHashMap::default()),
            api_counter: AtomicU64::new(0),
        }
    }

    async fn spawn_api(&self, pairs: Vec<String>) -> String {
        let n = self.api_counter.fetch_add(1, Ordering::SeqCst);
        let api_id = format!("{}-{}", self.id, n);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        self.apis.write().await.insert(
            api_id.clone(),
            ApiHandle {
                pairs: pairs.clone(),
                commands: command_tx,
            },
        );

        tokio::spawn(run_api(
            self.id.clone(),
            api_id.clone(),
            self.ws_url.clone(),
            pairs,
            self.events.clone(),
            command_rx,
        ));
        api_id
    }
}

#[async_trait]
impl ExchangeController for BinanceAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn api_ids(&self) -> Vec<String> {
        self.apis.read().await.keys().cloned().collect()
    }

    async fn connect_products(&self, pairs: Vec<String>) -> Result<()> {
        if self
            .events
            .send(ExchangeEvent::Index {
                exchange: self.id.clone(),
                pairs: pairs.clone(),
            })
            .await
            .is_err()
        {
            anyhow::bail!("event channel closed");
        }

        for chunk in pairs.chunks(PAIRS_PER_SOCKET) {
            let api_id = self.spawn_api(chunk.to_vec()).await;
            info!("{}: opened {} carrying {} pairs", self.id, api_id, chunk.len());
        }
        Ok(())
    }

    async fn link(&self, pair: &str) -> Result<()> {
        {
            let mut apis = self.apis.write().await;
            if apis
                .values()
                .any(|handle| handle.pairs.iter().any(|p| p == pair))
            {
                warn!("{}: {} already linked", self.id, pair);
                return Ok(());
            }

            // Prefer the least-loaded socket with room; open a new one otherwise.
            let target = apis
                .iter()
                .filter(|(_, handle)| handle.pairs.len() < PAIRS_PER_SOCKET)
                .min_by_key(|(_, handle)| handle.pairs.len())
                .map(|(api_id, _)| api_id.clone());

            if let Some(api_id) = target {
                if let Some(handle) = apis.get_mut(&api_id) {
                    handle.pairs.push(pair.to_string());
                    handle
                        .commands
                        .send(ApiCommand::SetPairs(handle.pairs.clone()))
                        .ok();
                    return Ok(());
                }
            }
        }

        self.spawn_api(vec![pair.to_string()]).await;
        Ok(())
    }

    async fn unlink(&self, pair: &str) -> Result<()> {
        let mut apis = self.apis.write().await;
        for (api_id, handle) in apis.iter_mut() {
            if let Some(index) = handle.pairs.iter().position(|p| p == pair) {
                handle.pairs.remove(index);
                handle
                    .commands
                    .send(ApiCommand::SetPairs(handle.pairs.clone()))
                    .ok();
                debug!("{}: unlinked {} from {}", self.id, pair, api_id);
                return Ok(());
            }
        }
        warn!("{}: unlink for unknown pair {}", self.id, pair);
        Ok(())
    }

    async fn reconnect_api(&self, api_id: &str) -> Result<()> {
        let apis = self.apis.read().await;
        match apis.get(api_id) {
            Some(handle) => {
                warn!("{}: reconnecting {}", self.id, api_id);
                handle.commands.send(ApiCommand::Restart).ok();
                Ok(())
            }
            None => anyhow::bail!("unknown api {}", api_id),
        }
    }
}

fn stream_url(ws_url: &str, pairs: &[String]) -> String {
    let streams: Vec<String> = pairs
        .iter()
        .flat_map(|pair| {
            let lower = pair.to_lowercase();
            [format!("{lower}@aggTrade"), format!("{lower}@forceOrder")]
        })
        .collect();
    format!("{}?streams={}", ws_url, streams.join("/"))
}

fn parse_message(exchange: &str, text: &str) -> Option<ExchangeEvent> {
    let message: StreamMessage = serde_json::from_str(text).ok()?;

    if message.stream.ends_with("@aggTrade") {
        let payload: AggTrade = serde_json::from_value(message.data).ok()?;
        let trade = Trade {
            exchange: exchange.to_string(),
            pair: payload.symbol,
            timestamp: payload.timestamp,
            price: payload.price.parse().ok()?,
            size: payload.quantity.parse().ok()?,
            side: if payload.is_buyer_maker {
                Side::Sell
            } else {
                Side::Buy
            },
            liquidation: false,
        };
        return Some(ExchangeEvent::Trades {
            exchange: exchange.to_string(),
            trades: vec![trade],
        });
    }

    if message.stream.ends_with("@forceOrder") {
        let payload: ForceOrder = serde_json::from_value(message.data).ok()?;
        let order = payload.order;
        let trade = Trade {
            exchange: exchange.to_string(),
            pair: order.symbol,
            timestamp: order.timestamp,
            price: order.avg_price.parse().ok()?,
            size: order.quantity.parse().ok()?,
            side: if order.side == "SELL" {
                Side::Sell
            } else {
                Side::Buy
            },
            liquidation: true,
        };
        return Some(ExchangeEvent::Liquidations {
            exchange: exchange.to_string(),
            trades: vec![trade],
        });
    }

    None
}

async fn emit_pair_lifecycle(
    events: &EventSender,
    exchange: &str,
    api_id: &str,
    pairs: &[String],
    connected: bool,
) -> bool {
    for pair in pairs {
        let event = if connected {
            ExchangeEvent::Connected {
                exchange: exchange.to_string(),
                pair: pair.clone(),
                api_id: api_id.to_string(),
            }
        } else {
            ExchangeEvent::Disconnected {
                exchange: exchange.to_string(),
                pair: pair.clone(),
                api_id: api_id.to_string(),
            }
        };
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

async fn run_api(
    exchange: String,
    api_id: String,
    ws_url: String,
    mut pairs: Vec<String>,
    events: EventSender,
    mut commands: mpsc::UnboundedReceiver<ApiCommand>,
) {
    loop {
        if pairs.is_empty() {
            // Nothing to carry; wait for a resubscription or teardown.
            match commands.recv().await {
                Some(ApiCommand::SetPairs(next)) => {
                    pairs = next;
                    continue;
                }
                Some(ApiCommand::Restart) => continue,
                None => return,
            }
        }

        let url = stream_url(&ws_url, &pairs);
        let socket = match connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                error!("{}: {} connect failed: {}", exchange, api_id, e);
                let _ = events
                    .send(ExchangeEvent::Error {
                        exchange: exchange.clone(),
                        message: e.to_string(),
                    })
                    .await;
                tokio::time::sleep(tokio::time::Duration::from_millis(RECONNECT_DELAY_MS)).await;
                continue;
            }
        };

        info!("{}: {} connected with {} pairs", exchange, api_id, pairs.len());
        if events
            .send(ExchangeEvent::Open {
                exchange: exchange.clone(),
            })
            .await
            .is_err()
        {
            return;
        }
        if !emit_pair_lifecycle(&events, &exchange, &api_id, &pairs, true).await {
            return;
        }

        let (mut sink, mut stream) = socket.split();
        let mut next_pairs: Option<Vec<String>> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ApiCommand::Restart) => break,
                    Some(ApiCommand::SetPairs(updated)) => {
                        next_pairs = Some(updated);
                        break;
                    }
                    None => {
                        emit_pair_lifecycle(&events, &exchange, &api_id, &pairs, false).await;
                        return;
                    }
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_message(&exchange, &text) {
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        error!("{}: {} stream error: {}", exchange, api_id, e);
                        let _ = events
                            .send(ExchangeEvent::Error {
                                exchange: exchange.clone(),
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        if !emit_pair_lifecycle(&events, &exchange, &api_id, &pairs, false).await {
            return;
        }
        if events
            .send(ExchangeEvent::Close {
                exchange: exchange.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        if let Some(next) = next_pairs.take() {
            pairs = next;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(RECONNECT_DELAY_MS)).await;
    }
}
