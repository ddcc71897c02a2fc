// =============================================================================
// Order Book Manager — Real-time orderbook aggregation (Bybit V5 linear)
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

const PUBLIC_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Manages orderbook state for multiple symbols.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBookSnapshot>>,
}

/// A point-in-time orderbook snapshot for a single symbol, matching §4.A's
/// `orderbook() -> {bids, asks, spread_pct, depth_imbalance}` contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    /// `(ask - bid) / mid`.
    pub spread_pct: f64,
    /// `(bid_vol - ask_vol) / (bid_vol + ask_vol) ∈ [-1, 1]`.
    pub depth_imbalance: f64,
    pub last_update_id: u64,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(
        &self,
        symbol: &str,
        best_bid: f64,
        best_ask: f64,
        bid_depth: f64,
        ask_depth: f64,
        update_id: u64,
    ) {
        let mid = (best_bid + best_ask) / 2.0;
        let spread_pct = if mid > 0.0 {
            (best_ask - best_bid) / mid
        } else {
            0.0
        };

        let total_depth = bid_depth + ask_depth;
        let depth_imbalance = if total_depth > 0.0 {
            (bid_depth - ask_depth) / total_depth
        } else {
            0.0
        };

        let snapshot = OrderBookSnapshot {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            bid_depth,
            ask_depth,
            spread_pct,
            depth_imbalance,
            last_update_id: update_id,
        };

        self.books.write().insert(symbol.to_string(), snapshot);
    }

    pub fn get(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.books.read().get(symbol).cloned()
    }

    pub fn spread_pct(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|s| s.spread_pct)
    }

    pub fn imbalance(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|s| s.depth_imbalance)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Public orderbook WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to Bybit's public linear orderbook channel for a single symbol and
/// feed snapshots into `manager`. Runs until the stream disconnects or errors,
/// then returns so the caller can reconnect (§5 — WS reconnects on drop).
pub async fn run_orderbook_stream(
    symbol: &str,
    depth: u32,
    manager: &Arc<OrderBookManager>,
) -> Result<()> {
    info!(url = PUBLIC_WS_URL, symbol = %symbol, "connecting to orderbook WebSocket");

    let (ws_stream, _response) = connect_async(PUBLIC_WS_URL)
        .await
        .context("failed to connect to orderbook WebSocket")?;

    info!(symbol = %symbol, "orderbook WebSocket connected");
    let (mut write, mut read) = ws_stream.split();

    let topic = format!("orderbook.{depth}.{symbol}");
    let subscribe = serde_json::json!({ "op": "subscribe", "args": [topic] });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            subscribe.to_string(),
        ))
        .await
        .context("failed to send orderbook subscribe frame")?;

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_orderbook_message(&text) {
                    Ok(Some((best_bid, best_ask, bid_depth, ask_depth, update_id))) => {
                        manager.update(symbol, best_bid, best_ask, bid_depth, ask_depth, update_id);
                    }
                    Ok(None) => {} // non-data frame (subscribe ack, ping, etc.)
                    Err(e) => warn!(error = %e, "failed to parse orderbook message"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "orderbook WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "orderbook WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

use futures_util::SinkExt;

/// Parse a Bybit `orderbook.{depth}.{symbol}` snapshot/delta frame.
///
/// ```json
/// {"topic":"orderbook.50.BTCUSDT","type":"snapshot",
///  "data":{"s":"BTCUSDT","b":[["50000","1.2"], ...],"a":[["50001","0.8"], ...],"u":123}}
/// ```
fn parse_orderbook_message(text: &str) -> Result<Option<(f64, f64, f64, f64, u64)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse orderbook JSON")?;

    let Some(data) = root.get("data") else {
        return Ok(None);
    };

    let update_id = data["u"].as_u64().unwrap_or(0);

    let bids = data["b"].as_array().context("missing field b")?;
    let asks = data["a"].as_array().context("missing field a")?;

    let level_price = |level: &serde_json::Value| -> Option<f64> {
        level.get(0).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
    };
    let level_qty = |level: &serde_json::Value| -> Option<f64> {
        level.get(1).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
    };

    let best_bid = bids.first().and_then(level_price).unwrap_or(0.0);
    let best_ask = asks.first().and_then(level_price).unwrap_or(0.0);
    let bid_depth: f64 = bids.iter().filter_map(level_qty).sum();
    let ask_depth: f64 = asks.iter().filter_map(level_qty).sum();

    Ok(Some((best_bid, best_ask, bid_depth, ask_depth, update_id)))
}
