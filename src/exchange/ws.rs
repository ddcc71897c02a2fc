// =============================================================================
// Private WebSocket client — order/position/execution events
// =============================================================================
//
// Connects to Bybit's private linear channel, sends an auth frame, subscribes
// to order/position/execution topics, and forwards parsed events to the
// caller via an mpsc channel. On disconnect the caller reconnects (§5): a
// fresh connection resets the authenticated flag, re-subscribes, and replays
// no data — local state relies on the reconciliation task to resync.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::types::{OrderStatus, Side};

type HmacSha256 = Hmac<Sha256>;

const PRIVATE_WS_URL: &str = "wss://stream.bybit.com/v5/private";
const AUTH_EXPIRES_MS: u64 = 10_000;

/// A fill or position update received over the private channel.
#[derive(Debug, Clone)]
pub enum PrivateEvent {
    Order { symbol: String, link_id: String, order_id: String, status: OrderStatus },
    Execution { symbol: String, side: Side, qty: f64, price: f64, link_id: String },
    Position { symbol: String, side: Option<Side>, qty: f64, avg_price: f64 },
}

pub struct PrivateWsClient {
    api_key: String,
    secret: String,
}

impl PrivateWsClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), secret: secret.into() }
    }

    fn auth_signature(&self, expires: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(format!("GET/realtime{expires}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Run one connection lifetime: connect, auth, subscribe, forward events
    /// until the stream ends or errors. Returns so the caller can reconnect.
    pub async fn run(&self, tx: mpsc::Sender<PrivateEvent>) -> Result<()> {
        info!(url = PRIVATE_WS_URL, "connecting to private WebSocket");
        let (ws_stream, _response) = connect_async(PRIVATE_WS_URL)
            .await
            .context("failed to connect to private WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let expires = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_millis() as u64 + AUTH_EXPIRES_MS;
        let sig = self.auth_signature(expires);
        let auth_frame = serde_json::json!({ "op": "auth", "args": [self.api_key, expires, sig] });
        write.send(Message::Text(auth_frame.to_string())).await.context("failed to send auth frame")?;

        let mut authenticated = false;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let root: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "failed to parse private WS frame");
                            continue;
                        }
                    };

                    if root.get("op").and_then(|v| v.as_str()) == Some("auth") {
                        let success = root.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
                        if success {
                            authenticated = true;
                            info!("private WebSocket authenticated");
                            let subscribe = serde_json::json!({
                                "op": "subscribe",
                                "args": ["order", "position", "execution"],
                            });
                            write
                                .send(Message::Text(subscribe.to_string()))
                                .await
                                .context("failed to send subscribe frame")?;
                        } else {
                            error!("private WebSocket auth rejected");
                            return Err(anyhow::anyhow!("private WS auth rejected"));
                        }
                        continue;
                    }

                    if !authenticated {
                        continue;
                    }

                    for event in parse_private_message(&root) {
                        if tx.send(event).await.is_err() {
                            warn!("private WS event channel closed, stopping");
                            return Ok(());
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "private WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!("private WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

fn parse_private_message(root: &serde_json::Value) -> Vec<PrivateEvent> {
    let topic = root.get("topic").and_then(|v| v.as_str()).unwrap_or("");
    let Some(rows) = root.get("data").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    match topic {
        "order" => {
            for row in rows {
                let symbol = row["symbol"].as_str().unwrap_or_default().to_string();
                let link_id = row["orderLinkId"].as_str().unwrap_or_default().to_string();
                let order_id = row["orderId"].as_str().unwrap_or_default().to_string();
                let status = match row["orderStatus"].as_str() {
                    Some("New") => OrderStatus::New,
                    Some("PartiallyFilled") => OrderStatus::PartiallyFilled,
                    Some("Filled") => OrderStatus::Filled,
                    Some("Cancelled") => OrderStatus::Cancelled,
                    _ => continue,
                };
                out.push(PrivateEvent::Order { symbol, link_id, order_id, status });
            }
        }
        "execution" => {
            for row in rows {
                let symbol = row["symbol"].as_str().unwrap_or_default().to_string();
                let link_id = row["orderLinkId"].as_str().unwrap_or_default().to_string();
                let side = match row["side"].as_str() {
                    Some("Buy") => Side::Long,
                    Some("Sell") => Side::Short,
                    _ => continue,
                };
                let qty: f64 = row["execQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let price: f64 = row["execPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                out.push(PrivateEvent::Execution { symbol, side, qty, price, link_id });
            }
        }
        "position" => {
            for row in rows {
                let symbol = row["symbol"].as_str().unwrap_or_default().to_string();
                let side = match row["side"].as_str() {
                    Some("Buy") => Some(Side::Long),
                    Some("Sell") => Some(Side::Short),
                    _ => None,
                };
                let qty: f64 = row["size"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let avg_price: f64 = row["entryPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                out.push(PrivateEvent::Position { symbol, side, qty, avg_price });
            }
        }
        _ => {}
    }
    out
}
