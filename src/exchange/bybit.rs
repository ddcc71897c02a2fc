// =============================================================================
// Bybit V5 REST Client — HMAC-SHA256 signed requests over the linear category
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. Every signed
// request carries `X-BAPI-API-KEY`, `X-BAPI-TIMESTAMP`, `X-BAPI-SIGN`,
// `X-BAPI-RECV-WINDOW`, and `X-BAPI-SIGN-TYPE: 2`. The signature is an
// HMAC-SHA256 over `timestamp || api_key || recv_window || payload`, where
// `payload` is the url-encoded sorted query string for GET and minified JSON
// with preserved key order for POST.
//
// Retry policy: exponential backoff, base 0.5 s, factor 2, cap 10 s, max 3
// attempts. Retries apply to network errors and transient response codes;
// invalid-parameter codes are never retried.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::errors::TradingError;
use crate::instrument::Instrument;
use crate::market_data::Candle;
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_FACTOR: u32 = 2;
const RETRY_CAP: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

/// HTTP status codes treated as transient and eligible for retry.
fn is_transient_status(status: u16) -> bool {
    status == 429 || status == 408 || (500..600).contains(&status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub link_id: String,
    pub reduce_only: bool,
    pub time_in_force: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub link_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Option<Side>,
    pub qty: Decimal,
    pub avg_price: Decimal,
}

#[derive(Clone)]
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BybitClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-BAPI-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet {
            "https://api-testnet.bybit.com".to_string()
        } else {
            "https://api.bybit.com".to_string()
        };

        debug!(base_url = %base_url, "BybitClient initialised");

        Self { api_key, secret, base_url, client }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{}{RECV_WINDOW_MS}{payload}", self.api_key).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, payload: &str) -> HeaderMap {
        let ts = Self::timestamp_ms();
        let sig = self.sign(ts, payload);

        let mut headers = HeaderMap::new();
        headers.insert("X-BAPI-TIMESTAMP", HeaderValue::from_str(&ts.to_string()).unwrap());
        headers.insert("X-BAPI-SIGN", HeaderValue::from_str(&sig).unwrap());
        headers.insert("X-BAPI-RECV-WINDOW", HeaderValue::from_str(&RECV_WINDOW_MS.to_string()).unwrap());
        headers.insert("X-BAPI-SIGN-TYPE", HeaderValue::from_static("2"));
        headers
    }

    /// Sorted, url-encoded query string for GET signing.
    fn sorted_query(params: &[(&str, String)]) -> String {
        let mut sorted: Vec<&(&str, String)> = params.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn send_with_retry<F, Fut>(&self, op_name: &str, mut attempt_fn: F) -> Result<serde_json::Value, TradingError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut delay = RETRY_BASE;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match attempt_fn().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body: serde_json::Value = match resp.json().await {
                        Ok(v) => v,
                        Err(e) => {
                            last_err = Some(TradingError::Transient(format!("{op_name}: failed to parse response: {e}")));
                            if attempt < MAX_ATTEMPTS {
                                tokio::time::sleep(delay).await;
                                delay = (delay * RETRY_FACTOR).min(RETRY_CAP);
                                continue;
                            }
                            break;
                        }
                    };

                    if status.is_success() {
                        let ret_code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(0);
                        if ret_code == 0 {
                            return Ok(body);
                        }
                        // Bybit embeds errors in a 200 response via retCode.
                        let ret_msg = body.get("retMsg").and_then(|v| v.as_str()).unwrap_or("unknown");
                        warn!(op_name, ret_code, ret_msg, "bybit returned a non-zero retCode");
                        return Err(TradingError::Validation(format!("{op_name}: retCode={ret_code} retMsg={ret_msg}")));
                    }

                    if is_transient_status(status.as_u16()) && attempt < MAX_ATTEMPTS {
                        warn!(op_name, status = status.as_u16(), attempt, "transient error, retrying");
                        tokio::time::sleep(delay).await;
                        delay = (delay * RETRY_FACTOR).min(RETRY_CAP);
                        continue;
                    }

                    return Err(TradingError::Transient(format!("{op_name}: http {status}: {body}")));
                }
                Err(e) => {
                    last_err = Some(TradingError::Transient(format!("{op_name}: network error: {e}")));
                    if attempt < MAX_ATTEMPTS {
                        warn!(op_name, attempt, error = %e, "network error, retrying");
                        tokio::time::sleep(delay).await;
                        delay = (delay * RETRY_FACTOR).min(RETRY_CAP);
                        continue;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TradingError::Transient(format!("{op_name}: exhausted retries"))))
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "bybit::kline")]
    pub async fn kline(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>, TradingError> {
        let url = format!(
            "{}/v5/market/kline?category=linear&symbol={symbol}&interval={interval}&limit={limit}",
            self.base_url
        );
        let body = self
            .send_with_retry("kline", || self.client.get(&url).send())
            .await?;

        let rows = body["result"]["list"].as_array().cloned().unwrap_or_default();
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let Some(arr) = row.as_array() else { continue };
            if arr.len() < 7 {
                continue;
            }
            let open_time: i64 = arr[0].as_str().and_then(|s| s.parse().ok()).unwrap_or(0);
            let parse = |i: usize| -> f64 { arr[i].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0) };
            candles.push(Candle {
                open_time,
                close_time: open_time,
                open: parse(1),
                high: parse(2),
                low: parse(3),
                close: parse(4),
                volume: parse(5),
                quote_volume: parse(6),
                trades_count: 0,
                taker_buy_volume: 0.0,
                taker_buy_quote_volume: 0.0,
                is_closed: true,
            });
        }
        Ok(candles)
    }

    #[instrument(skip(self), name = "bybit::instruments")]
    pub async fn instruments(&self, category: &str) -> Result<Vec<Instrument>, TradingError> {
        let url = format!("{}/v5/market/instruments-info?category={category}", self.base_url);
        let body = self
            .send_with_retry("instruments", || self.client.get(&url).send())
            .await?;

        let rows = body["result"]["list"].as_array().cloned().unwrap_or_default();
        if rows.is_empty() {
            warn!("instruments-info returned an empty list — falling back to built-in defaults");
            return Ok(Instrument::builtin_defaults());
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let symbol = row["symbol"].as_str().unwrap_or_default().to_string();
            let tick_size = row["priceFilter"]["tickSize"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::new(1, 1));
            let qty_step = row["lotSizeFilter"]["qtyStep"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::new(1, 3));
            let min_qty = row["lotSizeFilter"]["minOrderQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(qty_step);
            out.push(Instrument { symbol, tick_size, qty_step, min_qty, min_notional: Decimal::new(5, 0) });
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    #[instrument(skip(self, req), name = "bybit::place_order")]
    pub async fn place_order(&self, req: &OrderRequest) -> Result<OrderResponse, TradingError> {
        let side = match req.side {
            Side::Long => "Buy",
            Side::Short => "Sell",
        };
        let order_type = match req.order_type {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        };

        let mut payload = serde_json::json!({
            "category": "linear",
            "symbol": req.symbol,
            "side": side,
            "orderType": order_type,
            "qty": req.qty.to_string(),
            "orderLinkId": req.link_id,
            "reduceOnly": req.reduce_only,
            "timeInForce": req.time_in_force,
        });
        if let Some(price) = req.price {
            payload["price"] = serde_json::Value::String(price.to_string());
        }
        let body_str = serde_json::to_string(&payload).expect("payload is always serialisable");

        let url = format!("{}/v5/order/create", self.base_url);
        let headers = self.signed_headers(&body_str);
        let body_str2 = body_str.clone();
        let body = self
            .send_with_retry("place_order", || {
                self.client
                    .post(&url)
                    .headers(headers.clone())
                    .header("Content-Type", "application/json")
                    .body(body_str2.clone())
                    .send()
            })
            .await?;

        let order_id = body["result"]["orderId"].as_str().unwrap_or_default().to_string();
        let link_id = body["result"]["orderLinkId"].as_str().unwrap_or(&req.link_id).to_string();
        Ok(OrderResponse { order_id, link_id })
    }

    #[instrument(skip(self), name = "bybit::cancel")]
    pub async fn cancel(&self, symbol: &str, order_id: Option<&str>) -> Result<(), TradingError> {
        let payload = match order_id {
            Some(id) => serde_json::json!({ "category": "linear", "symbol": symbol, "orderId": id }),
            None => serde_json::json!({ "category": "linear", "symbol": symbol }),
        };
        let body_str = serde_json::to_string(&payload).expect("payload is always serialisable");
        let endpoint = if order_id.is_some() { "/v5/order/cancel" } else { "/v5/order/cancel-all" };
        let url = format!("{}{endpoint}", self.base_url);
        let headers = self.signed_headers(&body_str);

        self.send_with_retry("cancel", || {
            self.client
                .post(&url)
                .headers(headers.clone())
                .header("Content-Type", "application/json")
                .body(body_str.clone())
                .send()
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "bybit::set_trading_stop")]
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        tpsl_mode: &str,
    ) -> Result<(), TradingError> {
        let mut payload = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "tpslMode": tpsl_mode,
        });
        payload["stopLoss"] = serde_json::Value::String(stop_loss.map(|d| d.to_string()).unwrap_or_else(|| "0".to_string()));
        payload["takeProfit"] = serde_json::Value::String(take_profit.map(|d| d.to_string()).unwrap_or_else(|| "0".to_string()));
        let body_str = serde_json::to_string(&payload).expect("payload is always serialisable");

        let url = format!("{}/v5/position/trading-stop", self.base_url);
        let headers = self.signed_headers(&body_str);
        self.send_with_retry("set_trading_stop", || {
            self.client
                .post(&url)
                .headers(headers.clone())
                .header("Content-Type", "application/json")
                .body(body_str.clone())
                .send()
        })
        .await?;
        Ok(())
    }

    pub async fn cancel_trading_stop(&self, symbol: &str) -> Result<(), TradingError> {
        self.set_trading_stop(symbol, None, None, "Full").await
    }

    #[instrument(skip(self), name = "bybit::positions")]
    pub async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, TradingError> {
        let params: Vec<(&str, String)> = match symbol {
            Some(s) => vec![("category", "linear".to_string()), ("symbol", s.to_string())],
            None => vec![("category", "linear".to_string()), ("settleCoin", "USDT".to_string())],
        };
        let qs = Self::sorted_query(&params);
        let url = format!("{}/v5/position/list?{qs}", self.base_url);
        let headers = self.signed_headers(&qs);

        let body = self
            .send_with_retry("positions", || self.client.get(&url).headers(headers.clone()).send())
            .await?;

        let rows = body["result"]["list"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let symbol = row["symbol"].as_str().unwrap_or_default().to_string();
            let qty: Decimal = row["size"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default();
            let side = match row["side"].as_str() {
                Some("Buy") => Some(Side::Long),
                Some("Sell") => Some(Side::Short),
                _ => None,
            };
            let avg_price: Decimal = row["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default();
            out.push(ExchangePosition { symbol, side, qty, avg_price });
        }
        Ok(out)
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_query_orders_by_key() {
        let params = vec![("symbol", "BTCUSDT".to_string()), ("category", "linear".to_string())];
        assert_eq!(BybitClient::sorted_query(&params), "category=linear&symbol=BTCUSDT");
    }

    #[test]
    fn sign_is_deterministic_for_same_inputs() {
        let client = BybitClient::new("key", "secret", true);
        let a = client.sign(1000, "payload");
        let b = client.sign(1000, "payload");
        assert_eq!(a, b);
    }

    #[test]
    fn sign_differs_with_payload() {
        let client = BybitClient::new("key", "secret", true);
        let a = client.sign(1000, "payload-a");
        let b = client.sign(1000, "payload-b");
        assert_ne!(a, b);
    }

    #[test]
    fn transient_status_classification() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(500));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(401));
    }
}
