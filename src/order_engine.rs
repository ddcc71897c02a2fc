// =============================================================================
// Order Engine — creates, cancels, and tracks orders against the exchange
// =============================================================================
//
// Computes a deterministic link_id for every intent and short-circuits on a
// duplicate before touching the network. Successful placements and fills
// feed straight into the Position-State Manager; nothing here fabricates a
// fill outside of what the exchange or the private WS stream reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::json;
use tracing::{info, warn};

use crate::errors::TradingError;
use crate::exchange::bybit::{BybitClient, OrderRequest, OrderType};
use crate::kill_switch::KillSwitch;
use crate::order_idempotency::generate_link_id;
use crate::persistence::{TradeLog, TradeLogEntry};
use crate::position_state::PositionStateManager;
use crate::risk::SizedOrder;
use crate::types::{OrderStatus, Side, TimeInForce, TpslMode};

pub struct OrderEngine {
    client: Arc<BybitClient>,
    positions: Arc<PositionStateManager>,
    kill_switch: Arc<KillSwitch>,
    trade_log: Arc<TradeLog>,
    /// link_ids already submitted this process lifetime, to short-circuit
    /// resubmission of the same logical intent within its time bucket.
    seen_link_ids: Mutex<HashSet<String>>,
}

impl OrderEngine {
    pub fn new(
        client: Arc<BybitClient>,
        positions: Arc<PositionStateManager>,
        kill_switch: Arc<KillSwitch>,
        trade_log: Arc<TradeLog>,
    ) -> Self {
        Self { client, positions, kill_switch, trade_log, seen_link_ids: Mutex::new(HashSet::new()) }
    }

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs()
    }

    /// Submit a sized order for `strategy` on `symbol`/`side` under `link_id`
    /// (computed by the caller so it can be threaded through the signal's
    /// full `signal_generated`/`meta_approved`/`order_submitted` audit
    /// trail). Returns the venue's order id, or short-circuits with the
    /// previously-seen link_id if this exact intent was already submitted in
    /// its time bucket.
    pub async fn create_order(
        &self,
        strategy: &str,
        symbol: &str,
        side: Side,
        sized: &SizedOrder,
        reduce_only: bool,
        link_id: String,
        order_type: crate::types::OrderType,
        time_in_force: TimeInForce,
    ) -> Result<String, TradingError> {
        if !self.kill_switch.can_trade() {
            let reason = self.kill_switch.reason().unwrap_or_else(|| "kill-switch active".to_string());
            return Err(TradingError::KillSwitchActive { reason });
        }

        {
            let mut seen = self.seen_link_ids.lock();
            if !seen.insert(link_id.clone()) {
                info!(link_id, "duplicate order intent short-circuited");
                return Ok(link_id);
            }
        }

        let qty = sized.qty.to_f64().unwrap_or(0.0);
        if qty <= 0.0 {
            return Err(TradingError::Validation("sized order has non-positive quantity".to_string()));
        }

        let venue_order_type = match order_type {
            crate::types::OrderType::Market => OrderType::Market,
            crate::types::OrderType::Limit => OrderType::Limit,
        };
        let tif = match time_in_force {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
        };

        let req = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: venue_order_type,
            qty: sized.qty,
            price: None,
            link_id: link_id.clone(),
            reduce_only,
            time_in_force: tif,
        };

        let resp = self.client.place_order(&req).await?;
        info!(symbol, %side, link_id = %resp.link_id, order_id = %resp.order_id, "order submitted");

        if let Err(e) = self.trade_log.append(&TradeLogEntry {
            link_id: resp.link_id.clone(),
            event: "order_submitted".to_string(),
            timestamp: Self::now_secs() as i64,
            fields: HashMap::from([
                ("strategy".to_string(), json!(strategy)),
                ("symbol".to_string(), json!(symbol)),
                ("side".to_string(), json!(side.to_string())),
                ("order_id".to_string(), json!(resp.order_id)),
                ("qty".to_string(), json!(qty)),
                ("reduce_only".to_string(), json!(reduce_only)),
            ]),
        }) {
            warn!(link_id = %resp.link_id, error = %e, "failed to append trade log entry");
        }

        Ok(resp.order_id)
    }

    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), TradingError> {
        self.client.cancel(symbol, Some(order_id)).await
    }

    pub async fn cancel_all(&self, symbol: &str) -> Result<(), TradingError> {
        self.client.cancel(symbol, None).await
    }

    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<rust_decimal::Decimal>,
        take_profit: Option<rust_decimal::Decimal>,
        mode: TpslMode,
    ) -> Result<(), TradingError> {
        let mode_str = match mode {
            TpslMode::Full => "Full",
            TpslMode::Partial => "Partial",
        };
        self.client.set_trading_stop(symbol, stop_loss, take_profit, mode_str).await
    }

    pub async fn cancel_trading_stop(&self, symbol: &str) -> Result<(), TradingError> {
        self.client.cancel_trading_stop(symbol).await
    }

    /// Apply a private-channel order status update to local position state.
    /// Only `PartiallyFilled`/`Filled` move the Position-State Manager; `New`
    /// and `Cancelled` are logged only. Returns the realized PnL this fill
    /// contributed, if any, so callers can feed it to the Risk Engine's
    /// circuit breakers.
    pub fn apply_order_event(
        &self,
        symbol: &str,
        side: Side,
        status: OrderStatus,
        fill_qty: f64,
        fill_price: f64,
    ) -> Option<f64> {
        match status {
            OrderStatus::PartiallyFilled | OrderStatus::Filled if fill_qty > 0.0 => {
                let before = self.positions.get_position_info(symbol).map(|p| p.realized_pnl).unwrap_or(0.0);
                self.positions.add_partial_fill(symbol, side, fill_qty, fill_price);
                let after = self.positions.get_position_info(symbol).map(|p| p.realized_pnl).unwrap_or(0.0);
                let delta = after - before;
                if delta.abs() > f64::EPSILON {
                    Some(delta)
                } else {
                    None
                }
            }
            OrderStatus::New | OrderStatus::Cancelled => {
                warn!(symbol, %side, ?status, "order event with no fill quantity, no position change");
                None
            }
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl crate::kill_switch::ExchangeOrderControl for OrderEngine {
    async fn cancel_all(&self, symbol: &str) -> anyhow::Result<()> {
        self.client.cancel(symbol, None).await.map_err(|e| anyhow::anyhow!("{e}"))
    }

    /// Flatten `symbol` with a market reduce-only order on the side opposite
    /// the current position. Used by the kill-switch sequence; does nothing
    /// if the position is already flat.
    async fn close_reduce_only(&self, symbol: &str, qty: f64) -> anyhow::Result<()> {
        let Some(pos) = self.positions.get_position_info(symbol) else {
            return Ok(());
        };
        let Some(side) = pos.side else {
            return Ok(());
        };
        let close_qty = rust_decimal::Decimal::from_f64(qty).unwrap_or_default();
        let link_id = generate_link_id("kill_switch", symbol, Self::now_secs(), side.opposite());

        let req = OrderRequest {
            symbol: symbol.to_string(),
            side: side.opposite(),
            order_type: OrderType::Market,
            qty: close_qty,
            price: None,
            link_id,
            reduce_only: true,
            time_in_force: "IOC",
        };
        self.client.place_order(&req).await.map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(())
    }
}

impl std::fmt::Debug for OrderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderEngine").field("positions", &self.positions).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Instrument;
    use crate::persistence::PersistentStore;
    use crate::risk::{size_position, RiskLimits, SizingInput};
    use tempfile::NamedTempFile;

    fn test_sized_order() -> SizedOrder {
        let input = SizingInput {
            equity: 10_000.0,
            cash: 10_000.0,
            daily_loss: 0.0,
            open_positions: 0,
            total_exposure_usd: 0.0,
            entry_price: 100.0,
            stop_loss: 98.0,
        };
        let limits = RiskLimits::default();
        let instrument = Instrument::builtin_defaults().into_iter().find(|i| i.symbol == "BTCUSDT").unwrap();
        size_position(&input, &limits, &instrument).expect("sizing should succeed")
    }

    #[test]
    fn duplicate_link_ids_are_detected() {
        let seen = Mutex::new(HashSet::new());
        let id = generate_link_id("mean_rev", "BTCUSDT", 1000, Side::Long);
        assert!(seen.lock().insert(id.clone()));
        assert!(!seen.lock().insert(id));
    }

    struct NoopExchange;

    #[async_trait::async_trait]
    impl crate::kill_switch::ExchangeOrderControl for NoopExchange {
        async fn cancel_all(&self, _symbol: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close_reduce_only(&self, _symbol: &str, _qty: f64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn kill_switch_blocks_order_creation() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(PersistentStore::new(tmp.path().to_path_buf()));
        let kill_switch = Arc::new(KillSwitch::new(store));
        let positions = Arc::new(PositionStateManager::new());

        kill_switch.activate("test halt", &NoopExchange, &positions).await.unwrap();

        let client = Arc::new(BybitClient::new("key", "secret", true));
        let log_file = NamedTempFile::new().unwrap();
        let trade_log = Arc::new(TradeLog::new(log_file.path().to_path_buf()));
        let engine = OrderEngine::new(client, positions, kill_switch, trade_log);

        let sized = test_sized_order();
        let result = engine
            .create_order(
                "mean_rev",
                "BTCUSDT",
                Side::Long,
                &sized,
                false,
                "test-link-id".to_string(),
                crate::types::OrderType::Market,
                TimeInForce::Ioc,
            )
            .await;
        assert!(matches!(result, Err(TradingError::KillSwitchActive { .. })));
    }
}
