// =============================================================================
// Kill-Switch — global halt, cancels and closes everything, then persists
// =============================================================================
//
// activate() runs an ordered sequence and must win over the normal loop even
// if called concurrently: persist the flag first (so a crash mid-sequence
// still starts up halted), then cancel every open order, then close every
// remaining position with a market reduce-only IOC, then emit the stop
// event. can_trade() is checked by every send path before admission.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::errors::TradingError;
use crate::persistence::PersistentStore;
use crate::position_state::PositionStateManager;

#[async_trait::async_trait]
pub trait ExchangeOrderControl: Send + Sync {
    async fn cancel_all(&self, symbol: &str) -> anyhow::Result<()>;
    async fn close_reduce_only(&self, symbol: &str, qty: f64) -> anyhow::Result<()>;
}

pub struct KillSwitch {
    active: RwLock<bool>,
    reason: RwLock<Option<String>>,
    store: Arc<PersistentStore>,
}

const STORE_KEY: &str = "trading_disabled";

impl KillSwitch {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        let active = store.get_bool(STORE_KEY).unwrap_or(false);
        if active {
            warn!("kill-switch restored as active from durable store");
        }
        Self {
            active: RwLock::new(active),
            reason: RwLock::new(None),
            store,
        }
    }

    pub fn can_trade(&self) -> bool {
        !*self.active.read()
    }

    /// Persist -> cancel all open orders -> close every remaining position ->
    /// emit a stop event. Positions/symbols are drawn from `positions`, never
    /// a hard-coded list.
    pub async fn activate(
        &self,
        reason: &str,
        exchange: &dyn ExchangeOrderControl,
        positions: &PositionStateManager,
    ) -> Result<(), TradingError> {
        {
            let mut active = self.active.write();
            *active = true;
            *self.reason.write() = Some(reason.to_string());
        }
        self.store.set_bool(STORE_KEY, true).map_err(|e| TradingError::Other(e.into()))?;
        warn!(reason, "kill-switch activated — persisted, halting all trading");

        let symbols = positions.open_symbols();
        for symbol in &symbols {
            if let Err(e) = exchange.cancel_all(symbol).await {
                error!(symbol, error = %e, "kill-switch: failed to cancel open orders");
            }
        }

        for symbol in &symbols {
            if let Some(pos) = positions.get_position_info(symbol) {
                if pos.qty > 0.0 {
                    if let Err(e) = exchange.close_reduce_only(symbol, pos.qty).await {
                        error!(symbol, error = %e, "kill-switch: failed to close position");
                    }
                }
            }
        }

        info!(reason, symbols = ?symbols, "kill-switch sequence complete");
        Ok(())
    }

    /// Clear the flag after manual confirmation.
    pub fn reset(&self) -> anyhow::Result<()> {
        *self.active.write() = false;
        *self.reason.write() = None;
        self.store.set_bool(STORE_KEY, false)?;
        info!("kill-switch reset");
        Ok(())
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    struct MockExchange {
        cancel_calls: AtomicUsize,
        close_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ExchangeOrderControl for MockExchange {
        async fn cancel_all(&self, _symbol: &str) -> anyhow::Result<()> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close_reduce_only(&self, _symbol: &str, _qty: f64) -> anyhow::Result<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn activate_cancels_and_closes_all_tracked_symbols() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(PersistentStore::new(tmp.path().to_path_buf()));
        let kill_switch = KillSwitch::new(store);
        let positions = PositionStateManager::new();
        positions.open_position("BTCUSDT", Side::Long, 0.001, 50_000.0);

        let exchange = MockExchange { cancel_calls: AtomicUsize::new(0), close_calls: AtomicUsize::new(0) };
        kill_switch.activate("panic", &exchange, &positions).await.unwrap();

        assert!(!kill_switch.can_trade());
        assert_eq!(exchange.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_restores_trading() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(PersistentStore::new(tmp.path().to_path_buf()));
        let kill_switch = KillSwitch::new(store);
        let positions = PositionStateManager::new();
        let exchange = MockExchange { cancel_calls: AtomicUsize::new(0), close_calls: AtomicUsize::new(0) };

        kill_switch.activate("test", &exchange, &positions).await.unwrap();
        assert!(!kill_switch.can_trade());
        kill_switch.reset().unwrap();
        assert!(kill_switch.can_trade());
    }
}
