// =============================================================================
// App — composition root tying every subsystem together
// =============================================================================
//
// One Arc<App> is shared across every task. Components that need live config
// hold the RwLock handle; components that only need a point-in-time read are
// handed a cloned snapshot at construction.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::exchange::bybit::BybitClient;
use crate::instrument::Instrument;
use crate::kill_switch::KillSwitch;
use crate::market_data::assembler::MarketDataAssembler;
use crate::market_data::{CandleBuffer, OrderBookManager};
use crate::meta_layer::MetaLayer;
use crate::order_engine::OrderEngine;
use crate::persistence::{PersistentStore, TradeLog};
use crate::position_state::PositionStateManager;
use crate::regime::RegimeSwitcher;
use crate::risk::RiskEngine;
use crate::strategies::{BreakoutStrategy, MeanReversionStrategy, Strategy, TrendPullbackStrategy};

/// Base candle interval every strategy and the regime switcher read off of.
pub const BASE_TIMEFRAME: &str = "5";
/// Companion timeframes the MTF confluence gate scores against.
pub const COMPANION_TIMEFRAMES: &[&str] = &["15", "60"];
/// Candles of trailing history the assembler keeps per timeframe.
const ASSEMBLER_LOOKBACK: usize = 200;

pub struct App {
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub candle_buffer: Arc<CandleBuffer>,
    pub orderbook: Arc<OrderBookManager>,
    pub regime_switcher: Arc<RegimeSwitcher>,
    pub instruments: RwLock<Vec<Instrument>>,
    pub assembler: MarketDataAssembler,
    pub meta_layer: MetaLayer,
    pub strategies: Vec<Box<dyn Strategy>>,
    pub risk_engine: Arc<RiskEngine>,
    pub positions: Arc<PositionStateManager>,
    pub kill_switch: Arc<KillSwitch>,
    pub order_engine: Arc<OrderEngine>,
    pub store: Arc<PersistentStore>,
    pub trade_log: Arc<TradeLog>,
    /// bar open_time (ms) each symbol's current mean-reversion position was
    /// opened at, used to drive `time_stop_triggered`. Cleared when the
    /// position closes.
    pub mr_opened_at_ms: RwLock<std::collections::HashMap<String, i64>>,
}

impl App {
    pub fn new(config: RuntimeConfig, client: Arc<BybitClient>, data_dir: &std::path::Path) -> Self {
        let config = Arc::new(RwLock::new(config));
        let store = Arc::new(PersistentStore::new(data_dir.join("state.json")));
        let trade_log = Arc::new(TradeLog::new(data_dir.join("trades.jsonl")));

        let positions = Arc::new(PositionStateManager::new());
        let kill_switch = Arc::new(KillSwitch::new(store.clone()));
        let order_engine =
            Arc::new(OrderEngine::new(client, positions.clone(), kill_switch.clone(), trade_log.clone()));

        let risk_cfg = config.read().risk_management.clone();
        let capital = config.read().paper_trading.starting_equity;
        let risk_engine = Arc::new(RiskEngine::new(
            capital,
            risk_cfg.limits.max_daily_loss_percent,
            risk_cfg.max_consecutive_losses,
            risk_cfg.max_drawdown_pct,
            risk_cfg.max_daily_trades,
        ));

        let candle_buffer = Arc::new(CandleBuffer::new(500));
        let orderbook = Arc::new(OrderBookManager::new());
        let regime_switcher = RegimeSwitcher::new();

        let assembler = MarketDataAssembler::new(
            candle_buffer.clone(),
            orderbook.clone(),
            COMPANION_TIMEFRAMES.iter().map(|s| s.to_string()).collect(),
            ASSEMBLER_LOOKBACK,
        );

        let active_strategies = config.read().trading.active_strategies.clone();
        let meta_cfg = config.read().meta_layer.clone();
        let meta_layer = MetaLayer::new(
            regime_switcher.clone(),
            meta_cfg.no_trade_zones,
            meta_cfg.mtf_confluence,
            active_strategies.clone(),
        );
        let strategies = build_strategy_registry(&active_strategies);

        Self {
            config,
            candle_buffer,
            orderbook,
            regime_switcher,
            instruments: RwLock::new(Instrument::builtin_defaults()),
            assembler,
            meta_layer,
            strategies,
            risk_engine,
            positions,
            kill_switch,
            order_engine,
            store,
            trade_log,
            mr_opened_at_ms: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn instrument_for(&self, symbol: &str) -> Option<Instrument> {
        self.instruments.read().iter().find(|i| i.symbol == symbol).cloned()
    }
}

/// Build the live strategy set from `active_strategies` names. An unknown
/// name is logged and skipped rather than failing startup.
pub(crate) fn build_strategy_registry(active: &[String]) -> Vec<Box<dyn Strategy>> {
    let mut registry: Vec<Box<dyn Strategy>> = Vec::new();
    for name in active {
        match name.as_str() {
            "mean_reversion" => registry.push(Box::new(MeanReversionStrategy::default())),
            "trend_pullback" => registry.push(Box::new(TrendPullbackStrategy::default())),
            "breakout" => registry.push(Box::new(BreakoutStrategy::default())),
            other => tracing::warn!(strategy = other, "unknown strategy name in active_strategies, skipping"),
        }
    }
    registry
}
