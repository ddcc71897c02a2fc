// =============================================================================
// Market-Data Assembler — publishes one MarketTick per refresh interval
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::features::{build_features, FeatureFrame};
use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};
use crate::market_data::orderbook::OrderBookManager;

/// Orderflow metrics captured alongside a tick, derived from the orderbook
/// snapshot at assembly time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFlowSnapshot {
    pub spread_pct: f64,
    pub depth_imbalance: f64,
}

/// One per-symbol snapshot published on each market-data refresh tick
/// (§4.B). `mtf_cache` stores computed-indicator rows per companion
/// timeframe — never raw OHLCV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub base_tf: String,
    pub base_frames: Vec<FeatureFrame>,
    pub mtf_cache: HashMap<String, Vec<FeatureFrame>>,
    pub orderflow: OrderFlowSnapshot,
}

/// Assembles `MarketTick`s from the candle buffer and orderbook cache. A
/// missing indicator on any configured timeframe fails the whole tick rather
/// than falling back to a default value (§4.B).
pub struct MarketDataAssembler {
    candles: Arc<CandleBuffer>,
    orderbook: Arc<OrderBookManager>,
    companion_timeframes: Vec<String>,
    lookback: usize,
}

impl MarketDataAssembler {
    pub fn new(
        candles: Arc<CandleBuffer>,
        orderbook: Arc<OrderBookManager>,
        companion_timeframes: Vec<String>,
        lookback: usize,
    ) -> Self {
        Self {
            candles,
            orderbook,
            companion_timeframes,
            lookback,
        }
    }

    /// Assemble a single tick for `symbol` on `base_tf`. Returns `None` when
    /// the base timeframe, any companion timeframe, or the orderbook snapshot
    /// does not yet have enough data — the caller should skip this tick and
    /// retry on the next refresh rather than publish a partial tick.
    pub fn assemble(&self, symbol: &str, base_tf: &str) -> Option<MarketTick> {
        let base_key = CandleKey {
            symbol: symbol.to_string(),
            interval: base_tf.to_string(),
        };
        let base_candles = self.candles.get_closed_candles(&base_key, self.lookback);
        let base_frames = build_features(&base_candles);
        if base_frames.is_empty() {
            return None;
        }

        let mut mtf_cache = HashMap::with_capacity(self.companion_timeframes.len());
        for tf in &self.companion_timeframes {
            let key = CandleKey {
                symbol: symbol.to_string(),
                interval: tf.clone(),
            };
            let candles = self.candles.get_closed_candles(&key, self.lookback);
            let frames = build_features(&candles);
            if frames.is_empty() {
                return None;
            }
            mtf_cache.insert(tf.clone(), frames);
        }

        let book = self.orderbook.get(symbol)?;
        let orderflow = OrderFlowSnapshot {
            spread_pct: book.spread_pct,
            depth_imbalance: book.depth_imbalance,
        };

        Some(MarketTick {
            symbol: symbol.to_string(),
            base_tf: base_tf.to_string(),
            base_frames,
            mtf_cache,
            orderflow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle_buffer::Candle;

    fn candle(i: usize, base: f64) -> Candle {
        Candle {
            open_time: i as i64 * 60_000,
            close_time: i as i64 * 60_000 + 59_999,
            open: base,
            high: base + 1.0,
            low: base - 1.0,
            close: base + 0.2,
            volume: 100.0,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    fn seed(buffer: &CandleBuffer, symbol: &str, interval: &str, n: usize) {
        let key = CandleKey {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        };
        for i in 0..n {
            buffer.update(key.clone(), candle(i, 100.0 + (i as f64 * 0.3).sin() * 5.0));
        }
    }

    #[test]
    fn assemble_returns_none_without_orderbook_snapshot() {
        let candles = Arc::new(CandleBuffer::new(200));
        seed(&candles, "BTCUSDT", "60", 120);
        let orderbook = Arc::new(OrderBookManager::new());
        let assembler = MarketDataAssembler::new(candles, orderbook, vec![], 120);
        assert!(assembler.assemble("BTCUSDT", "60").is_none());
    }

    #[test]
    fn assemble_returns_none_on_incomplete_companion_tf() {
        let candles = Arc::new(CandleBuffer::new(200));
        seed(&candles, "BTCUSDT", "60", 120);
        // "15" has no data at all.
        let orderbook = Arc::new(OrderBookManager::new());
        orderbook.update("BTCUSDT", 100.0, 100.1, 10.0, 10.0, 1);
        let assembler =
            MarketDataAssembler::new(candles, orderbook, vec!["15".to_string()], 120);
        assert!(assembler.assemble("BTCUSDT", "60").is_none());
    }

    #[test]
    fn assemble_produces_tick_when_fully_populated() {
        let candles = Arc::new(CandleBuffer::new(200));
        seed(&candles, "BTCUSDT", "60", 120);
        seed(&candles, "BTCUSDT", "15", 120);
        let orderbook = Arc::new(OrderBookManager::new());
        orderbook.update("BTCUSDT", 100.0, 100.1, 10.0, 10.0, 1);
        let assembler =
            MarketDataAssembler::new(candles, orderbook, vec!["15".to_string()], 120);
        let tick = assembler.assemble("BTCUSDT", "60").expect("should assemble");
        assert_eq!(tick.symbol, "BTCUSDT");
        assert!(!tick.base_frames.is_empty());
        assert!(tick.mtf_cache.contains_key("15"));
    }
}
