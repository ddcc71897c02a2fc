// =============================================================================
// Meta-Layer — ordered gate between Strategies and the Risk Engine
// =============================================================================
//
// Four gates run in order; the first rejection short-circuits the rest:
//   1. NoTradeZones
//   2. RegimeSwitcher (classification only — strategies self-restrict)
//   3. MTF confluence
//   4. Conflict resolver (across strategies producing opposing signals)

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::errors::Rejection;
use crate::features::FeatureFrame;
use crate::market_data::{MarketTick, OrderFlowSnapshot};
use crate::regime::{Regime, RegimeSwitcher};
use crate::strategies::Signal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoTradeZonesConfig {
    pub max_spread_pct: f64,
    pub max_depth_imbalance: f64,
    pub high_vol_atr_percent_threshold: f64,
    pub max_error_count: u32,
    /// UTC hour ranges `(start, end)` during which new entries are blocked.
    /// `start == end` disables the entry; `start > end` wraps past midnight
    /// (e.g. `(22, 2)` blocks 22:00 through 01:59).
    pub no_trade_hours: Vec<(u8, u8)>,
}

impl Default for NoTradeZonesConfig {
    fn default() -> Self {
        Self {
            max_spread_pct: 0.02,
            max_depth_imbalance: 0.9,
            high_vol_atr_percent_threshold: 10.0,
            max_error_count: 5,
            no_trade_hours: Vec::new(),
        }
    }
}

fn hour_in_range(hour: u8, start: u8, end: u8) -> bool {
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtfConfluenceConfig {
    pub enabled: bool,
    pub weights: HashMap<String, f64>,
    pub score_threshold: f64,
}

impl Default for MtfConfluenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weights: HashMap::new(),
            score_threshold: 0.3,
        }
    }
}

pub struct MetaLayer {
    pub regime_switcher: Arc<RegimeSwitcher>,
    pub no_trade_zones: NoTradeZonesConfig,
    pub mtf: MtfConfluenceConfig,
    /// Strategy names in priority order, used to break confidence ties.
    pub strategy_priority: Vec<String>,
}

impl MetaLayer {
    pub fn new(
        regime_switcher: Arc<RegimeSwitcher>,
        no_trade_zones: NoTradeZonesConfig,
        mtf: MtfConfluenceConfig,
        strategy_priority: Vec<String>,
    ) -> Self {
        Self {
            regime_switcher,
            no_trade_zones,
            mtf,
            strategy_priority,
        }
    }

    /// Gate 1: reject on anomaly flags, wide spread, extreme depth imbalance,
    /// high-vol-regime-with-wide-ATR combination, or too many recent errors.
    pub fn check_no_trade_zones(
        &self,
        last_frame: &FeatureFrame,
        orderflow: &OrderFlowSnapshot,
        recent_error_count: u32,
    ) -> Result<(), Rejection> {
        if last_frame.has_anomaly {
            return Err(Rejection::new("anomaly_detected", json!({})));
        }
        if orderflow.spread_pct.abs() > self.no_trade_zones.max_spread_pct {
            return Err(Rejection::new(
                "spread_too_wide",
                json!({ "spread_pct": orderflow.spread_pct, "max": self.no_trade_zones.max_spread_pct }),
            ));
        }
        if orderflow.depth_imbalance.abs() >= self.no_trade_zones.max_depth_imbalance {
            return Err(Rejection::new(
                "depth_imbalance_extreme",
                json!({ "depth_imbalance": orderflow.depth_imbalance }),
            ));
        }
        if last_frame.vol_regime == 1
            && last_frame.atr_percent > self.no_trade_zones.high_vol_atr_percent_threshold
        {
            return Err(Rejection::new(
                "volatility_too_high",
                json!({ "atr_percent": last_frame.atr_percent }),
            ));
        }
        if recent_error_count > self.no_trade_zones.max_error_count {
            return Err(Rejection::new(
                "error_count_exceeded",
                json!({ "error_count": recent_error_count }),
            ));
        }
        if let Some(hour) = chrono::DateTime::from_timestamp_millis(last_frame.open_time).map(|dt| dt.hour() as u8) {
            if self.no_trade_zones.no_trade_hours.iter().any(|&(start, end)| hour_in_range(hour, start, end)) {
                return Err(Rejection::new("inside_no_trade_hours", json!({ "hour": hour })));
            }
        }
        Ok(())
    }

    /// Gate 2: classify the regime off the base-timeframe candle history.
    /// Pure delegation — kept as its own gate step so callers can log/branch
    /// on the classification even when no strategy restricts on it.
    pub fn classify_regime(&self, tick: &MarketTick) -> Option<Regime> {
        let last = tick.base_frames.last()?;
        // Regime switcher needs raw candle history; caller re-detects off the
        // assembler's own buffer. Here we approximate off the last frame's
        // metrics directly when a fresh detection isn't available.
        self.regime_switcher
            .current_regime()
            .map(|s| s.regime)
            .or_else(|| {
                if last.adx >= 25.0 {
                    Some(Regime::TrendUp)
                } else {
                    Some(Regime::Range)
                }
            })
    }

    /// Gate 3: multi-timeframe confluence score. `sign(close - ema_20)` per
    /// TF, weighted and summed; rejects when `|score| < score_threshold`.
    pub fn mtf_confluence_score(&self, mtf_cache: &HashMap<String, Vec<FeatureFrame>>) -> f64 {
        let mut score = 0.0;
        for (tf, frames) in mtf_cache {
            let Some(last) = frames.last() else { continue };
            let trend_sign = if last.close > last.ema_20 {
                1.0
            } else if last.close < last.ema_20 {
                -1.0
            } else {
                0.0
            };
            let weight = self.mtf.weights.get(tf).copied().unwrap_or(1.0);
            score += weight * trend_sign;
        }
        score
    }

    pub fn check_mtf_confluence(&self, mtf_cache: &HashMap<String, Vec<FeatureFrame>>) -> Result<(), Rejection> {
        if !self.mtf.enabled {
            return Ok(());
        }
        let score = self.mtf_confluence_score(mtf_cache);
        if score.abs() < self.mtf.score_threshold {
            return Err(Rejection::new(
                "mtf_confluence_insufficient",
                json!({ "score": score, "threshold": self.mtf.score_threshold }),
            ));
        }
        Ok(())
    }

    /// Gate 4: when multiple strategies fire in the same tick with opposing
    /// directions, keep the highest-confidence signal; ties broken by
    /// `strategy_priority` order (earlier wins).
    pub fn resolve_conflicts(&self, signals: Vec<Signal>) -> Option<Signal> {
        if signals.len() <= 1 {
            return signals.into_iter().next();
        }

        let priority_rank = |strategy_id: &str| -> usize {
            self.strategy_priority
                .iter()
                .position(|s| s == strategy_id)
                .unwrap_or(usize::MAX)
        };

        let directions_conflict = signals.windows(2).any(|w| w[0].direction != w[1].direction);
        if !directions_conflict {
            // Same direction from multiple strategies — keep the most confident.
            return signals
                .into_iter()
                .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap());
        }

        debug!(count = signals.len(), "meta-layer resolving conflicting signals");

        signals.into_iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap()
                .then_with(|| priority_rank(&b.strategy_id).cmp(&priority_rank(&a.strategy_id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn frame(close: f64, ema_20: f64, vol_regime: i8, atr_percent: f64, has_anomaly: bool) -> FeatureFrame {
        FeatureFrame {
            open_time: 0,
            close,
            high: close + 1.0,
            low: close - 1.0,
            volume: 100.0,
            ema_20,
            ema_50: ema_20,
            atr: 1.0,
            atr_percent,
            adx: 15.0,
            rsi: 50.0,
            bb_upper: close + 2.0,
            bb_lower: close - 2.0,
            bb_width: 1.0,
            vwap: close,
            vwap_distance: 0.0,
            volume_zscore: 0.0,
            vol_regime,
            has_anomaly,
        }
    }

    fn meta_layer() -> MetaLayer {
        MetaLayer::new(
            RegimeSwitcher::new(),
            NoTradeZonesConfig::default(),
            MtfConfluenceConfig::default(),
            vec!["trend_pullback".to_string(), "breakout".to_string()],
        )
    }

    fn orderflow(spread: f64, imbalance: f64) -> OrderFlowSnapshot {
        OrderFlowSnapshot { spread_pct: spread, depth_imbalance: imbalance }
    }

    #[test]
    fn no_trade_zones_rejects_anomaly() {
        let layer = meta_layer();
        let f = frame(100.0, 99.0, 0, 1.0, true);
        assert!(layer.check_no_trade_zones(&f, &orderflow(0.001, 0.0), 0).is_err());
    }

    #[test]
    fn no_trade_zones_rejects_wide_spread() {
        let layer = meta_layer();
        let f = frame(100.0, 99.0, 0, 1.0, false);
        assert!(layer.check_no_trade_zones(&f, &orderflow(0.05, 0.0), 0).is_err());
    }

    #[test]
    fn no_trade_zones_rejects_extreme_depth_imbalance() {
        let layer = meta_layer();
        let f = frame(100.0, 99.0, 0, 1.0, false);
        assert!(layer.check_no_trade_zones(&f, &orderflow(0.001, 0.95), 0).is_err());
    }

    #[test]
    fn no_trade_zones_rejects_high_vol_with_wide_atr() {
        let layer = meta_layer();
        let f = frame(100.0, 99.0, 1, 12.0, false);
        assert!(layer.check_no_trade_zones(&f, &orderflow(0.001, 0.0), 0).is_err());
    }

    #[test]
    fn no_trade_zones_passes_clean_tick() {
        let layer = meta_layer();
        let f = frame(100.0, 99.0, 0, 1.0, false);
        assert!(layer.check_no_trade_zones(&f, &orderflow(0.001, 0.1), 0).is_ok());
    }

    #[test]
    fn no_trade_zones_rejects_inside_configured_hour() {
        let mut layer = meta_layer();
        layer.no_trade_zones.no_trade_hours = vec![(22, 2)];
        let mut f = frame(100.0, 99.0, 0, 1.0, false);
        f.open_time = 1_700_000_400_000; // 23:00 UTC on that day
        assert!(layer.check_no_trade_zones(&f, &orderflow(0.001, 0.0), 0).is_err());
    }

    #[test]
    fn mtf_score_sums_weighted_signs() {
        let mut layer = meta_layer();
        layer.mtf.weights.insert("15".to_string(), 2.0);
        layer.mtf.weights.insert("60".to_string(), 1.0);
        let mut cache = HashMap::new();
        cache.insert("15".to_string(), vec![frame(105.0, 100.0, 0, 1.0, false)]);
        cache.insert("60".to_string(), vec![frame(105.0, 100.0, 0, 1.0, false)]);
        let score = layer.mtf_confluence_score(&cache);
        assert!((score - 3.0).abs() < 1e-9);
    }

    #[test]
    fn mtf_confluence_rejects_below_threshold() {
        let mut layer = meta_layer();
        layer.mtf.score_threshold = 0.5;
        let mut cache = HashMap::new();
        cache.insert("15".to_string(), vec![frame(100.0, 100.0, 0, 1.0, false)]);
        assert!(layer.check_mtf_confluence(&cache).is_err());
    }

    fn signal(strategy_id: &str, direction: Direction, confidence: f64) -> Signal {
        Signal {
            strategy_id: strategy_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            direction,
            confidence,
            entry_price: 100.0,
            stop_loss: 99.0,
            take_profit: None,
            reasons: vec![],
            values: HashMap::new(),
            timestamp: 0,
        }
    }

    #[test]
    fn conflict_resolver_keeps_higher_confidence() {
        let layer = meta_layer();
        let signals = vec![
            signal("trend_pullback", Direction::Long, 0.4),
            signal("breakout", Direction::Short, 0.8),
        ];
        let resolved = layer.resolve_conflicts(signals).unwrap();
        assert_eq!(resolved.strategy_id, "breakout");
    }

    #[test]
    fn conflict_resolver_breaks_ties_by_priority() {
        let layer = meta_layer();
        let signals = vec![
            signal("breakout", Direction::Short, 0.5),
            signal("trend_pullback", Direction::Long, 0.5),
        ];
        let resolved = layer.resolve_conflicts(signals).unwrap();
        assert_eq!(resolved.strategy_id, "trend_pullback");
    }

    #[test]
    fn single_signal_passes_through() {
        let layer = meta_layer();
        let signals = vec![signal("trend_pullback", Direction::Long, 0.6)];
        let resolved = layer.resolve_conflicts(signals).unwrap();
        assert_eq!(resolved.strategy_id, "trend_pullback");
    }
}
