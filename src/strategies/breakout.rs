use std::collections::HashMap;

use tracing::debug;

use crate::features::FeatureFrame;
use crate::market_data::OrderFlowSnapshot;
use crate::regime::Regime;
use crate::types::Direction;

use super::{Signal, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    Instant,
    Retest,
}

#[derive(Debug, Clone)]
pub struct BreakoutConfig {
    pub percentile_lookback: usize,
    pub squeeze_percentile_threshold: f64,
    pub expansion_percentile_threshold: f64,
    pub squeeze_lookback_bars: usize,
    pub volume_zscore_threshold: f64,
    pub entry_mode: EntryMode,
    pub retest_ttl_bars: usize,
    pub sl_atr_multiplier: f64,
    pub confidence_threshold: f64,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            percentile_lookback: 50,
            squeeze_percentile_threshold: 0.20,
            expansion_percentile_threshold: 0.80,
            squeeze_lookback_bars: 10,
            volume_zscore_threshold: 1.5,
            entry_mode: EntryMode::Instant,
            retest_ttl_bars: 5,
            sl_atr_multiplier: 1.5,
            confidence_threshold: 0.4,
        }
    }
}

pub struct BreakoutStrategy {
    config: BreakoutConfig,
}

impl BreakoutStrategy {
    pub fn new(config: BreakoutConfig) -> Self {
        Self { config }
    }
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self::new(BreakoutConfig::default())
    }
}

/// Fraction of `window` that is `<= value` — a simple empirical percentile.
fn percentile_rank(value: f64, window: &[f64]) -> f64 {
    if window.is_empty() {
        return 0.5;
    }
    let count_le = window.iter().filter(|&&w| w <= value).count();
    count_le as f64 / window.len() as f64
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        "breakout"
    }

    fn min_candles(&self) -> usize {
        self.config.percentile_lookback + 1
    }

    fn confidence_threshold(&self) -> f64 {
        self.config.confidence_threshold
    }

    fn generate_signal(
        &self,
        frames: &[FeatureFrame],
        _orderflow: &OrderFlowSnapshot,
        _regime: Regime,
    ) -> Option<Signal> {
        if frames.len() < self.min_candles() {
            return None;
        }
        let last = frames.last()?;

        let window_start = frames.len() - self.config.percentile_lookback - 1;
        let bbw_window: Vec<f64> = frames[window_start..frames.len() - 1]
            .iter()
            .map(|f| f.bb_width)
            .collect();

        let current_percentile = percentile_rank(last.bb_width, &bbw_window);
        if current_percentile < self.config.expansion_percentile_threshold {
            debug!(reason = "no_volatility_expansion", percentile = current_percentile, "breakout rejected signal");
            return None;
        }

        let squeeze_window_start = frames.len().saturating_sub(self.config.squeeze_lookback_bars + 1);
        let had_recent_squeeze = frames[squeeze_window_start..frames.len() - 1].iter().any(|f| {
            percentile_rank(f.bb_width, &bbw_window) <= self.config.squeeze_percentile_threshold
        });
        if !had_recent_squeeze {
            debug!(reason = "no_recent_squeeze", "breakout rejected signal");
            return None;
        }

        if last.volume_zscore < self.config.volume_zscore_threshold {
            debug!(reason = "volume_zscore_too_low", zscore = last.volume_zscore, "breakout rejected signal");
            return None;
        }

        let direction = if last.close > last.bb_upper {
            Direction::Long
        } else if last.close < last.bb_lower {
            Direction::Short
        } else {
            debug!(reason = "no_band_break", "breakout rejected signal");
            return None;
        };

        let entry_price = match self.config.entry_mode {
            EntryMode::Instant => last.close,
            EntryMode::Retest => if direction == Direction::Long { last.bb_upper } else { last.bb_lower },
        };

        let sl_distance = last.atr * self.config.sl_atr_multiplier;
        let stop_loss = match direction {
            Direction::Long => entry_price - sl_distance,
            Direction::Short => entry_price + sl_distance,
            Direction::Exit => unreachable!(),
        };

        let confidence = ((last.volume_zscore - self.config.volume_zscore_threshold) / 3.0 + 0.5)
            .clamp(0.0, 1.0);

        let mut values = HashMap::new();
        values.insert("bbw_percentile".to_string(), current_percentile);
        values.insert("volume_zscore".to_string(), last.volume_zscore);

        Some(Signal {
            strategy_id: self.name().to_string(),
            symbol: String::new(),
            direction,
            confidence,
            entry_price,
            stop_loss,
            take_profit: None,
            reasons: vec!["bb_squeeze_expansion".to_string(), "volume_confirmed".to_string()],
            values,
            timestamp: last.open_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: usize, close: f64, bb_upper: f64, bb_lower: f64, bb_width: f64, volume_zscore: f64) -> FeatureFrame {
        FeatureFrame {
            open_time: i as i64 * 60_000,
            close,
            high: close + 1.0,
            low: close - 1.0,
            volume: 100.0,
            ema_20: close,
            ema_50: close,
            atr: 1.0,
            atr_percent: 1.0,
            adx: 15.0,
            rsi: 50.0,
            bb_upper,
            bb_lower,
            bb_width,
            vwap: close,
            vwap_distance: 0.0,
            volume_zscore,
            vol_regime: 0,
            has_anomaly: false,
        }
    }

    fn orderflow() -> OrderFlowSnapshot {
        OrderFlowSnapshot { spread_pct: 0.0003, depth_imbalance: 0.0 }
    }

    fn squeeze_then_breakout_frames() -> Vec<FeatureFrame> {
        let mut frames: Vec<FeatureFrame> = (0..50)
            .map(|i| frame(i, 100.0, 102.0, 98.0, 2.0, 0.0))
            .collect();
        // squeeze in the recent past
        for f in frames.iter_mut().rev().skip(5).take(5) {
            f.bb_width = 0.3;
        }
        // breakout bar
        frames.push(frame(50, 105.0, 102.0, 98.0, 6.0, 2.5));
        frames
    }

    #[test]
    fn generates_long_signal_on_squeeze_expansion_break() {
        let strat = BreakoutStrategy::default();
        let frames = squeeze_then_breakout_frames();
        let signal = strat.generate_signal(&frames, &orderflow(), Regime::HighVol);
        assert!(signal.is_some());
        assert_eq!(signal.unwrap().direction, Direction::Long);
    }

    #[test]
    fn rejects_without_recent_squeeze() {
        let strat = BreakoutStrategy::default();
        let mut frames: Vec<FeatureFrame> = (0..50).map(|i| frame(i, 100.0, 102.0, 98.0, 2.0, 0.0)).collect();
        frames.push(frame(50, 105.0, 102.0, 98.0, 6.0, 2.5));
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::HighVol).is_none());
    }

    #[test]
    fn rejects_on_low_volume() {
        let strat = BreakoutStrategy::default();
        let mut frames = squeeze_then_breakout_frames();
        let last = frames.len() - 1;
        frames[last].volume_zscore = 0.0;
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::HighVol).is_none());
    }

    #[test]
    fn insufficient_candles_returns_none() {
        let strat = BreakoutStrategy::default();
        let frames = vec![frame(0, 100.0, 102.0, 98.0, 2.0, 0.0)];
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::HighVol).is_none());
    }
}
