use std::collections::HashMap;

use tracing::debug;

use crate::features::FeatureFrame;
use crate::market_data::OrderFlowSnapshot;
use crate::regime::Regime;
use crate::types::Direction;

use super::{Signal, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    ConfirmClose,
    LimitAtEma,
}

#[derive(Debug, Clone)]
pub struct TrendPullbackConfig {
    pub min_adx: f64,
    pub entry_zone_atr_low: f64,
    pub entry_zone_atr_high: f64,
    /// Candle range, expressed as a multiple of ATR, above which a bar is
    /// treated as a liquidation wick.
    pub wick_range_atr_threshold: f64,
    pub wick_volume_zscore_threshold: f64,
    pub cooldown_bars: usize,
    pub entry_mode: EntryMode,
    pub limit_ttl_bars: usize,
    pub sl_atr_multiplier: f64,
    pub confidence_threshold: f64,
}

impl Default for TrendPullbackConfig {
    fn default() -> Self {
        Self {
            min_adx: 25.0,
            entry_zone_atr_low: 0.3,
            entry_zone_atr_high: 1.5,
            wick_range_atr_threshold: 3.0,
            wick_volume_zscore_threshold: 2.0,
            cooldown_bars: 5,
            entry_mode: EntryMode::ConfirmClose,
            limit_ttl_bars: 3,
            sl_atr_multiplier: 1.5,
            confidence_threshold: 0.4,
        }
    }
}

pub struct TrendPullbackStrategy {
    config: TrendPullbackConfig,
}

impl TrendPullbackStrategy {
    pub fn new(config: TrendPullbackConfig) -> Self {
        Self { config }
    }
}

impl Default for TrendPullbackStrategy {
    fn default() -> Self {
        Self::new(TrendPullbackConfig::default())
    }
}

impl Strategy for TrendPullbackStrategy {
    fn name(&self) -> &str {
        "trend_pullback"
    }

    fn min_candles(&self) -> usize {
        self.config.cooldown_bars + 2
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
        if last.atr <= 0.0 {
            return None;
        }

        let bullish_alignment = last.ema_20 > last.ema_50 && last.close > last.ema_20;
        let bearish_alignment = last.ema_20 < last.ema_50 && last.close < last.ema_20;

        let direction = if bullish_alignment {
            Direction::Long
        } else if bearish_alignment {
            Direction::Short
        } else {
            debug!(reason = "ema_not_aligned", "trend_pullback rejected signal");
            return None;
        };

        if last.adx < self.config.min_adx {
            debug!(reason = "trend_adx_too_low", adx = last.adx, "trend_pullback rejected signal");
            return None;
        }

        let pullback_depth_atr = (last.close - last.ema_20).abs() / last.atr;
        if pullback_depth_atr < self.config.entry_zone_atr_low
            || pullback_depth_atr > self.config.entry_zone_atr_high
        {
            debug!(
                reason = "pullback_depth_out_of_zone",
                depth_atr = pullback_depth_atr,
                "trend_pullback rejected signal"
            );
            return None;
        }

        let lookback_start = frames.len().saturating_sub(self.config.cooldown_bars + 1);
        let cooldown_window = &frames[lookback_start..frames.len() - 1];
        let wick_event = cooldown_window.iter().any(|f| {
            let range_atr = (f.high - f.low) / f.atr.max(f64::EPSILON);
            range_atr > self.config.wick_range_atr_threshold
                && f.volume_zscore > self.config.wick_volume_zscore_threshold
        });
        if wick_event {
            debug!(reason = "liquidation_wick_cooldown", "trend_pullback rejected signal");
            return None;
        }

        let entry_price = match self.config.entry_mode {
            EntryMode::ConfirmClose => last.close,
            EntryMode::LimitAtEma => last.ema_20,
        };

        let sl_distance = last.atr * self.config.sl_atr_multiplier;
        let stop_loss = match direction {
            Direction::Long => entry_price - sl_distance,
            Direction::Short => entry_price + sl_distance,
            Direction::Exit => unreachable!(),
        };

        let confidence = ((last.adx - self.config.min_adx) / 50.0 + 0.5).clamp(0.0, 1.0);

        let mut values = HashMap::new();
        values.insert("adx".to_string(), last.adx);
        values.insert("pullback_depth_atr".to_string(), pullback_depth_atr);
        values.insert("atr".to_string(), last.atr);

        Some(Signal {
            strategy_id: self.name().to_string(),
            symbol: String::new(),
            direction,
            confidence,
            entry_price,
            stop_loss,
            take_profit: None,
            reasons: vec!["trend_adx_ok".to_string(), "ema_aligned".to_string(), "pullback_in_zone".to_string()],
            values,
            timestamp: last.open_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: usize, close: f64, ema_20: f64, ema_50: f64, adx: f64) -> FeatureFrame {
        FeatureFrame {
            open_time: i as i64 * 60_000,
            close,
            high: close + 1.0,
            low: close - 1.0,
            volume: 100.0,
            ema_20,
            ema_50,
            atr: 1.0,
            atr_percent: 1.0,
            adx,
            rsi: 50.0,
            bb_upper: close + 2.0,
            bb_lower: close - 2.0,
            bb_width: 2.0,
            vwap: close,
            vwap_distance: 0.0,
            volume_zscore: 0.0,
            vol_regime: 0,
            has_anomaly: false,
        }
    }

    fn base_frames() -> Vec<FeatureFrame> {
        (0..10).map(|i| frame(i, 101.0, 100.0, 95.0, 30.0)).collect()
    }

    fn orderflow() -> OrderFlowSnapshot {
        OrderFlowSnapshot {
            spread_pct: 0.0005,
            depth_imbalance: 0.0,
        }
    }

    #[test]
    fn generates_long_signal_on_aligned_pullback() {
        let strat = TrendPullbackStrategy::default();
        let frames = base_frames();
        let signal = strat.generate_signal(&frames, &orderflow(), Regime::TrendUp);
        assert!(signal.is_some());
        assert_eq!(signal.unwrap().direction, Direction::Long);
    }

    #[test]
    fn rejects_on_low_adx() {
        let strat = TrendPullbackStrategy::default();
        let frames: Vec<FeatureFrame> = (0..10).map(|i| frame(i, 101.0, 100.0, 95.0, 10.0)).collect();
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::Range).is_none());
    }

    #[test]
    fn rejects_when_not_ema_aligned() {
        let strat = TrendPullbackStrategy::default();
        let frames: Vec<FeatureFrame> = (0..10).map(|i| frame(i, 101.0, 100.0, 105.0, 30.0)).collect();
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::Range).is_none());
    }

    #[test]
    fn rejects_on_pullback_depth_out_of_zone() {
        let strat = TrendPullbackStrategy::default();
        // close == ema_20 => depth 0, below entry_zone_atr_low.
        let frames: Vec<FeatureFrame> = (0..10).map(|i| frame(i, 100.0, 100.0, 95.0, 30.0)).collect();
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::TrendUp).is_none());
    }

    #[test]
    fn rejects_on_recent_liquidation_wick() {
        let strat = TrendPullbackStrategy::default();
        let mut frames = base_frames();
        let idx = frames.len() - 3;
        frames[idx].high = frames[idx].close + 10.0;
        frames[idx].low = frames[idx].close - 10.0;
        frames[idx].volume_zscore = 3.0;
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::TrendUp).is_none());
    }

    #[test]
    fn insufficient_candles_returns_none() {
        let strat = TrendPullbackStrategy::default();
        let frames = vec![frame(0, 101.0, 100.0, 95.0, 30.0)];
        assert!(strat.generate_signal(&frames, &orderflow(), Regime::TrendUp).is_none());
    }
}
