use std::collections::HashMap;

use tracing::debug;

use crate::features::FeatureFrame;
use crate::market_data::OrderFlowSnapshot;
use crate::regime::Regime;
use crate::types::Direction;

use super::{Signal, Strategy};

#[derive(Debug, Clone)]
pub struct MeanReversionConfig {
    pub oversold_rsi: f64,
    pub overbought_rsi: f64,
    pub vwap_distance_threshold: f64,
    /// Anti-knife guard: reject if `|ΔADX|` over the lookback exceeds this.
    pub adx_spike_threshold: f64,
    /// Anti-knife guard: reject if relative ATR-percent change exceeds this.
    pub atr_spike_threshold: f64,
    pub spike_lookback_bars: usize,
    pub sl_atr_multiplier: f64,
    pub max_hold_bars: usize,
    pub confidence_threshold: f64,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            oversold_rsi: 30.0,
            overbought_rsi: 70.0,
            vwap_distance_threshold: 0.01,
            adx_spike_threshold: 10.0,
            atr_spike_threshold: 0.5,
            spike_lookback_bars: 3,
            sl_atr_multiplier: 1.2,
            max_hold_bars: 48,
            confidence_threshold: 0.4,
        }
    }
}

pub struct MeanReversionStrategy {
    config: MeanReversionConfig,
}

impl MeanReversionStrategy {
    pub fn new(config: MeanReversionConfig) -> Self {
        Self { config }
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new(MeanReversionConfig::default())
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn min_candles(&self) -> usize {
        self.config.spike_lookback_bars + 1
    }

    fn confidence_threshold(&self) -> f64 {
        self.config.confidence_threshold
    }

    fn generate_signal(
        &self,
        frames: &[FeatureFrame],
        _orderflow: &OrderFlowSnapshot,
        regime: Regime,
    ) -> Option<Signal> {
        if regime != Regime::Range {
            debug!(reason = "regime_not_range", "mean_reversion rejected signal");
            return None;
        }
        if frames.len() < self.min_candles() {
            return None;
        }
        let last = frames.last()?;
        let prev = &frames[frames.len() - 1 - self.config.spike_lookback_bars];

        let delta_adx = (last.adx - prev.adx).abs();
        if delta_adx >= self.config.adx_spike_threshold {
            debug!(reason = "anti_knife_adx_spike", delta_adx, "mean_reversion rejected signal");
            return None;
        }
        let atr_change = if prev.atr_percent.abs() > f64::EPSILON {
            (last.atr_percent - prev.atr_percent) / prev.atr_percent
        } else {
            0.0
        };
        if atr_change.abs() >= self.config.atr_spike_threshold {
            debug!(reason = "anti_knife_atr_spike", atr_change, "mean_reversion rejected signal");
            return None;
        }

        let direction = if last.vwap_distance <= -self.config.vwap_distance_threshold
            && last.rsi <= self.config.oversold_rsi
        {
            Direction::Long
        } else if last.vwap_distance >= self.config.vwap_distance_threshold
            && last.rsi >= self.config.overbought_rsi
        {
            Direction::Short
        } else {
            debug!(reason = "no_mean_reversion_setup", "mean_reversion rejected signal");
            return None;
        };

        let entry_price = last.close;
        let sl_distance = last.atr * self.config.sl_atr_multiplier;
        let stop_loss = match direction {
            Direction::Long => entry_price - sl_distance,
            Direction::Short => entry_price + sl_distance,
            Direction::Exit => unreachable!(),
        };
        // Take-profit is a return to VWAP (§4.D, mandatory exit for this strategy).
        let take_profit = Some(last.vwap);

        let confidence = (last.vwap_distance.abs() / (self.config.vwap_distance_threshold * 3.0))
            .clamp(0.0, 1.0);

        let mut values = HashMap::new();
        values.insert("rsi".to_string(), last.rsi);
        values.insert("vwap_distance".to_string(), last.vwap_distance);
        values.insert("delta_adx".to_string(), delta_adx);

        Some(Signal {
            strategy_id: self.name().to_string(),
            symbol: String::new(),
            direction,
            confidence,
            entry_price,
            stop_loss,
            take_profit,
            reasons: vec!["vwap_extreme".to_string(), "rsi_extreme".to_string(), "range_regime".to_string()],
            values,
            timestamp: last.open_time,
        })
    }
}

/// `true` once a position held by this strategy has exceeded `max_hold_bars`
/// from `opened_at_bar` to `current_bar` — the mandatory time_stop (§4.D).
pub fn time_stop_triggered(config: &MeanReversionConfig, opened_at_bar: u64, current_bar: u64) -> bool {
    current_bar.saturating_sub(opened_at_bar) >= config.max_hold_bars as u64
}
