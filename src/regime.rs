// =============================================================================
// Regime Switcher — classifies each tick into a coarse market regime
// =============================================================================
//
// Classification uses ADX, Bollinger Band Width, and ATR-slope only (§4.E).
// Rules are evaluated top-to-bottom; the first match wins.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::adx::calculate_adx;
use crate::indicators::atr::atr_slope;
use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::ema::calculate_ema;
use crate::market_data::Candle;

const ADX_TREND_THRESHOLD: f64 = 25.0;
const ADX_RANGE_THRESHOLD: f64 = 20.0;
const BBW_HIGH_VOL_THRESHOLD: f64 = 5.0;
const BBW_SQUEEZE_THRESHOLD: f64 = 1.5;
const ATR_SLOPE_VOL_THRESHOLD: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    TrendUp,
    TrendDown,
    Range,
    HighVol,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendUp => write!(f, "trend_up"),
            Self::TrendDown => write!(f, "trend_down"),
            Self::Range => write!(f, "range"),
            Self::HighVol => write!(f, "high_vol"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub adx: f64,
    pub bbw: f64,
    pub atr_slope: f64,
    pub regime_age_secs: f64,
}

/// Classify a regime from its raw contributing metrics. `atr_slope_val` is
/// the relative change in ATR over a trailing lookback (§4.E).
fn classify(adx: f64, bbw: f64, atr_slope_val: f64, is_uptrend: bool) -> Regime {
    if bbw > BBW_HIGH_VOL_THRESHOLD || atr_slope_val.abs() >= ATR_SLOPE_VOL_THRESHOLD {
        return Regime::HighVol;
    }
    if adx >= ADX_TREND_THRESHOLD {
        return if is_uptrend {
            Regime::TrendUp
        } else {
            Regime::TrendDown
        };
    }
    if adx < ADX_RANGE_THRESHOLD && bbw < BBW_SQUEEZE_THRESHOLD {
        return Regime::Range;
    }
    Regime::Range
}

/// Thread-safe regime switcher that caches the most recently detected state
/// so the meta-layer can read it without recomputing on every gate.
pub struct RegimeSwitcher {
    state: RwLock<Option<RegimeState>>,
    last_change_time: RwLock<Instant>,
}

impl RegimeSwitcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(None),
            last_change_time: RwLock::new(Instant::now()),
        })
    }

    /// Detect the regime from the candle history of the base timeframe.
    /// Returns `None` when there isn't enough history for ADX/BB/ATR-slope.
    pub fn detect(&self, candles: &[Candle]) -> Option<RegimeState> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let adx_value = calculate_adx(candles, 14)?;
        let bb = calculate_bollinger(&closes, 20, 2.0)?;
        let slope = atr_slope(candles, 14, 5).unwrap_or(0.0);

        let ema_20 = calculate_ema(&closes, 20);
        let is_uptrend = match ema_20.last() {
            Some(&ema) => closes.last().copied().unwrap_or(0.0) >= ema,
            None => true,
        };

        let regime = classify(adx_value, bb.width, slope, is_uptrend);

        let now = Instant::now();
        let prev_regime = self.state.read().as_ref().map(|s| s.regime);
        if prev_regime != Some(regime) {
            *self.last_change_time.write() = now;
        }
        let regime_age_secs = now.duration_since(*self.last_change_time.read()).as_secs_f64();

        let new_state = RegimeState {
            regime,
            adx: adx_value,
            bbw: bb.width,
            atr_slope: slope,
            regime_age_secs,
        };

        debug!(
            regime = %regime,
            adx = format!("{:.2}", adx_value),
            bbw = format!("{:.2}", bb.width),
            atr_slope = format!("{:.4}", slope),
            "regime detected"
        );

        *self.state.write() = Some(new_state.clone());
        Some(new_state)
    }

    pub fn current_regime(&self) -> Option<RegimeState> {
        self.state.read().clone()
    }
}

impl Default for RegimeSwitcher {
    fn default() -> Self {
        Self {
            state: RwLock::new(None),
            last_change_time: RwLock::new(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_bbw_wins_over_trend() {
        assert_eq!(classify(30.0, 6.0, 0.0, true), Regime::HighVol);
    }

    #[test]
    fn strong_atr_slope_is_high_vol() {
        assert_eq!(classify(10.0, 1.0, 0.5, true), Regime::HighVol);
    }

    #[test]
    fn high_adx_uptrend_is_trend_up() {
        assert_eq!(classify(26.0, 2.0, 0.0, true), Regime::TrendUp);
    }

    #[test]
    fn high_adx_downtrend_is_trend_down() {
        assert_eq!(classify(26.0, 2.0, 0.0, false), Regime::TrendDown);
    }

    #[test]
    fn low_adx_narrow_bbw_is_range() {
        assert_eq!(classify(15.0, 1.0, 0.0, true), Regime::Range);
    }

    #[test]
    fn display_matches_spec_codes() {
        assert_eq!(Regime::TrendUp.to_string(), "trend_up");
        assert_eq!(Regime::TrendDown.to_string(), "trend_down");
        assert_eq!(Regime::Range.to_string(), "range");
        assert_eq!(Regime::HighVol.to_string(), "high_vol");
    }

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

    #[test]
    fn detect_returns_none_on_insufficient_history() {
        let switcher = RegimeSwitcher::new();
        let candles: Vec<Candle> = (0..5).map(|i| candle(i, 100.0)).collect();
        assert!(switcher.detect(&candles).is_none());
    }

    #[test]
    fn detect_produces_state_with_enough_history() {
        let switcher = RegimeSwitcher::new();
        let candles: Vec<Candle> = (0..60)
            .map(|i| candle(i, 100.0 + (i as f64 * 0.2).sin() * 3.0))
            .collect();
        let state = switcher.detect(&candles);
        assert!(state.is_some());
    }
}
