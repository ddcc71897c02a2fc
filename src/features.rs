// =============================================================================
// Feature Pipeline — turns raw candles into indicator-augmented FeatureFrames
// =============================================================================
//
// `build_features` is a pure function: same input candles always produce the
// same output frames. Regime labels (`vol_regime`, `has_anomaly`) are derived
// here so strategies and the meta-layer never recompute thresholds themselves.

use serde::{Deserialize, Serialize};

use crate::indicators::{adx, atr, bollinger, ema, rsi, volume_zscore, vwap};
use crate::market_data::Candle;

const EMA_FAST_PERIOD: usize = 20;
const EMA_SLOW_PERIOD: usize = 50;
const ATR_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;
const RSI_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_STD: f64 = 2.0;
const VWAP_PERIOD: usize = 20;
const VOLUME_ZSCORE_PERIOD: usize = 20;

/// High/low ATR-percent thresholds used to derive `vol_regime`.
const VOL_REGIME_HI_THR: f64 = 3.0;
const VOL_REGIME_LO_THR: f64 = 0.5;

/// Anomaly thresholds (§4.C): spread > 2%, extreme wick ratio, or
/// `|depth_imbalance| > 0.9`.
const ANOMALY_SPREAD_PCT: f64 = 0.02;
const ANOMALY_WICK_RATIO: f64 = 3.0;
const ANOMALY_DEPTH_IMBALANCE: f64 = 0.9;

/// A candle augmented with every derived field downstream components read.
/// Producer-owned, read-only once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub open_time: i64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub ema_20: f64,
    pub ema_50: f64,
    pub atr: f64,
    pub atr_percent: f64,
    pub adx: f64,
    pub rsi: f64,
    pub bb_upper: f64,
    pub bb_lower: f64,
    pub bb_width: f64,
    pub vwap: f64,
    pub vwap_distance: f64,
    pub volume_zscore: f64,
    /// `+1` high volatility, `-1` low volatility, `0` normal.
    pub vol_regime: i8,
    pub has_anomaly: bool,
}

/// Build one `FeatureFrame` per candle that has enough trailing history for
/// every indicator. Candles without enough lookback are dropped rather than
/// filled with fallback values — a missing indicator must fail the tick, not
/// silently default (§4.B).
pub fn build_features(candles: &[Candle]) -> Vec<FeatureFrame> {
    let min_required = [
        EMA_SLOW_PERIOD,
        ATR_PERIOD + 1,
        ADX_PERIOD * 2,
        RSI_PERIOD + 1,
        BOLLINGER_PERIOD,
        VWAP_PERIOD,
        VOLUME_ZSCORE_PERIOD,
    ]
    .into_iter()
    .max()
    .unwrap_or(1);

    if candles.len() < min_required {
        return Vec::new();
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let ema_20_series = ema::calculate_ema(&closes, EMA_FAST_PERIOD);
    let ema_50_series = ema::calculate_ema(&closes, EMA_SLOW_PERIOD);
    let rsi_series = rsi::calculate_rsi(&closes, RSI_PERIOD);
    let vwap_series = vwap::calculate_vwap(candles, VWAP_PERIOD);
    let vol_zscore_series = volume_zscore::calculate_volume_zscore(&volumes, VOLUME_ZSCORE_PERIOD);

    // `calculate_ema`/`calculate_rsi` return series offset from the input
    // slice (first value seeds at `period`/`period - 1`); these closures map
    // a candle index back into each series, yielding `None` before the series
    // has started.
    let ema_at = |series: &[f64], period: usize, i: usize| -> Option<f64> {
        i.checked_sub(period - 1).and_then(|j| series.get(j).copied())
    };
    let rsi_at = |series: &[f64], period: usize, i: usize| -> Option<f64> {
        i.checked_sub(period).and_then(|j| series.get(j).copied())
    };

    let mut frames = Vec::with_capacity(candles.len());

    for i in (min_required - 1)..candles.len() {
        let window = &candles[..=i];

        let Some(atr_val) = atr::calculate_atr(window, ATR_PERIOD) else {
            continue;
        };
        let Some(adx_val) = adx::calculate_adx(window, ADX_PERIOD) else {
            continue;
        };
        let Some(bb) = bollinger::calculate_bollinger(&closes[..=i], BOLLINGER_PERIOD, BOLLINGER_STD)
        else {
            continue;
        };
        let Some(ema_20_val) = ema_at(&ema_20_series, EMA_FAST_PERIOD, i) else {
            continue;
        };
        let Some(ema_50_val) = ema_at(&ema_50_series, EMA_SLOW_PERIOD, i) else {
            continue;
        };
        let Some(rsi_val) = rsi_at(&rsi_series, RSI_PERIOD, i) else {
            continue;
        };
        let Some(vwap_val) = vwap_series[i] else {
            continue;
        };
        let Some(vwap_dist) = vwap::vwap_distance(closes[i], vwap_val) else {
            continue;
        };
        let Some(vol_z) = vol_zscore_series[i] else {
            continue;
        };

        let close = closes[i];
        let atr_percent = if close.abs() > f64::EPSILON {
            (atr_val / close) * 100.0
        } else {
            continue;
        };

        let vol_regime = if atr_percent > VOL_REGIME_HI_THR {
            1
        } else if atr_percent < VOL_REGIME_LO_THR {
            -1
        } else {
            0
        };

        let candle = &candles[i];
        let range = candle.high - candle.low;
        let body = (candle.close - candle.open).abs();
        let wick_ratio = if body > f64::EPSILON { range / body } else { 0.0 };
        let has_anomaly = wick_ratio > ANOMALY_WICK_RATIO;

        frames.push(FeatureFrame {
            open_time: candle.open_time,
            close,
            high: candle.high,
            low: candle.low,
            volume: candle.volume,
            ema_20: ema_20_val,
            ema_50: ema_50_val,
            atr: atr_val,
            atr_percent,
            adx: adx_val,
            rsi: rsi_val,
            bb_upper: bb.upper,
            bb_lower: bb.lower,
            bb_width: bb.width,
            vwap: vwap_val,
            vwap_distance: vwap_dist,
            volume_zscore: vol_z,
            vol_regime,
            has_anomaly,
        });
    }

    frames
}

/// Anomaly check that also folds in orderbook state, used by the assembler
/// once per tick (spread/depth inputs live outside the candle series).
pub fn has_market_anomaly(spread_pct: f64, depth_imbalance: f64, wick_ratio: f64) -> bool {
    spread_pct.abs() > ANOMALY_SPREAD_PCT
        || wick_ratio > ANOMALY_WICK_RATIO
        || depth_imbalance.abs() > ANOMALY_DEPTH_IMBALANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, base: f64) -> Candle {
        Candle {
            open_time: i as i64 * 60_000,
            close_time: i as i64 * 60_000 + 59_999,
            open: base,
            high: base + 1.0,
            low: base - 1.0,
            close: base + 0.2,
            volume: 100.0 + (i % 5) as f64,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    fn sample_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| candle(i, 100.0 + (i as f64 * 0.3).sin() * 5.0))
            .collect()
    }

    #[test]
    fn insufficient_history_yields_no_frames() {
        let candles = sample_candles(10);
        assert!(build_features(&candles).is_empty());
    }

    #[test]
    fn sufficient_history_yields_frames_with_finite_values() {
        let candles = sample_candles(120);
        let frames = build_features(&candles);
        assert!(!frames.is_empty());
        for f in &frames {
            assert!(f.ema_20.is_finite());
            assert!(f.ema_50.is_finite());
            assert!(f.atr.is_finite());
            assert!(f.adx.is_finite());
            assert!(f.rsi.is_finite());
            assert!(f.bb_width.is_finite());
            assert!(f.vwap.is_finite());
            assert!(f.volume_zscore.is_finite());
            assert!(matches!(f.vol_regime, -1 | 0 | 1));
        }
    }

    #[test]
    fn high_atr_percent_marks_high_vol_regime() {
        let mut candles = sample_candles(120);
        for c in candles.iter_mut().rev().take(20) {
            let base = c.close;
            c.high = base * 1.10;
            c.low = base * 0.90;
        }
        let frames = build_features(&candles);
        let last = frames.last().unwrap();
        assert_eq!(last.vol_regime, 1);
    }

    #[test]
    fn market_anomaly_flags_wide_spread() {
        assert!(has_market_anomaly(0.03, 0.0, 1.0));
        assert!(!has_market_anomaly(0.001, 0.1, 1.0));
    }

    #[test]
    fn market_anomaly_flags_extreme_depth_imbalance() {
        assert!(has_market_anomaly(0.001, 0.95, 1.0));
    }
}
