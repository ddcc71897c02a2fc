// =============================================================================
// Rolling VWAP (Volume-Weighted Average Price)
// =============================================================================

use crate::market_data::Candle;

/// Rolling VWAP over the trailing `period` candles, computed from typical
/// price `(high+low+close)/3` weighted by volume. Returns one value per input
/// candle once `period` candles have accumulated; earlier entries are `None`.
pub fn calculate_vwap(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    if period == 0 || candles.is_empty() {
        return vec![None; candles.len()];
    }

    let mut out = Vec::with_capacity(candles.len());
    for i in 0..candles.len() {
        if i + 1 < period {
            out.push(None);
            continue;
        }
        let window = &candles[i + 1 - period..=i];
        let mut pv_sum = 0.0;
        let mut vol_sum = 0.0;
        for c in window {
            let typical = (c.high + c.low + c.close) / 3.0;
            pv_sum += typical * c.volume;
            vol_sum += c.volume;
        }
        if vol_sum > 0.0 && pv_sum.is_finite() {
            out.push(Some(pv_sum / vol_sum));
        } else {
            out.push(None);
        }
    }
    out
}

/// `(close - vwap) / vwap`, the signed distance strategies gate on.
pub fn vwap_distance(close: f64, vwap: f64) -> Option<f64> {
    if vwap.abs() < f64::EPSILON || !vwap.is_finite() {
        return None;
    }
    Some((close - vwap) / vwap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(h: f64, l: f64, c: f64, v: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: c,
            high: h,
            low: l,
            close: c,
            volume: v,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    #[test]
    fn insufficient_data_is_none() {
        let candles = vec![candle(10.0, 9.0, 9.5, 100.0)];
        let out = calculate_vwap(&candles, 3);
        assert_eq!(out, vec![None]);
    }

    #[test]
    fn flat_volume_equal_typical_price() {
        let candles = vec![
            candle(10.0, 10.0, 10.0, 100.0),
            candle(10.0, 10.0, 10.0, 100.0),
            candle(10.0, 10.0, 10.0, 100.0),
        ];
        let out = calculate_vwap(&candles, 3);
        assert!((out[2].unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_volume_window_is_none() {
        let candles = vec![candle(10.0, 9.0, 9.5, 0.0), candle(10.0, 9.0, 9.5, 0.0)];
        let out = calculate_vwap(&candles, 2);
        assert_eq!(out[1], None);
    }

    #[test]
    fn distance_sign_matches_direction() {
        assert!(vwap_distance(101.0, 100.0).unwrap() > 0.0);
        assert!(vwap_distance(99.0, 100.0).unwrap() < 0.0);
        assert_eq!(vwap_distance(100.0, 0.0), None);
    }
}
