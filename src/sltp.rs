// =============================================================================
// SL/TP Engine — stop-loss / take-profit distance and ratchet-only trailing
// =============================================================================
//
// Distances are the greater of an ATR multiple and a percent-of-entry floor,
// clamped to a hard minimum so a quiet pair never gets a nonsensically tight
// exit. Two attachment modes:
//   - ExchangeAttached: pushed via `set_trading_stop`, the venue enforces it.
//   - Virtual: tracked locally, a market reduce-only order fires on breach.
// Trailing only ever tightens in the position's favor — it never relaxes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SltpMode {
    ExchangeAttached,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SltpConfig {
    pub sl_atr_multiplier: f64,
    pub tp_atr_multiplier: f64,
    pub sl_percent_fallback: f64,
    pub tp_percent_fallback: f64,
    pub min_sl_distance: f64,
    pub min_tp_distance: f64,
    pub trailing_multiplier: f64,
    pub mode: SltpMode,
}

impl Default for SltpConfig {
    fn default() -> Self {
        Self {
            sl_atr_multiplier: 1.5,
            tp_atr_multiplier: 3.0,
            sl_percent_fallback: 0.005,
            tp_percent_fallback: 0.01,
            min_sl_distance: 0.0,
            min_tp_distance: 0.0,
            trailing_multiplier: 1.0,
            mode: SltpMode::Virtual,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SltpLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Compute the SL/TP distances and absolute levels for a new position.
pub fn compute_levels(config: &SltpConfig, side: Side, entry_price: f64, atr: f64) -> SltpLevels {
    let sl_distance = (config.sl_atr_multiplier * atr)
        .max(config.sl_percent_fallback * entry_price)
        .max(config.min_sl_distance);
    let tp_distance = (config.tp_atr_multiplier * atr)
        .max(config.tp_percent_fallback * entry_price)
        .max(config.min_tp_distance);

    let (stop_loss, take_profit) = match side {
        Side::Long => (entry_price - sl_distance, entry_price + tp_distance),
        Side::Short => (entry_price + sl_distance, entry_price - tp_distance),
    };

    SltpLevels { stop_loss, take_profit }
}

/// Ratchet-only trailing stop state for one open position.
#[derive(Debug, Clone)]
pub struct TrailingState {
    pub side: Side,
    pub current_stop: f64,
    pub favorable_extreme: f64,
}

impl TrailingState {
    pub fn new(side: Side, entry_price: f64, initial_stop: f64) -> Self {
        Self {
            side,
            current_stop: initial_stop,
            favorable_extreme: entry_price,
        }
    }

    /// Advance the trailing stop when price has moved `trailing_multiplier ·
    /// atr` beyond the last favorable extreme. Never moves the stop
    /// adversely — a move against the position updates nothing here; the
    /// existing stop is left untouched for the breach check to catch.
    pub fn update(&mut self, config: &SltpConfig, current_price: f64, atr: f64) {
        let step = config.trailing_multiplier * atr;
        if step <= 0.0 {
            return;
        }

        match self.side {
            Side::Long => {
                if current_price > self.favorable_extreme {
                    let advance = current_price - self.favorable_extreme;
                    if advance >= step {
                        self.favorable_extreme = current_price;
                        let candidate = current_price - step;
                        if candidate > self.current_stop {
                            debug!(old = self.current_stop, new = candidate, "trailing stop advanced (long)");
                            self.current_stop = candidate;
                        }
                    }
                }
            }
            Side::Short => {
                if current_price < self.favorable_extreme {
                    let advance = self.favorable_extreme - current_price;
                    if advance >= step {
                        self.favorable_extreme = current_price;
                        let candidate = current_price + step;
                        if candidate < self.current_stop {
                            debug!(old = self.current_stop, new = candidate, "trailing stop advanced (short)");
                            self.current_stop = candidate;
                        }
                    }
                }
            }
        }
    }

    pub fn is_breached(&self, current_price: f64) -> bool {
        match self.side {
            Side::Long => current_price <= self.current_stop,
            Side::Short => current_price >= self.current_stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_levels_uses_atr_when_it_dominates() {
        let config = SltpConfig::default();
        let levels = compute_levels(&config, Side::Long, 50_000.0, 500.0);
        // sl_atr: 1.5*500=750 vs pct fallback 0.005*50000=250 -> atr wins
        assert!((levels.stop_loss - 49_250.0).abs() < 1e-6);
    }

    #[test]
    fn compute_levels_uses_percent_floor_when_atr_is_tiny() {
        let config = SltpConfig::default();
        let levels = compute_levels(&config, Side::Long, 50_000.0, 1.0);
        // sl_atr: 1.5 vs pct fallback 250 -> percent wins
        assert!((levels.stop_loss - 49_750.0).abs() < 1e-6);
    }

    #[test]
    fn short_levels_invert_direction() {
        let config = SltpConfig::default();
        let levels = compute_levels(&config, Side::Short, 50_000.0, 500.0);
        assert!(levels.stop_loss > 50_000.0);
        assert!(levels.take_profit < 50_000.0);
    }

    #[test]
    fn trailing_stop_advances_only_in_favor_for_long() {
        let config = SltpConfig { trailing_multiplier: 1.0, ..SltpConfig::default() };
        let mut trail = TrailingState::new(Side::Long, 50_000.0, 49_250.0);
        trail.update(&config, 51_000.0, 500.0);
        assert!(trail.current_stop > 49_250.0);

        let advanced = trail.current_stop;
        // Adverse move must not relax the stop.
        trail.update(&config, 50_500.0, 500.0);
        assert_eq!(trail.current_stop, advanced);
    }

    #[test]
    fn trailing_stop_breach_detection() {
        let mut trail = TrailingState::new(Side::Long, 50_000.0, 49_250.0);
        assert!(!trail.is_breached(49_500.0));
        assert!(trail.is_breached(49_000.0));

        let config = SltpConfig::default();
        trail.update(&config, 52_000.0, 500.0);
        assert!(!trail.is_breached(trail.current_stop + 1.0));
    }
}
