// =============================================================================
// Strategies — pluggable signal producers
// =============================================================================

pub mod breakout;
pub mod mean_reversion;
pub mod trend_pullback;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::features::FeatureFrame;
use crate::market_data::OrderFlowSnapshot;
use crate::regime::Regime;
use crate::types::Direction;

pub use breakout::BreakoutStrategy;
pub use mean_reversion::MeanReversionStrategy;
pub use trend_pullback::TrendPullbackStrategy;

/// A candidate trade raised by a strategy, consumed by the meta-layer (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub reasons: Vec<String>,
    pub values: HashMap<String, f64>,
    pub timestamp: i64,
}

/// Normalizes a signal produced by a legacy/third-party strategy that did not
/// populate `reasons`/`values` (§4.D).
pub fn normalize_legacy_signal(mut signal: Signal) -> Signal {
    if signal.reasons.is_empty() {
        signal.reasons = vec!["legacy_signal".to_string()];
    }
    signal
}

/// Capability contract every strategy must satisfy. `generate_signal` also
/// receives the currently detected regime so regime-restricted strategies
/// (e.g. MeanReversion) can gate themselves without reaching into shared
/// state.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn min_candles(&self) -> usize;
    fn confidence_threshold(&self) -> f64;
    fn generate_signal(
        &self,
        frames: &[FeatureFrame],
        orderflow: &OrderFlowSnapshot,
        regime: Regime,
    ) -> Option<Signal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_missing_reasons() {
        let signal = Signal {
            strategy_id: "x".into(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            confidence: 0.5,
            entry_price: 100.0,
            stop_loss: 99.0,
            take_profit: None,
            reasons: vec![],
            values: HashMap::new(),
            timestamp: 0,
        };
        let normalized = normalize_legacy_signal(signal);
        assert_eq!(normalized.reasons, vec!["legacy_signal".to_string()]);
    }

    #[test]
    fn normalize_preserves_existing_reasons() {
        let signal = Signal {
            strategy_id: "x".into(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            confidence: 0.5,
            entry_price: 100.0,
            stop_loss: 99.0,
            take_profit: None,
            reasons: vec!["trend_adx_ok".to_string()],
            values: HashMap::new(),
            timestamp: 0,
        };
        let normalized = normalize_legacy_signal(signal);
        assert_eq!(normalized.reasons, vec!["trend_adx_ok".to_string()]);
    }
}
