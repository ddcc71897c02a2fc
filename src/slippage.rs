// =============================================================================
// Slippage Model — price impact applied to simulated and logged fills
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlippagePreset {
    None,
    Minimal,
    Realistic,
    High,
}

#[derive(Debug, Clone)]
pub struct SlippageModel {
    pub base_bps: f64,
    pub volatility_factor_enabled: bool,
    pub volume_factor_enabled: bool,
}

impl SlippageModel {
    pub fn from_preset(preset: SlippagePreset) -> Self {
        match preset {
            SlippagePreset::None => Self { base_bps: 0.0, volatility_factor_enabled: false, volume_factor_enabled: false },
            SlippagePreset::Minimal => Self { base_bps: 1.0, volatility_factor_enabled: false, volume_factor_enabled: false },
            SlippagePreset::Realistic => Self { base_bps: 2.0, volatility_factor_enabled: true, volume_factor_enabled: true },
            SlippagePreset::High => Self { base_bps: 5.0, volatility_factor_enabled: true, volume_factor_enabled: true },
        }
    }

    /// Dollar amount of slippage for a fill of `qty` at `price`. `atr`/`atr_sma`
    /// widen the estimate in elevated volatility; `volume`/`avg_volume` widen it
    /// in thin liquidity. Either pair may be omitted when unavailable.
    pub fn slippage_amount(
        &self,
        qty: f64,
        price: f64,
        atr: Option<f64>,
        atr_sma: Option<f64>,
        volume: Option<f64>,
        avg_volume: Option<f64>,
    ) -> f64 {
        let notional = qty * price;

        let vol_mult = if self.volatility_factor_enabled {
            match (atr, atr_sma) {
                (Some(atr), Some(atr_sma)) if atr_sma > 0.0 => {
                    (1.0 + (atr - atr_sma) / atr_sma).max(1.0)
                }
                _ => 1.0,
            }
        } else {
            1.0
        };

        let volume_mult = if self.volume_factor_enabled {
            match (volume, avg_volume) {
                (Some(volume), Some(avg_volume)) if avg_volume > 0.0 => {
                    (1.0 + (avg_volume - volume) / avg_volume).max(1.0)
                }
                _ => 1.0,
            }
        } else {
            1.0
        };

        notional * (self.base_bps * vol_mult * volume_mult) / 10_000.0
    }

    /// Apply slippage against the trader: buys fill higher, sells fill lower.
    pub fn apply_to_price(&self, side: Side, price: f64, slippage_amount: f64, qty: f64) -> f64 {
        if qty <= 0.0 {
            return price;
        }
        let per_unit = slippage_amount / qty;
        match side {
            Side::Long => price + per_unit,
            Side::Short => price - per_unit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_preset_yields_zero_adjustment() {
        let model = SlippageModel::from_preset(SlippagePreset::None);
        let amount = model.slippage_amount(1.0, 50_000.0, Some(2.0), Some(1.0), Some(100.0), Some(200.0));
        assert_eq!(amount, 0.0);
    }

    #[test]
    fn other_presets_yield_positive_adjustment() {
        for preset in [SlippagePreset::Minimal, SlippagePreset::Realistic, SlippagePreset::High] {
            let model = SlippageModel::from_preset(preset);
            let amount = model.slippage_amount(1.0, 50_000.0, Some(2.0), Some(1.0), Some(100.0), Some(200.0));
            assert!(amount > 0.0, "{preset:?} should be positive");
        }
    }

    #[test]
    fn volatility_and_volume_widen_realistic_preset() {
        let model = SlippageModel::from_preset(SlippagePreset::Realistic);
        let calm = model.slippage_amount(1.0, 50_000.0, Some(1.0), Some(1.0), Some(200.0), Some(200.0));
        let stressed = model.slippage_amount(1.0, 50_000.0, Some(3.0), Some(1.0), Some(50.0), Some(200.0));
        assert!(stressed > calm);
    }

    #[test]
    fn buys_move_price_up_sells_move_price_down() {
        let model = SlippageModel::from_preset(SlippagePreset::Minimal);
        let amount = model.slippage_amount(1.0, 50_000.0, None, None, None, None);
        let buy_price = model.apply_to_price(Side::Long, 50_000.0, amount, 1.0);
        let sell_price = model.apply_to_price(Side::Short, 50_000.0, amount, 1.0);
        assert!(buy_price > 50_000.0);
        assert!(sell_price < 50_000.0);
    }
}
