// =============================================================================
// Instrument metadata — tick/qty rounding rules for a traded symbol
// =============================================================================
//
// Loaded once at startup from the exchange's instruments-info endpoint and
// treated as immutable thereafter. Every quantity and price that reaches the
// Order Engine must be rounded through here; ad-hoc rounding constants are a
// defect (see Risk Engine design notes).

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl Instrument {
    /// Built-in fallback table used when the venue's instruments-info call
    /// returns an empty list (§4.A). Covers the handful of linear perpetuals
    /// this engine watches by default.
    pub fn builtin_defaults() -> Vec<Instrument> {
        let dec = |s: &str| Decimal::from_str(s).unwrap();
        vec![
            Instrument {
                symbol: "BTCUSDT".into(),
                tick_size: dec("0.1"),
                qty_step: dec("0.001"),
                min_qty: dec("0.001"),
                min_notional: dec("5"),
            },
            Instrument {
                symbol: "ETHUSDT".into(),
                tick_size: dec("0.01"),
                qty_step: dec("0.01"),
                min_qty: dec("0.01"),
                min_notional: dec("5"),
            },
            Instrument {
                symbol: "SOLUSDT".into(),
                tick_size: dec("0.001"),
                qty_step: dec("0.1"),
                min_qty: dec("0.1"),
                min_notional: dec("5"),
            },
        ]
    }

    /// Round a price down to the nearest `tick_size`.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_to_step(price, self.tick_size)
    }

    /// Round a quantity down to the nearest `qty_step`.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        round_to_step(qty, self.qty_step)
    }
}

/// Round `value` down to the nearest multiple of `step` (never rounds up —
/// rounding a buy quantity up could push notional past a risk limit that was
/// already validated against the unrounded value).
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn rounds_down_to_step() {
        assert_eq!(round_to_step(dec("1.2345"), dec("0.01")), dec("1.23"));
        assert_eq!(round_to_step(dec("1.239"), dec("0.01")), dec("1.23"));
    }

    #[test]
    fn zero_step_is_identity() {
        assert_eq!(round_to_step(dec("1.2345"), dec("0")), dec("1.2345"));
    }

    #[test]
    fn instrument_rounds_qty_and_price() {
        let inst = Instrument {
            symbol: "BTCUSDT".into(),
            tick_size: dec("0.1"),
            qty_step: dec("0.001"),
            min_qty: dec("0.001"),
            min_notional: dec("5"),
        };
        assert_eq!(inst.round_price(dec("50123.47")), dec("50123.4"));
        assert_eq!(inst.round_qty(dec("0.0238")), dec("0.023"));
    }

    #[test]
    fn builtin_defaults_nonempty() {
        assert!(!Instrument::builtin_defaults().is_empty());
    }
}
