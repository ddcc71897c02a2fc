// =============================================================================
// Paper Simulator — deterministic fill model, alternative to the Order Engine
// =============================================================================
//
// Market orders fill at the best-side price adjusted by the slippage model.
// Limit orders fill only when the bar's range crosses the limit price, at
// the better of the limit price and the bar's VWAP approximation
// ((high+low+close)/3). Every fill deducts a commission so paper P&L tracks
// what a live fill would actually cost. State and events flow through the
// same Position-State Manager the live path uses.

use tracing::info;

use crate::market_data::Candle;
use crate::slippage::SlippageModel;
use crate::types::{OrderType, Side};

#[derive(Debug, Clone)]
pub struct PaperFill {
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
}

pub struct PaperSimulator {
    pub slippage: SlippageModel,
    pub maker_fee: f64,
    pub taker_fee: f64,
}

impl PaperSimulator {
    pub fn new(slippage: SlippageModel, maker_fee: f64, taker_fee: f64) -> Self {
        Self { slippage, maker_fee, taker_fee }
    }

    /// Attempt to fill `qty` of `side` against `bar`. Market orders always
    /// fill; limit orders fill only if the bar's range crosses `limit_price`.
    pub fn try_fill(
        &self,
        order_type: OrderType,
        side: Side,
        qty: f64,
        limit_price: Option<f64>,
        bar: &Candle,
        atr: Option<f64>,
        atr_sma: Option<f64>,
    ) -> Option<PaperFill> {
        let raw_price = match order_type {
            OrderType::Market => match side {
                Side::Long => bar.close,
                Side::Short => bar.close,
            },
            OrderType::Limit => {
                let limit = limit_price?;
                if !bar_crosses(bar, side, limit) {
                    return None;
                }
                let vwap = (bar.high + bar.low + bar.close) / 3.0;
                match side {
                    // buying: the better fill is the lower of limit/vwap
                    Side::Long => limit.min(vwap),
                    // selling: the better fill is the higher of limit/vwap
                    Side::Short => limit.max(vwap),
                }
            }
        };

        let slip_amount = self.slippage.slippage_amount(qty, raw_price, atr, atr_sma, Some(bar.volume), None);
        let fill_price = match order_type {
            OrderType::Market => self.slippage.apply_to_price(side, raw_price, slip_amount, qty),
            OrderType::Limit => raw_price, // limit fills never slip past the limit
        };

        let fee_rate = match order_type {
            OrderType::Market => self.taker_fee,
            OrderType::Limit => self.maker_fee,
        };
        let commission = fill_price * qty * fee_rate;

        info!(?order_type, %side, fill_price, qty, commission, "paper fill");
        Some(PaperFill { price: fill_price, qty, commission })
    }
}

fn bar_crosses(bar: &Candle, side: Side, limit_price: f64) -> bool {
    match side {
        // buy-limit fills when price trades down to or through the limit
        Side::Long => bar.low <= limit_price,
        // sell-limit fills when price trades up to or through the limit
        Side::Short => bar.high >= limit_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slippage::SlippagePreset;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    #[test]
    fn market_order_always_fills_at_close() {
        let sim = PaperSimulator::new(SlippageModel::from_preset(SlippagePreset::None), 0.0002, 0.00055);
        let fill = sim
            .try_fill(OrderType::Market, Side::Long, 1.0, None, &bar(100.0, 101.0, 99.0, 100.5, 1000.0), None, None)
            .unwrap();
        assert_eq!(fill.price, 100.5);
        assert!(fill.commission > 0.0);
    }

    #[test]
    fn limit_buy_does_not_fill_above_range() {
        let sim = PaperSimulator::new(SlippageModel::from_preset(SlippagePreset::None), 0.0002, 0.00055);
        let fill = sim.try_fill(OrderType::Limit, Side::Long, 1.0, Some(90.0), &bar(100.0, 101.0, 99.0, 100.5, 1000.0), None, None);
        assert!(fill.is_none());
    }

    #[test]
    fn limit_buy_fills_when_range_crosses() {
        let sim = PaperSimulator::new(SlippageModel::from_preset(SlippagePreset::None), 0.0002, 0.00055);
        let fill = sim
            .try_fill(OrderType::Limit, Side::Long, 1.0, Some(99.5), &bar(100.0, 101.0, 99.0, 100.5, 1000.0), None, None)
            .unwrap();
        assert!(fill.price <= 99.5);
    }

    #[test]
    fn market_order_applies_slippage_against_trader() {
        let sim = PaperSimulator::new(SlippageModel::from_preset(SlippagePreset::Realistic), 0.0002, 0.00055);
        let candle = bar(100.0, 101.0, 99.0, 100.0, 1000.0);
        let buy = sim.try_fill(OrderType::Market, Side::Long, 1.0, None, &candle, Some(2.0), Some(1.0)).unwrap();
        let sell = sim.try_fill(OrderType::Market, Side::Short, 1.0, None, &candle, Some(2.0), Some(1.0)).unwrap();
        assert!(buy.price > 100.0);
        assert!(sell.price < 100.0);
    }
}
