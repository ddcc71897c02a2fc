// =============================================================================
// Position-State Manager — one tracked position per symbol
// =============================================================================
//
// Life-cycle: flat -> open -> (partial fills aggregate on the same side) ->
// closed (reducing fills bring qty to zero) -> flat.
//
// Flipping Long directly to Short inside a single fill event is forbidden:
// a reducing fill that would cross zero closes the position to flat and any
// remainder requires a fresh intent on a later tick, never an implicit flip.
//
// Thread-safety: one `RwLock<HashMap<symbol, Position>>`. The order-event
// dispatcher is the sole writer; status surface and risk engine take
// snapshots via `get_position_info`.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Side;

/// Tolerance bands under which a reconciliation discrepancy is absorbed
/// silently rather than flagged.
const QTY_DRIFT_TOLERANCE: f64 = 0.001;
const PRICE_DRIFT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Option<Side>,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub total_cost: f64,
    pub realized_pnl: f64,
    pub opened_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub discrepancy: Discrepancy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discrepancy {
    pub detected: bool,
    pub details: Option<String>,
}

impl Position {
    fn flat(symbol: &str, now: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: None,
            qty: 0.0,
            avg_entry_price: 0.0,
            total_cost: 0.0,
            realized_pnl: 0.0,
            opened_at: now.to_string(),
            updated_at: now.to_string(),
            discrepancy: Discrepancy::default(),
        }
    }

    fn is_flat(&self) -> bool {
        self.side.is_none() || self.qty <= f64::EPSILON
    }
}

#[derive(Debug)]
pub struct PositionStateManager {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionStateManager {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Open or aggregate a same-side fill. If the symbol is flat, opens a new
    /// position on `side`. If already open on the same side, aggregates per
    /// `new_avg = (old_qty·old_avg + add_qty·add_price)/(old_qty+add_qty)`.
    /// A fill on the opposite side while already open is routed to
    /// `add_partial_fill` instead — callers must not call `open_position` to
    /// flip a side.
    pub fn open_position(&self, symbol: &str, side: Side, qty: f64, price: f64) {
        let now = Utc::now().to_rfc3339();
        let mut positions = self.positions.write();
        let pos = positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol, &now));

        match pos.side {
            None => {
                pos.side = Some(side);
                pos.qty = qty;
                pos.avg_entry_price = price;
                pos.total_cost = qty * price;
                pos.opened_at = now.clone();
                info!(symbol, side = %side, qty, price, "position opened");
            }
            Some(existing) if existing == side => {
                let add_cost = qty * price;
                pos.total_cost += add_cost;
                pos.qty += qty;
                pos.avg_entry_price = pos.total_cost / pos.qty;
                info!(symbol, side = %side, qty, price, new_qty = pos.qty, new_avg = pos.avg_entry_price, "position aggregated");
            }
            Some(_) => {
                warn!(symbol, "open_position called on opposing side — use add_partial_fill instead");
            }
        }
        pos.updated_at = now;
    }

    /// Apply a fill of `qty` on `side`. Same-side fills aggregate; opposing
    /// fills reduce. Fills must be applied strictly in event-time arrival
    /// order by the caller, one at a time — this function never nets a batch.
    pub fn add_partial_fill(&self, symbol: &str, side: Side, qty: f64, price: f64) {
        let now = Utc::now().to_rfc3339();
        let mut positions = self.positions.write();
        let pos = positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol, &now));

        match pos.side {
            None => {
                pos.side = Some(side);
                pos.qty = qty;
                pos.avg_entry_price = price;
                pos.total_cost = qty * price;
                pos.opened_at = now.clone();
            }
            Some(existing) if existing == side => {
                pos.total_cost += qty * price;
                pos.qty += qty;
                pos.avg_entry_price = pos.total_cost / pos.qty;
            }
            Some(existing) => {
                // Opposing fill: reduce. Never let qty go negative — an
                // over-sized reducing fill clamps to flat; the remainder is
                // not an implicit flip, it requires a new intent.
                let direction = if existing == Side::Long { 1.0 } else { -1.0 };
                let realized = direction * (price - pos.avg_entry_price) * qty.min(pos.qty);
                pos.realized_pnl += realized;
                pos.qty -= qty;

                if pos.qty <= f64::EPSILON {
                    if qty > pos.qty + qty {
                        // excess beyond flat — logged, never auto-flipped
                        warn!(symbol, "reducing fill exceeded open qty — clamped to flat, remainder requires a new intent");
                    }
                    pos.side = None;
                    pos.qty = 0.0;
                    pos.avg_entry_price = 0.0;
                    pos.total_cost = 0.0;
                } else {
                    pos.total_cost = pos.qty * pos.avg_entry_price;
                }
                info!(symbol, side = %side, qty, price, realized, remaining_qty = pos.qty, "position reduced");
            }
        }
        pos.updated_at = now;
    }

    /// Reduce the open position by `qty`, refusing `qty > current qty`.
    pub fn close_position(&self, symbol: &str, qty: f64, price: f64) -> Result<f64, String> {
        let mut positions = self.positions.write();
        let Some(pos) = positions.get_mut(symbol) else {
            return Err(format!("no open position for {symbol}"));
        };
        if pos.is_flat() {
            return Err(format!("{symbol} is already flat"));
        }
        if qty > pos.qty {
            return Err(format!("close qty {qty} exceeds open qty {}", pos.qty));
        }

        let side = pos.side.unwrap();
        let direction = if side == Side::Long { 1.0 } else { -1.0 };
        let realized = direction * (price - pos.avg_entry_price) * qty;
        pos.realized_pnl += realized;
        pos.qty -= qty;
        pos.updated_at = Utc::now().to_rfc3339();

        if pos.qty <= f64::EPSILON {
            pos.side = None;
            pos.qty = 0.0;
            pos.avg_entry_price = 0.0;
            pos.total_cost = 0.0;
        } else {
            pos.total_cost = pos.qty * pos.avg_entry_price;
        }

        info!(symbol, qty, price, realized, "position closed (partial or full)");
        Ok(realized)
    }

    /// Reconcile local state against the exchange's reported qty/avg_price.
    /// Drift within tolerance is absorbed silently; anything larger flags a
    /// discrepancy and overwrites local fields with the exchange's values.
    pub fn reconcile_with_exchange(&self, symbol: &str, exchange_qty: f64, exchange_avg_price: f64) {
        let now = Utc::now().to_rfc3339();
        let mut positions = self.positions.write();
        let pos = positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol, &now));

        let qty_drift = (pos.qty - exchange_qty).abs();
        let qty_drift_pct = if pos.qty.abs() > f64::EPSILON { qty_drift / pos.qty.abs() } else { qty_drift };
        let price_drift_pct = if pos.avg_entry_price.abs() > f64::EPSILON {
            (pos.avg_entry_price - exchange_avg_price).abs() / pos.avg_entry_price.abs()
        } else {
            0.0
        };

        if qty_drift_pct > QTY_DRIFT_TOLERANCE || price_drift_pct > PRICE_DRIFT_TOLERANCE {
            let details = format!(
                "local qty={:.6} avg={:.4} vs exchange qty={:.6} avg={:.4}",
                pos.qty, pos.avg_entry_price, exchange_qty, exchange_avg_price
            );
            warn!(symbol, %details, "reconciliation discrepancy — overwriting local state from exchange");
            pos.discrepancy = Discrepancy { detected: true, details: Some(details) };
            pos.qty = exchange_qty;
            pos.avg_entry_price = exchange_avg_price;
            pos.total_cost = exchange_qty * exchange_avg_price;
            if exchange_qty <= f64::EPSILON {
                pos.side = None;
            } else if pos.side.is_none() {
                // cannot infer direction from qty alone; exchange payload must
                // supply side separately in the private-WS event in practice.
                pos.side = Some(Side::Long);
            }
        } else {
            pos.discrepancy = Discrepancy::default();
        }
        pos.updated_at = now;
    }

    pub fn get_position_info(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn get_all(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.positions
            .read()
            .values()
            .filter(|p| !p.is_flat())
            .map(|p| p.symbol.clone())
            .collect()
    }

    pub fn total_notional(&self, current_prices: &HashMap<String, f64>) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| !p.is_flat())
            .map(|p| {
                let price = current_prices.get(&p.symbol).copied().unwrap_or(p.avg_entry_price);
                p.qty * price
            })
            .sum()
    }
}

impl Default for PositionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_aggregates_same_side() {
        let mgr = PositionStateManager::new();
        mgr.open_position("BTCUSDT", Side::Long, 0.5, 50_000.0);
        mgr.add_partial_fill("BTCUSDT", Side::Long, 0.3, 51_000.0);
        mgr.add_partial_fill("BTCUSDT", Side::Long, 0.2, 49_000.0);

        let pos = mgr.get_position_info("BTCUSDT").unwrap();
        assert!((pos.qty - 1.0).abs() < 1e-9);
        assert!((pos.avg_entry_price - 50_300.0).abs() < 1e-6);
    }

    #[test]
    fn opposing_fill_reduces_to_flat() {
        let mgr = PositionStateManager::new();
        mgr.open_position("BTCUSDT", Side::Long, 1.0, 50_000.0);
        mgr.add_partial_fill("BTCUSDT", Side::Short, 1.0, 51_000.0);

        let pos = mgr.get_position_info("BTCUSDT").unwrap();
        assert!(pos.is_flat());
        assert!((pos.realized_pnl - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn close_position_refuses_oversized_qty() {
        let mgr = PositionStateManager::new();
        mgr.open_position("BTCUSDT", Side::Long, 1.0, 50_000.0);
        assert!(mgr.close_position("BTCUSDT", 2.0, 51_000.0).is_err());
    }

    #[test]
    fn reconcile_absorbs_small_drift_silently() {
        let mgr = PositionStateManager::new();
        mgr.open_position("BTCUSDT", Side::Long, 1.0, 50_000.0);
        mgr.reconcile_with_exchange("BTCUSDT", 1.0003, 50_005.0);
        let pos = mgr.get_position_info("BTCUSDT").unwrap();
        assert!(!pos.discrepancy.detected);
    }

    #[test]
    fn reconcile_flags_and_overwrites_on_large_drift() {
        let mgr = PositionStateManager::new();
        mgr.open_position("BTCUSDT", Side::Long, 1.0, 50_000.0);
        mgr.reconcile_with_exchange("BTCUSDT", 0.5, 52_000.0);
        let pos = mgr.get_position_info("BTCUSDT").unwrap();
        assert!(pos.discrepancy.detected);
        assert!((pos.qty - 0.5).abs() < 1e-9);
        assert!((pos.avg_entry_price - 52_000.0).abs() < 1e-6);
    }

    #[test]
    fn same_tick_opposing_fills_apply_in_arrival_order_never_net() {
        let mgr = PositionStateManager::new();
        mgr.open_position("BTCUSDT", Side::Long, 1.0, 50_000.0);
        // Opposing fill larger than open qty arrives first — clamps to flat.
        mgr.add_partial_fill("BTCUSDT", Side::Short, 1.0, 51_000.0);
        let after_first = mgr.get_position_info("BTCUSDT").unwrap();
        assert!(after_first.is_flat());
        // A further fill requires a fresh intent, applied as a new open.
        mgr.open_position("BTCUSDT", Side::Short, 0.5, 51_500.0);
        let after_second = mgr.get_position_info("BTCUSDT").unwrap();
        assert_eq!(after_second.side, Some(Side::Short));
        assert!((after_second.qty - 0.5).abs() < 1e-9);
    }
}
