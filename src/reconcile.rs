// =============================================================================
// Reconciliation — compare internal position state against the exchange
// =============================================================================
//
// Unlike the teacher's conservative log-only policy, a drift beyond
// Position-State Manager's tolerance bands is auto-corrected: local state is
// overwritten from the exchange and the discrepancy is flagged for the
// status API, rather than left to a human operator to notice and fix later.

use tracing::{info, warn};

use crate::app::App;
use crate::exchange::bybit::BybitClient;

pub async fn run_reconciliation(app: &App, client: &BybitClient) {
    let symbol = app.config.read().trading.symbol.clone();

    let exchange_positions = match client.positions(Some(&symbol)).await {
        Ok(p) => p,
        Err(e) => {
            warn!(symbol, error = %e, "reconciliation: failed to fetch exchange positions");
            return;
        }
    };

    // Bybit's /v5/position/list omits flat positions entirely rather than
    // returning a zero-qty row, so an absent row means the exchange is flat.
    let (exchange_qty, exchange_avg) = match exchange_positions.into_iter().find(|p| p.symbol == symbol) {
        Some(exchange_pos) => (
            rust_decimal::prelude::ToPrimitive::to_f64(&exchange_pos.qty).unwrap_or(0.0),
            rust_decimal::prelude::ToPrimitive::to_f64(&exchange_pos.avg_price).unwrap_or(0.0),
        ),
        None => {
            info!(symbol, "reconciliation: no exchange row for symbol, treating as flat");
            (0.0, 0.0)
        }
    };

    app.positions.reconcile_with_exchange(&symbol, exchange_qty, exchange_avg);

    if let Some(pos) = app.positions.get_position_info(&symbol) {
        if pos.discrepancy.detected {
            warn!(
                symbol,
                details = ?pos.discrepancy.details,
                "reconciliation: discrepancy detected, local state overwritten from exchange"
            );
        } else {
            info!(symbol, "reconciliation: local state within tolerance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_state::PositionStateManager;
    use crate::types::Side;

    #[test]
    fn manager_reconcile_flags_large_drift_directly() {
        let manager = PositionStateManager::new();
        manager.open_position("BTCUSDT", Side::Long, 1.0, 100.0);
        manager.reconcile_with_exchange("BTCUSDT", 1.5, 100.0);
        let pos = manager.get_position_info("BTCUSDT").unwrap();
        assert!(pos.discrepancy.detected);
        assert_eq!(pos.qty, 1.5);
    }
}
