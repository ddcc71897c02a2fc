// =============================================================================
// Risk Engine — position sizing plus circuit breakers protecting capital
// =============================================================================
//
// Circuit breakers:
//   1. Daily Loss        — trips when cumulative daily PnL loss exceeds a
//                          percentage of starting capital.
//   2. Consecutive Losses — trips after N consecutive losing trades.
//   3. Max Drawdown       — trips when intra-day drawdown from peak equity
//                          exceeds the threshold.
//   4. Trade Limit        — trips when daily trade count reaches the cap.
//
// `size_position` is the separate pre-trade sizing/limits gate (§4.F): given
// an accepted Signal and the current AccountState it either produces a sized
// order or a list of coded rejections.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::Rejection;
use crate::instrument::Instrument;

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub risk_percent_per_trade: f64,
    pub min_stop_distance_pct: f64,
    pub max_daily_loss_percent: f64,
    pub max_total_open_positions: u32,
    pub max_notional_usd: f64,
    pub max_open_exposure_usd: f64,
    pub max_leverage: f64,
    /// Tolerance band applied to the recommended qty before rejecting a
    /// caller-supplied qty as oversized.
    pub qty_tolerance: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            risk_percent_per_trade: 1.0,
            min_stop_distance_pct: 0.1,
            max_daily_loss_percent: 3.0,
            max_total_open_positions: 5,
            max_notional_usd: 50_000.0,
            max_open_exposure_usd: 150_000.0,
            max_leverage: 10.0,
            qty_tolerance: 1.10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SizingInput {
    pub equity: f64,
    pub cash: f64,
    pub daily_loss: f64,
    pub open_positions: u32,
    pub total_exposure_usd: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizedOrder {
    pub qty: Decimal,
    pub price: Decimal,
    pub notional: f64,
    pub required_leverage: f64,
    pub recommended_qty: f64,
}

/// Size a position per §4.F's formula and run every coded rejection check.
/// Rounds the final qty/price to the instrument's step/tick — never with
/// ad-hoc constants.
pub fn size_position(
    input: &SizingInput,
    limits: &RiskLimits,
    instrument: &Instrument,
) -> Result<SizedOrder, Vec<Rejection>> {
    let mut rejections = Vec::new();

    if input.entry_price <= 0.0 {
        rejections.push(Rejection::new("price_invalid", json!({ "entry_price": input.entry_price })));
    }

    let stop_distance = (input.entry_price - input.stop_loss).abs();
    let stop_distance_pct = if input.entry_price > 0.0 {
        (stop_distance / input.entry_price) * 100.0
    } else {
        0.0
    };
    if stop_distance_pct < limits.min_stop_distance_pct {
        rejections.push(Rejection::new(
            "stop_distance_too_tight",
            json!({ "stop_distance_pct": stop_distance_pct, "min": limits.min_stop_distance_pct }),
        ));
    }

    if !rejections.is_empty() {
        return Err(rejections);
    }

    let risk_usd = input.equity * (limits.risk_percent_per_trade / 100.0);
    let recommended_qty = risk_usd / stop_distance;
    let notional = recommended_qty * input.entry_price;
    let required_leverage = if input.cash > 0.0 { notional / input.cash } else { f64::INFINITY };

    if recommended_qty <= 0.0 {
        rejections.push(Rejection::new("qty_non_positive", json!({ "qty": recommended_qty })));
    }
    let max_daily_loss_usd = input.equity * (limits.max_daily_loss_percent / 100.0);
    if input.daily_loss >= max_daily_loss_usd {
        rejections.push(Rejection::new(
            "daily_loss_limit_reached",
            json!({ "daily_loss": input.daily_loss, "limit": max_daily_loss_usd }),
        ));
    }
    if input.open_positions >= limits.max_total_open_positions {
        rejections.push(Rejection::new(
            "max_open_positions_reached",
            json!({ "open_positions": input.open_positions, "limit": limits.max_total_open_positions }),
        ));
    }
    if notional > limits.max_notional_usd {
        rejections.push(Rejection::new(
            "notional_exceeds_limit",
            json!({ "notional": notional, "limit": limits.max_notional_usd }),
        ));
    }
    if input.total_exposure_usd + notional > limits.max_open_exposure_usd {
        rejections.push(Rejection::new(
            "exposure_exceeds_limit",
            json!({ "total_exposure": input.total_exposure_usd + notional, "limit": limits.max_open_exposure_usd }),
        ));
    }
    if required_leverage > limits.max_leverage {
        rejections.push(Rejection::new(
            "leverage_exceeds_limit",
            json!({ "required_leverage": required_leverage, "limit": limits.max_leverage }),
        ));
    }

    if !rejections.is_empty() {
        return Err(rejections);
    }

    let qty_decimal = Decimal::from_f64(recommended_qty).unwrap_or(Decimal::ZERO);
    let price_decimal = Decimal::from_f64(input.entry_price).unwrap_or(Decimal::ZERO);
    let rounded_qty = instrument.round_qty(qty_decimal);
    let rounded_price = instrument.round_price(price_decimal);

    let rounded_qty_f64 = rounded_qty.to_f64().unwrap_or(0.0);
    if rounded_qty_f64 > recommended_qty * limits.qty_tolerance {
        return Err(vec![Rejection::new(
            "qty_exceeds_recommended_tolerance",
            json!({ "qty": rounded_qty_f64, "recommended_qty": recommended_qty, "tolerance": limits.qty_tolerance }),
        )]);
    }

    Ok(SizedOrder {
        qty: rounded_qty,
        price: rounded_price,
        notional,
        required_leverage,
        recommended_qty,
    })
}

// ---------------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub risk_mode: String,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_pnl_pct: f64,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub daily_trades_count: u32,
    #[serde(default)]
    pub max_drawdown_today: f64,
    #[serde(default)]
    pub peak_equity_today: f64,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
    #[serde(default)]
    pub current_date: String,
}

struct Inner {
    risk_mode: String,
    daily_pnl: f64,
    consecutive_losses: u32,
    daily_trades_count: u32,
    max_drawdown_today: f64,
    peak_equity_today: f64,
    current_date: String,
    killed: bool,
}

pub struct RiskEngine {
    state: RwLock<Inner>,
    capital: f64,
    max_daily_loss_pct: f64,
    max_consecutive_losses: u32,
    max_drawdown_pct: f64,
    max_daily_trades: u32,
}

impl RiskEngine {
    pub fn new(
        capital: f64,
        max_daily_loss_pct: f64,
        max_consecutive_losses: u32,
        max_drawdown_pct: f64,
        max_daily_trades: u32,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(capital, max_daily_loss_pct, max_consecutive_losses, max_drawdown_pct, max_daily_trades, "risk engine initialised");

        Self {
            state: RwLock::new(Inner {
                risk_mode: "Normal".to_string(),
                daily_pnl: 0.0,
                consecutive_losses: 0,
                daily_trades_count: 0,
                max_drawdown_today: 0.0,
                peak_equity_today: capital,
                current_date: today,
                killed: false,
            }),
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_drawdown_pct,
            max_daily_trades,
        }
    }

    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades_count += 1;
        if pnl >= 0.0 {
            s.consecutive_losses = 0;
        } else {
            s.consecutive_losses += 1;
        }

        let current_equity = self.capital + s.daily_pnl;
        if current_equity > s.peak_equity_today {
            s.peak_equity_today = current_equity;
        }
        let drawdown = if s.peak_equity_today > 0.0 {
            (s.peak_equity_today - current_equity) / s.peak_equity_today
        } else {
            0.0
        };
        if drawdown > s.max_drawdown_today {
            s.max_drawdown_today = drawdown;
        }

        s.risk_mode = self.compute_risk_mode(&s);

        debug!(pnl, daily_pnl = s.daily_pnl, consecutive_losses = s.consecutive_losses, risk_mode = %s.risk_mode, "trade result recorded");
    }

    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return (false, Some("kill switch activated".to_string()));
        }

        let daily_loss_pct = if self.capital > 0.0 { (-s.daily_pnl) / self.capital } else { 0.0 };
        if daily_loss_pct >= self.max_daily_loss_pct {
            let msg = format!("daily loss breaker tripped: {:.2}% (limit {:.2}%)", daily_loss_pct * 100.0, self.max_daily_loss_pct * 100.0);
            warn!("{}", msg);
            return (false, Some(msg));
        }
        if s.consecutive_losses >= self.max_consecutive_losses {
            let msg = format!("consecutive losses breaker tripped: {} (limit {})", s.consecutive_losses, self.max_consecutive_losses);
            warn!("{}", msg);
            return (false, Some(msg));
        }
        if s.max_drawdown_today >= self.max_drawdown_pct {
            let msg = format!("max drawdown breaker tripped: {:.2}% (limit {:.2}%)", s.max_drawdown_today * 100.0, self.max_drawdown_pct * 100.0);
            warn!("{}", msg);
            return (false, Some(msg));
        }
        if s.daily_trades_count >= self.max_daily_trades {
            let msg = format!("trade limit breaker tripped: {} (limit {})", s.daily_trades_count, self.max_daily_trades);
            warn!("{}", msg);
            return (false, Some(msg));
        }

        (true, None)
    }

    pub fn get_state(&self) -> RiskState {
        self.maybe_reset_daily();
        let s = self.state.read();
        let daily_pnl_pct = if self.capital > 0.0 { (s.daily_pnl / self.capital) * 100.0 } else { 0.0 };
        let breakers = self.build_circuit_breaker_info(&s);

        RiskState {
            risk_mode: s.risk_mode.clone(),
            daily_pnl: s.daily_pnl,
            daily_pnl_pct,
            consecutive_losses: s.consecutive_losses,
            daily_trades_count: s.daily_trades_count,
            max_drawdown_today: s.max_drawdown_today,
            peak_equity_today: s.peak_equity_today,
            circuit_breakers: breakers,
            current_date: s.current_date.clone(),
        }
    }

    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today, self.capital);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        s.risk_mode = "KILLED".to_string();
        warn!("kill switch activated — all trading halted");
    }

    pub fn reset_kill(&self) {
        let mut s = self.state.write();
        s.killed = false;
        s.risk_mode = self.compute_risk_mode(&s);
        info!("kill switch reset");
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled — resetting daily risk counters");
            Self::do_reset(&mut s, &today, self.capital);
        }
    }

    fn do_reset(s: &mut Inner, date: &str, capital: f64) {
        s.daily_pnl = 0.0;
        s.consecutive_losses = 0;
        s.daily_trades_count = 0;
        s.max_drawdown_today = 0.0;
        s.peak_equity_today = capital;
        s.current_date = date.to_string();
        s.risk_mode = if s.killed { "KILLED".to_string() } else { "Normal".to_string() };
    }

    fn compute_risk_mode(&self, s: &Inner) -> String {
        if s.killed {
            return "KILLED".to_string();
        }
        let daily_loss_pct = if self.capital > 0.0 { (-s.daily_pnl) / self.capital } else { 0.0 };
        if daily_loss_pct >= self.max_daily_loss_pct
            || s.consecutive_losses >= self.max_consecutive_losses
            || s.max_drawdown_today >= self.max_drawdown_pct
            || s.daily_trades_count >= self.max_daily_trades
        {
            "BREAKER_TRIPPED".to_string()
        } else if daily_loss_pct >= self.max_daily_loss_pct * 0.75 || s.consecutive_losses as f64 >= self.max_consecutive_losses as f64 * 0.75 {
            "Cautious".to_string()
        } else {
            "Normal".to_string()
        }
    }

    fn build_circuit_breaker_info(&self, s: &Inner) -> Vec<CircuitBreakerInfo> {
        let daily_loss_pct = if self.capital > 0.0 { ((-s.daily_pnl) / self.capital) * 100.0 } else { 0.0 };
        vec![
            CircuitBreakerInfo { name: "Daily Loss".to_string(), current: daily_loss_pct.max(0.0), limit: self.max_daily_loss_pct * 100.0, tripped: daily_loss_pct >= self.max_daily_loss_pct * 100.0 },
            CircuitBreakerInfo { name: "Consecutive Losses".to_string(), current: s.consecutive_losses as f64, limit: self.max_consecutive_losses as f64, tripped: s.consecutive_losses >= self.max_consecutive_losses },
            CircuitBreakerInfo { name: "Max Drawdown".to_string(), current: s.max_drawdown_today * 100.0, limit: self.max_drawdown_pct * 100.0, tripped: s.max_drawdown_today >= self.max_drawdown_pct },
            CircuitBreakerInfo { name: "Trade Limit".to_string(), current: s.daily_trades_count as f64, limit: self.max_daily_trades as f64, tripped: s.daily_trades_count >= self.max_daily_trades },
        ]
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .field("max_drawdown_pct", &self.max_drawdown_pct)
            .field("max_daily_trades", &self.max_daily_trades)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument() -> Instrument {
        Instrument {
            symbol: "BTCUSDT".to_string(),
            tick_size: Decimal::new(1, 1),
            qty_step: Decimal::new(1, 3),
            min_qty: Decimal::new(1, 3),
            min_notional: Decimal::new(5, 0),
        }
    }

    fn base_input() -> SizingInput {
        SizingInput {
            equity: 10_000.0,
            cash: 10_000.0,
            daily_loss: 0.0,
            open_positions: 0,
            total_exposure_usd: 0.0,
            entry_price: 50_000.0,
            stop_loss: 49_500.0,
        }
    }

    #[test]
    fn sizes_within_limits() {
        let result = size_position(&base_input(), &RiskLimits::default(), &instrument());
        assert!(result.is_ok());
        let sized = result.unwrap();
        assert!(sized.qty > Decimal::ZERO);
    }

    #[test]
    fn rejects_on_invalid_price() {
        let mut input = base_input();
        input.entry_price = 0.0;
        let result = size_position(&input, &RiskLimits::default(), &instrument());
        assert!(result.is_err());
        assert!(result.unwrap_err().iter().any(|r| r.code == "price_invalid"));
    }

    #[test]
    fn rejects_on_tight_stop() {
        let mut input = base_input();
        input.stop_loss = 49_999.0;
        let result = size_position(&input, &RiskLimits::default(), &instrument());
        assert!(result.is_err());
        assert!(result.unwrap_err().iter().any(|r| r.code == "stop_distance_too_tight"));
    }

    #[test]
    fn rejects_on_daily_loss_limit() {
        let mut input = base_input();
        input.daily_loss = 500.0;
        let result = size_position(&input, &RiskLimits::default(), &instrument());
        assert!(result.is_err());
        assert!(result.unwrap_err().iter().any(|r| r.code == "daily_loss_limit_reached"));
    }

    #[test]
    fn rejects_on_max_open_positions() {
        let mut input = base_input();
        input.open_positions = 5;
        let result = size_position(&input, &RiskLimits::default(), &instrument());
        assert!(result.unwrap_err().iter().any(|r| r.code == "max_open_positions_reached"));
    }

    #[test]
    fn rejects_on_notional_limit() {
        let mut input = base_input();
        input.equity = 10_000_000.0;
        let result = size_position(&input, &RiskLimits::default(), &instrument());
        assert!(result.unwrap_err().iter().any(|r| r.code == "notional_exceeds_limit"));
    }

    #[test]
    fn rejects_on_leverage_limit() {
        let mut input = base_input();
        input.cash = 100.0;
        let result = size_position(&input, &RiskLimits::default(), &instrument());
        assert!(result.unwrap_err().iter().any(|r| r.code == "leverage_exceeds_limit"));
    }

    #[test]
    fn circuit_breaker_trips_on_daily_loss() {
        let engine = RiskEngine::new(10_000.0, 0.03, 5, 0.05, 50);
        engine.record_trade_result(-400.0);
        let (allowed, reason) = engine.can_trade();
        assert!(!allowed);
        assert!(reason.is_some());
    }

    #[test]
    fn kill_and_reset_kill_round_trip() {
        let engine = RiskEngine::new(10_000.0, 0.03, 5, 0.05, 50);
        engine.kill();
        assert!(!engine.can_trade().0);
        engine.reset_kill();
        assert!(engine.can_trade().0);
    }
}
