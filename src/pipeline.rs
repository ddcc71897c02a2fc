// =============================================================================
// Signal Pipeline — strategies -> meta-layer gates -> risk sizing -> order engine
// =============================================================================
//
// One task per active symbol (only one symbol is traded per process, see
// DESIGN.md). Every refresh tick: assemble a MarketTick, let each enabled
// strategy vote, gate the winner through the meta-layer's four ordered
// checks, size it against current account state, and submit it through the
// Order Engine. A strategy whose direction matches the symbol's already-open
// side is skipped here — this pipeline only opens flat symbols and reverses,
// it never pyramids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app::{App, BASE_TIMEFRAME};
use crate::order_idempotency::generate_link_id;
use crate::persistence::TradeLogEntry;
use crate::risk::SizingInput;
use crate::sltp::SltpMode;
use crate::strategies::normalize_legacy_signal;
use crate::types::{Direction, Side, TpslMode};

/// Matches the 5-minute base candle interval (`BASE_TIMEFRAME`), used to turn
/// a frame's `open_time` into a bar index for the mean-reversion time-stop.
const BASE_TIMEFRAME_MS: i64 = 300_000;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs()
}

fn log_event(app: &App, link_id: &str, event: &str, fields: HashMap<String, serde_json::Value>) {
    if let Err(e) = app.trade_log.append(&TradeLogEntry {
        link_id: link_id.to_string(),
        event: event.to_string(),
        timestamp: now_secs() as i64,
        fields,
    }) {
        warn!(link_id, event, error = %e, "failed to append trade log entry");
    }
}

/// Drive the signal pipeline for one symbol until the process shuts down.
pub async fn run_symbol_pipeline(app: Arc<App>, symbol: String) {
    loop {
        let interval_s = app.config.read().market_data.data_refresh_interval_s.max(1);
        tokio::time::sleep(Duration::from_secs(interval_s)).await;

        if let Err(e) = tick(&app, &symbol).await {
            warn!(symbol, error = %e, "pipeline tick failed");
        }
    }
}

async fn tick(app: &App, symbol: &str) -> anyhow::Result<()> {
    let (can_trade, reason) = app.risk_engine.can_trade();
    if !can_trade {
        debug!(symbol, reason = ?reason, "risk engine blocks new entries this tick");
        return Ok(());
    }
    if !app.kill_switch.can_trade() {
        return Ok(());
    }

    let Some(market_tick) = app.assembler.assemble(symbol, BASE_TIMEFRAME) else {
        debug!(symbol, "not enough data to assemble a tick yet");
        return Ok(());
    };
    let last_frame = match market_tick.base_frames.last() {
        Some(f) => f,
        None => return Ok(()),
    };

    if let Err(rejection) = app.meta_layer.check_no_trade_zones(last_frame, &market_tick.orderflow, 0) {
        debug!(symbol, code = %rejection.code, "no-trade-zone gate rejected tick");
        return Ok(());
    }

    let regime = app.meta_layer.classify_regime(&market_tick).unwrap_or(crate::regime::Regime::Range);

    if app.config.read().meta_layer.use_mtf {
        if let Err(rejection) = app.meta_layer.check_mtf_confluence(&market_tick.mtf_cache) {
            debug!(symbol, code = %rejection.code, "mtf confluence gate rejected tick");
            return Ok(());
        }
    }

    if check_mean_reversion_time_stop(app, symbol, last_frame.open_time).await {
        return Ok(());
    }

    let candidates: Vec<_> = app
        .strategies
        .iter()
        .filter_map(|s| {
            s.generate_signal(&market_tick.base_frames, &market_tick.orderflow, regime)
                .filter(|sig| sig.confidence >= s.confidence_threshold())
        })
        .map(normalize_legacy_signal)
        .map(|mut sig| {
            sig.symbol = symbol.to_string();
            sig
        })
        .collect();

    let Some(winner) = app.meta_layer.resolve_conflicts(candidates) else {
        return Ok(());
    };

    let side = match winner.direction {
        Direction::Long => Side::Long,
        Direction::Short => Side::Short,
        Direction::Exit => return Ok(()),
    };

    let link_id = generate_link_id(&winner.strategy_id, symbol, now_secs(), side);
    log_event(
        app,
        &link_id,
        "signal_generated",
        HashMap::from([
            ("strategy".to_string(), json!(winner.strategy_id)),
            ("symbol".to_string(), json!(symbol)),
            ("side".to_string(), json!(side.to_string())),
            ("confidence".to_string(), json!(winner.confidence)),
            ("entry_price".to_string(), json!(winner.entry_price)),
            ("stop_loss".to_string(), json!(winner.stop_loss)),
        ]),
    );

    if let Some(existing) = app.positions.get_position_info(symbol) {
        if existing.side == Some(side) {
            debug!(symbol, %side, "already positioned this direction, skipping");
            return Ok(());
        }
    }

    let Some(instrument) = app.instrument_for(symbol) else {
        warn!(symbol, "no instrument metadata, skipping signal");
        log_event(app, &link_id, "signal_rejected", HashMap::from([("reason".to_string(), json!("no_instrument_metadata"))]));
        return Ok(());
    };

    let risk_state = app.risk_engine.get_state();
    let starting_equity = app.config.read().paper_trading.starting_equity;
    let equity = starting_equity + risk_state.daily_pnl;

    let open_symbols = app.positions.open_symbols();
    let prices: HashMap<String, f64> = app
        .positions
        .get_all()
        .into_iter()
        .map(|p| (p.symbol.clone(), p.avg_entry_price))
        .collect();
    let total_exposure_usd = app.positions.total_notional(&prices);

    let limits = app.config.read().risk_management.limits.clone();
    let sizing_input = SizingInput {
        equity,
        cash: equity,
        daily_loss: (-risk_state.daily_pnl).max(0.0),
        open_positions: open_symbols.len() as u32,
        total_exposure_usd,
        entry_price: winner.entry_price,
        stop_loss: winner.stop_loss,
    };

    let sized = match crate::risk::size_position(&sizing_input, &limits, &instrument) {
        Ok(sized) => sized,
        Err(rejections) => {
            debug!(symbol, strategy = %winner.strategy_id, ?rejections, "risk engine rejected signal");
            log_event(
                app,
                &link_id,
                "signal_rejected",
                HashMap::from([
                    ("reason".to_string(), json!("risk_engine")),
                    ("rejections".to_string(), json!(rejections.iter().map(|r| r.code.clone()).collect::<Vec<_>>())),
                ]),
            );
            return Ok(());
        }
    };

    log_event(
        app,
        &link_id,
        "meta_approved",
        HashMap::from([("strategy".to_string(), json!(winner.strategy_id)), ("qty".to_string(), json!(sized.recommended_qty))]),
    );

    let execution_cfg = app.config.read().execution.clone();
    let order_id = match app
        .order_engine
        .create_order(
            &winner.strategy_id,
            symbol,
            side,
            &sized,
            false,
            link_id.clone(),
            execution_cfg.order_type,
            execution_cfg.time_in_force,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(symbol, strategy = %winner.strategy_id, error = %e, "order submission failed");
            log_event(app, &link_id, "signal_rejected", HashMap::from([("reason".to_string(), json!("order_submission_failed"))]));
            return Ok(());
        }
    };
    info!(symbol, strategy = %winner.strategy_id, %side, order_id, link_id, "signal executed");

    if winner.strategy_id == "mean_reversion" && app.positions.get_position_info(symbol).map(|p| p.qty).unwrap_or(0.0) > 0.0 {
        app.mr_opened_at_ms.write().insert(symbol.to_string(), last_frame.open_time);
    }

    attach_stop_loss_take_profit(app, symbol, side, &sized, last_frame.atr).await;

    Ok(())
}

/// If `symbol`'s open position was opened by mean_reversion and has exceeded
/// `max_hold_bars`, submit a reduce-only market close tagged
/// `exit_reason=time_stop` and clear the tracked open-bar. Returns `true` if
/// a close was submitted (callers should skip generating a new signal this
/// tick).
async fn check_mean_reversion_time_stop(app: &App, symbol: &str, current_open_time: i64) -> bool {
    let Some(opened_at_ms) = app.mr_opened_at_ms.read().get(symbol).copied() else {
        return false;
    };
    let Some(pos) = app.positions.get_position_info(symbol) else {
        app.mr_opened_at_ms.write().remove(symbol);
        return false;
    };
    let Some(side) = pos.side else {
        app.mr_opened_at_ms.write().remove(symbol);
        return false;
    };

    let config = crate::strategies::mean_reversion::MeanReversionConfig::default();
    let opened_at_bar = (opened_at_ms / BASE_TIMEFRAME_MS) as u64;
    let current_bar = (current_open_time / BASE_TIMEFRAME_MS) as u64;
    if !crate::strategies::mean_reversion::time_stop_triggered(&config, opened_at_bar, current_bar) {
        return false;
    }

    let sized = crate::risk::SizedOrder {
        qty: rust_decimal::Decimal::from_f64(pos.qty).unwrap_or_default(),
        price: rust_decimal::Decimal::from_f64(pos.avg_entry_price).unwrap_or_default(),
        notional: pos.qty * pos.avg_entry_price,
        required_leverage: 0.0,
        recommended_qty: pos.qty,
    };
    let close_side = side.opposite();
    let link_id = generate_link_id("mean_reversion_time_stop", symbol, now_secs(), close_side);
    let execution_cfg = app.config.read().execution.clone();

    match app
        .order_engine
        .create_order(
            "mean_reversion",
            symbol,
            close_side,
            &sized,
            true,
            link_id.clone(),
            execution_cfg.order_type,
            execution_cfg.time_in_force,
        )
        .await
    {
        Ok(order_id) => {
            info!(symbol, order_id, link_id, "mean_reversion time-stop triggered, position closed");
            log_event(app, &link_id, "time_stop_triggered", HashMap::from([("exit_reason".to_string(), json!("time_stop"))]));
        }
        Err(e) => warn!(symbol, error = %e, "mean_reversion time-stop close failed"),
    }
    app.mr_opened_at_ms.write().remove(symbol);
    true
}

/// Push exchange-attached stop-loss/take-profit for the just-opened position.
/// Virtual mode is tracked by the exit layer, not pushed to the venue here.
async fn attach_stop_loss_take_profit(
    app: &App,
    symbol: &str,
    side: Side,
    sized: &crate::risk::SizedOrder,
    atr: f64,
) {
    let sltp_cfg = app.config.read().stop_loss_tp.config.clone();
    if sltp_cfg.mode != SltpMode::ExchangeAttached {
        return;
    }
    let entry_price = sized.price.to_f64().unwrap_or(0.0);
    let levels = crate::sltp::compute_levels(&sltp_cfg, side, entry_price, atr);

    let stop_loss = rust_decimal::Decimal::from_f64(levels.stop_loss);
    let take_profit = rust_decimal::Decimal::from_f64(levels.take_profit);
    if let Err(e) = app.order_engine.set_trading_stop(symbol, stop_loss, take_profit, TpslMode::Full).await {
        warn!(symbol, error = %e, "failed to attach exchange stop-loss/take-profit");
    }
}
