// =============================================================================
// Bybit Linear-Perpetual Signal Engine — Entry Point
// =============================================================================
//
// Starts in whichever mode the CLI requests. Paper mode never touches the
// live order endpoints; live mode is gated by the kill-switch at every send
// path.

mod app;
mod config;
mod errors;
mod exchange;
mod features;
mod indicators;
mod instrument;
mod kill_switch;
mod market_data;
mod meta_layer;
mod order_engine;
mod order_idempotency;
mod paper_sim;
mod persistence;
mod pipeline;
mod position_state;
mod reconcile;
mod regime;
mod risk;
mod slippage;
mod sltp;
mod status_api;
mod strategies;
mod types;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::RuntimeConfig;
use crate::exchange::bybit::BybitClient;
use crate::types::RunMode;

#[derive(Parser)]
#[command(name = "bybit-signal-core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine live or in paper mode.
    Run {
        #[arg(long, value_enum)]
        mode: CliMode,
        #[arg(long)]
        symbol: String,
    },
    /// Replay historical klines through the strategy pipeline without sending orders.
    Backtest {
        #[arg(long)]
        symbol: String,
    },
    /// Clear a previously-activated kill-switch after manual confirmation.
    ResetKillswitch,
    /// Halt trading now: cancel every open order and flatten every tracked
    /// position, then persist the halt so a restart stays halted.
    ActivateKillswitch {
        #[arg(long, default_value = "operator requested halt")]
        reason: String,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum CliMode {
    Paper,
    Live,
}

impl From<CliMode> for RunMode {
    fn from(m: CliMode) -> Self {
        match m {
            CliMode::Paper => RunMode::Paper,
            CliMode::Live => RunMode::Live,
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async_main())
}

async fn async_main() -> ExitCode {
    let cli = Cli::parse();

    let data_dir = std::path::PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".".to_string()));
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(error = %e, "failed to create data directory");
        return ExitCode::from(1);
    }

    let config_path = data_dir.join("runtime_config.json");
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    match cli.command {
        Command::ResetKillswitch => {
            let store = Arc::new(crate::persistence::PersistentStore::new(data_dir.join("state.json")));
            let kill_switch = crate::kill_switch::KillSwitch::new(store);
            match kill_switch.reset() {
                Ok(()) => {
                    info!("kill-switch reset");
                    ExitCode::from(0)
                }
                Err(e) => {
                    error!(error = %e, "failed to reset kill-switch");
                    ExitCode::from(1)
                }
            }
        }
        Command::Backtest { symbol } => run_backtest(config, symbol).await,
        Command::Run { mode, symbol } => run(config, data_dir, mode.into(), symbol).await,
        Command::ActivateKillswitch { reason } => activate_killswitch(config, data_dir, reason).await,
    }
}

/// Operator-triggered halt outside the running process: rebuild the current
/// position view from the exchange, then run the same cancel-all /
/// close-reduce-only / persist sequence the in-process breaker trip uses.
async fn activate_killswitch(config: RuntimeConfig, data_dir: std::path::PathBuf, reason: String) -> ExitCode {
    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let testnet = std::env::var("BYBIT_TESTNET").map(|v| v == "1").unwrap_or(false);
    let client = Arc::new(BybitClient::new(api_key, api_secret, testnet));

    let store = Arc::new(crate::persistence::PersistentStore::new(data_dir.join("state.json")));
    let kill_switch = Arc::new(crate::kill_switch::KillSwitch::new(store));
    let trade_log = Arc::new(crate::persistence::TradeLog::new(data_dir.join("trades.jsonl")));
    let positions = Arc::new(crate::position_state::PositionStateManager::new());

    match client.positions(Some(&config.trading.symbol)).await {
        Ok(exchange_positions) => {
            for pos in exchange_positions {
                let Some(side) = pos.side else { continue };
                let qty = rust_decimal::prelude::ToPrimitive::to_f64(&pos.qty).unwrap_or(0.0);
                let avg = rust_decimal::prelude::ToPrimitive::to_f64(&pos.avg_price).unwrap_or(0.0);
                if qty > 0.0 {
                    positions.open_position(&pos.symbol, side, qty, avg);
                }
            }
        }
        Err(e) => warn!(error = %e, "activate-killswitch: failed to fetch exchange positions, halting with empty position view"),
    }

    let order_engine = crate::order_engine::OrderEngine::new(client, positions.clone(), kill_switch.clone(), trade_log);

    match kill_switch.activate(&reason, &order_engine, &positions).await {
        Ok(()) => {
            warn!(reason, "kill-switch activated by operator");
            ExitCode::from(0)
        }
        Err(e) => {
            error!(error = %e, "failed to activate kill-switch");
            ExitCode::from(1)
        }
    }
}

async fn run(mut config: RuntimeConfig, data_dir: std::path::PathBuf, mode: RunMode, symbol: String) -> ExitCode {
    info!(%mode, symbol, "starting engine");
    config.trading.symbol = symbol.clone();

    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let testnet = matches!(mode, RunMode::Paper) || std::env::var("BYBIT_TESTNET").map(|v| v == "1").unwrap_or(false);
    let client = Arc::new(BybitClient::new(api_key.clone(), api_secret.clone(), testnet));

    let app = Arc::new(App::new(config, client.clone(), &data_dir));

    if let Ok(instruments) = app_fetch_instruments(&client).await {
        *app.instruments.write() = instruments;
    }

    // ── Market data streams: one task per (symbol, interval) pair ─────────
    for interval in std::iter::once(app::BASE_TIMEFRAME).chain(app::COMPANION_TIMEFRAMES.iter().copied()) {
        let cb = app.candle_buffer.clone();
        let sym = symbol.clone();
        let interval = interval.to_string();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::candle_buffer::run_kline_stream(&sym, &interval, &cb).await {
                    error!(symbol = %sym, interval, error = %e, "kline stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }
    {
        let ob = app.orderbook.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::orderbook::run_orderbook_stream(&sym, 50, &ob).await {
                    error!(symbol = %sym, error = %e, "orderbook stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    // ── Reconciliation task ────────────────────────────────────────────────
    if matches!(mode, RunMode::Live) {
        let recon_app = app.clone();
        let recon_client = client.clone();
        let interval_s = recon_app.config.read().execution.reconciliation_interval_s.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                reconcile::run_reconciliation(&recon_app, &recon_client).await;
            }
        });
    }

    // ── Private WebSocket listener: fills and position pushes ──────────────
    if matches!(mode, RunMode::Live) {
        let oe = app.order_engine.clone();
        let risk = app.risk_engine.clone();
        let ws_client = exchange::ws::PrivateWsClient::new(api_key.clone(), api_secret.clone());
        tokio::spawn(async move {
            loop {
                let (tx, mut rx) = tokio::sync::mpsc::channel(256);
                let forward_oe = oe.clone();
                let forward_risk = risk.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        match event {
                            exchange::ws::PrivateEvent::Execution { symbol, side, qty, price, .. } => {
                                if let Some(realized) =
                                    forward_oe.apply_order_event(&symbol, side, types::OrderStatus::Filled, qty, price)
                                {
                                    forward_risk.record_trade_result(realized);
                                }
                            }
                            exchange::ws::PrivateEvent::Order { .. } | exchange::ws::PrivateEvent::Position { .. } => {}
                        }
                    }
                });
                if let Err(e) = ws_client.run(tx).await {
                    error!(error = %e, "private WS client error — reconnecting in 5s");
                }
                forwarder.abort();
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    // ── Signal pipeline: one task for the traded symbol ────────────────────
    {
        let pipeline_app = app.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            pipeline::run_symbol_pipeline(pipeline_app, sym).await;
        });
    }

    // ── Status API ──────────────────────────────────────────────────────────
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    {
        let api_app = app.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let router = status_api::router(api_app);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "status API listening");
                    if let Err(e) = axum::serve(listener, router).await {
                        error!(error = %e, "status API server failed");
                    }
                }
                Err(e) => error!(error = %e, addr = %bind_addr, "failed to bind status API"),
            }
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for shutdown signal");
        return ExitCode::from(2);
    }

    warn!("shutdown signal received");
    if let Err(e) = app.config.read().save(data_dir.join("runtime_config.json")) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("shutdown complete");
    ExitCode::from(130)
}

async fn app_fetch_instruments(client: &Arc<BybitClient>) -> anyhow::Result<Vec<crate::instrument::Instrument>> {
    client.instruments("linear").await.map_err(|e| anyhow::anyhow!("{e}"))
}

/// Replay historical klines for `symbol` through the strategy pipeline using
/// the deterministic Paper Simulator, never touching an order endpoint. A
/// thin companion to live/paper trading: no meta-layer MTF gate (no
/// multi-timeframe history is fetched) and no risk sizing, just raw
/// strategy-to-fill accounting for a quick read on strategy behaviour.
async fn run_backtest(config: RuntimeConfig, symbol: String) -> ExitCode {
    let client = BybitClient::new(String::new(), String::new(), true);
    let candles = match client.kline(&symbol, app::BASE_TIMEFRAME, 1000).await {
        Ok(c) => c,
        Err(e) => {
            error!(symbol, error = %e, "backtest: failed to fetch historical klines");
            return ExitCode::from(1);
        }
    };
    if candles.len() < 250 {
        error!(symbol, candles = candles.len(), "backtest: not enough history returned");
        return ExitCode::from(1);
    }

    let strategies = app::build_strategy_registry(&config.trading.active_strategies);
    let slippage_preset = match config.paper_trading.slippage_preset.as_str() {
        "none" => slippage::SlippagePreset::None,
        "minimal" => slippage::SlippagePreset::Minimal,
        "high" => slippage::SlippagePreset::High,
        _ => slippage::SlippagePreset::Realistic,
    };
    let sim = paper_sim::PaperSimulator::new(
        slippage::SlippageModel::from_preset(slippage_preset),
        config.paper_trading.maker_commission,
        config.paper_trading.taker_commission,
    );
    let flat_orderflow = market_data::OrderFlowSnapshot { spread_pct: 0.0, depth_imbalance: 0.0 };
    let regime_switcher = regime::RegimeSwitcher::default();

    let mut equity = config.paper_trading.starting_equity;
    let mut trades = 0u32;
    let mut open: Option<(types::Side, f64, f64)> = None; // (side, qty, entry_price)

    for window_end in 200..candles.len() {
        let window = &candles[..=window_end];
        let bar = &window[window.len() - 1];
        let frames = features::build_features(window);
        let Some(last) = frames.last() else { continue };
        let regime = regime_switcher.detect(window).map(|s| s.regime).unwrap_or(regime::Regime::Range);

        if let Some((side, qty, entry_price)) = open {
            let opposing = strategies.iter().any(|s| {
                s.generate_signal(&frames, &flat_orderflow, regime)
                    .map(|sig| match sig.direction {
                        types::Direction::Long => side == types::Side::Short,
                        types::Direction::Short => side == types::Side::Long,
                        types::Direction::Exit => true,
                    })
                    .unwrap_or(false)
            });
            if opposing {
                if let Some(fill) = sim.try_fill(types::OrderType::Market, side.opposite(), qty, None, bar, Some(last.atr), None) {
                    let direction = if side == types::Side::Long { 1.0 } else { -1.0 };
                    let pnl = direction * (fill.price - entry_price) * qty - fill.commission;
                    equity += pnl;
                    trades += 1;
                    open = None;
                }
            }
        } else {
            for strat in &strategies {
                let Some(signal) = strat.generate_signal(&frames, &flat_orderflow, regime) else { continue };
                if signal.confidence < strat.confidence_threshold() {
                    continue;
                }
                let side = match signal.direction {
                    types::Direction::Long => types::Side::Long,
                    types::Direction::Short => types::Side::Short,
                    types::Direction::Exit => continue,
                };
                let qty = (equity * 0.01 / (signal.entry_price - signal.stop_loss).abs()).max(0.0);
                if qty <= 0.0 {
                    continue;
                }
                if let Some(fill) = sim.try_fill(types::OrderType::Market, side, qty, None, bar, Some(last.atr), None) {
                    equity -= fill.commission;
                    open = Some((side, qty, fill.price));
                }
                break;
            }
        }
    }

    info!(symbol, trades, final_equity = equity, starting_equity = config.paper_trading.starting_equity, "backtest complete");
    ExitCode::from(0)
}
