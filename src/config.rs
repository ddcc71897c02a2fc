// =============================================================================
// Runtime Configuration — nested, hot-reloadable sections with atomic save
// =============================================================================
//
// Every tunable lives in one typed `RuntimeConfig`, loaded from a JSON file
// via serde with per-field `#[serde(default)]` fallbacks so a partial file
// still loads. Unknown top-level keys are rejected so a typo fails loudly at
// startup instead of silently no-opping.
//
// Only `trading.symbol`, `market_data.data_refresh_interval_s`,
// `meta_layer.use_mtf`, and `trading.active_strategies` are hot-reloadable;
// everything else requires a restart and `reload()` warns rather than
// applying a change to those fields.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_active_strategies() -> Vec<String> {
    vec!["mean_reversion".to_string(), "trend_pullback".to_string(), "breakout".to_string()]
}

fn default_refresh_interval_s() -> u64 {
    5
}

fn default_recon_interval_s() -> u64 {
    60
}

fn default_order_type() -> crate::types::OrderType {
    crate::types::OrderType::Market
}

fn default_time_in_force() -> crate::types::TimeInForce {
    crate::types::TimeInForce::Ioc
}

fn default_partial_exit_percent() -> f64 {
    0.5
}

fn default_maker_commission() -> f64 {
    0.0002
}

fn default_taker_commission() -> f64 {
    0.00055
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradingSection {
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_active_strategies")]
    pub active_strategies: Vec<String>,
}

impl Default for TradingSection {
    fn default() -> Self {
        Self { mode: TradingMode::default(), symbol: default_symbol(), active_strategies: default_active_strategies() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketDataSection {
    #[serde(default = "default_refresh_interval_s")]
    pub data_refresh_interval_s: u64,
    #[serde(default)]
    pub orderbook_depth: u32,
}

impl Default for MarketDataSection {
    fn default() -> Self {
        Self { data_refresh_interval_s: default_refresh_interval_s(), orderbook_depth: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskManagementSection {
    #[serde(default)]
    pub limits: crate::risk::RiskLimits,
    #[serde(default)]
    pub max_consecutive_losses: u32,
    #[serde(default)]
    pub max_drawdown_pct: f64,
    #[serde(default)]
    pub max_daily_trades: u32,
}

impl Default for RiskManagementSection {
    fn default() -> Self {
        Self { limits: crate::risk::RiskLimits::default(), max_consecutive_losses: 5, max_drawdown_pct: 5.0, max_daily_trades: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopLossTpSection {
    #[serde(default)]
    pub config: crate::sltp::SltpConfig,
}

impl Default for StopLossTpSection {
    fn default() -> Self {
        Self { config: crate::sltp::SltpConfig::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaLayerSection {
    #[serde(default = "default_true")]
    pub use_mtf: bool,
    #[serde(default)]
    pub no_trade_zones: crate::meta_layer::NoTradeZonesConfig,
    #[serde(default)]
    pub mtf_confluence: crate::meta_layer::MtfConfluenceConfig,
}

impl Default for MetaLayerSection {
    fn default() -> Self {
        Self {
            use_mtf: true,
            no_trade_zones: crate::meta_layer::NoTradeZonesConfig::default(),
            mtf_confluence: crate::meta_layer::MtfConfluenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub confidence_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { enabled: true, confidence_threshold: 0.6 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionSection {
    #[serde(default)]
    pub reconciliation_interval_s: u64,
    #[serde(default = "default_order_type")]
    pub order_type: crate::types::OrderType,
    #[serde(default = "default_time_in_force")]
    pub time_in_force: crate::types::TimeInForce,
    #[serde(default)]
    pub use_breakeven: bool,
    #[serde(default)]
    pub use_partial_exit: bool,
    #[serde(default = "default_partial_exit_percent")]
    pub partial_exit_percent: f64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            reconciliation_interval_s: default_recon_interval_s(),
            order_type: default_order_type(),
            time_in_force: default_time_in_force(),
            use_breakeven: false,
            use_partial_exit: false,
            partial_exit_percent: default_partial_exit_percent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaperTradingSection {
    #[serde(default)]
    pub starting_equity: f64,
    #[serde(default)]
    pub slippage_preset: String,
    #[serde(default = "default_maker_commission")]
    pub maker_commission: f64,
    #[serde(default = "default_taker_commission")]
    pub taker_commission: f64,
}

impl Default for PaperTradingSection {
    fn default() -> Self {
        Self {
            starting_equity: 10_000.0,
            slippage_preset: "realistic".to_string(),
            maker_commission: default_maker_commission(),
            taker_commission: default_taker_commission(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading: TradingSection,
    #[serde(default)]
    pub market_data: MarketDataSection,
    #[serde(default)]
    pub risk_management: RiskManagementSection,
    #[serde(default)]
    pub stop_loss_tp: StopLossTpSection,
    #[serde(default)]
    pub meta_layer: MetaLayerSection,
    #[serde(default)]
    pub strategies: std::collections::HashMap<String, StrategyConfig>,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub paper_trading: PaperTradingSection,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading: TradingSection::default(),
            market_data: MarketDataSection::default(),
            risk_management: RiskManagementSection::default(),
            stop_loss_tp: StopLossTpSection::default(),
            meta_layer: MetaLayerSection::default(),
            strategies: std::collections::HashMap::new(),
            execution: ExecutionSection::default(),
            paper_trading: PaperTradingSection::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), symbol = %config.trading.symbol, "runtime config loaded");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Re-read the file and swap only the hot-reloadable subset into `self`.
    /// Fields that require a restart are left untouched; a change to one is
    /// logged as a warning instead of applied.
    pub fn reload(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let fresh = Self::load(path)?;

        if fresh.risk_management != self.risk_management {
            warn!("risk_management changed on disk but requires a restart to apply");
        }
        if fresh.stop_loss_tp != self.stop_loss_tp {
            warn!("stop_loss_tp changed on disk but requires a restart to apply");
        }
        if fresh.execution != self.execution {
            warn!("execution changed on disk but requires a restart to apply");
        }

        self.trading.symbol = fresh.trading.symbol;
        self.trading.active_strategies = fresh.trading.active_strategies;
        self.market_data.data_refresh_interval_s = fresh.market_data.data_refresh_interval_s;
        self.meta_layer.use_mtf = fresh.meta_layer.use_mtf;

        info!("runtime config hot-reloaded (restart-required sections left untouched)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading.symbol, "BTCUSDT");
        assert!(cfg.meta_layer.use_mtf);
        assert_eq!(cfg.execution.reconciliation_interval_s, default_recon_interval_s());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let json = r#"{ "bogus_section": {} }"#;
        let result: std::result::Result<RuntimeConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn hot_reload_swaps_only_allowed_fields() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut cfg = RuntimeConfig::default();
        cfg.risk_management.max_daily_trades = 999;
        cfg.save(tmp.path()).unwrap();

        let mut on_disk = RuntimeConfig::load(tmp.path()).unwrap();
        on_disk.trading.symbol = "ETHUSDT".to_string();
        on_disk.risk_management.max_daily_trades = 1; // should NOT propagate
        on_disk.save(tmp.path()).unwrap();

        let mut live = RuntimeConfig::default();
        live.risk_management.max_daily_trades = 999;
        live.reload(tmp.path()).unwrap();

        assert_eq!(live.trading.symbol, "ETHUSDT");
        assert_eq!(live.risk_management.max_daily_trades, 999);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trading.symbol, cfg2.trading.symbol);
    }
}
