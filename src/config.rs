//! Configuration loading: merges `config/settings.toml`,
//! `config/risk_limits.toml`, and environment variables (secrets).
//!
//! Invalid configuration aborts startup with the combined list of
//! violations.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::domain::contract::RiskLimits;
use crate::domain::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Paper => write!(f, "paper"),
            Mode::Live => write!(f, "live"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KrakenConfig {
    pub rest_url: String,
    pub ws_url: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub secret_key: String,
    pub maker_fee_pct: f64,
    pub taker_fee_pct: f64,
}

impl Default for KrakenConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.kraken.com".to_string(),
            ws_url: "wss://ws.kraken.com/v2".to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            maker_fee_pct: 0.25,
            taker_fee_pct: 0.40,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub provider: String,
    pub api_url: String,
    #[serde(skip)]
    pub api_key: String,
    pub sonnet_model: String,
    pub opus_model: String,
    pub daily_token_limit: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key: String::new(),
            sonnet_model: "claude-sonnet-4-5".to_string(),
            opus_model: "claude-opus-4-6".to_string(),
            daily_token_limit: 1_500_000,
        }
    }
}

/// Which events send alerts. High-frequency ones default off.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationFlags {
    pub trade_executed: bool,
    pub stop_triggered: bool,
    pub risk_halt: bool,
    pub strategy_deployed: bool,
    pub system_online: bool,
    pub system_error: bool,
    pub websocket_feed_lost: bool,
    pub daily_summary: bool,
    pub weekly_report: bool,
    pub signal_rejected: bool,
    pub scan_complete: bool,
    pub orchestrator_cycle_started: bool,
    pub orchestrator_cycle_completed: bool,
    pub candidate_created: bool,
    pub candidate_canceled: bool,
    pub candidate_promoted: bool,
    pub candidate_trade_executed: bool,
}

impl Default for NotificationFlags {
    fn default() -> Self {
        Self {
            trade_executed: true,
            stop_triggered: true,
            risk_halt: true,
            strategy_deployed: true,
            system_online: true,
            system_error: true,
            websocket_feed_lost: true,
            daily_summary: true,
            weekly_report: true,
            // High-frequency, default off
            signal_rejected: false,
            scan_complete: false,
            orchestrator_cycle_started: false,
            orchestrator_cycle_completed: false,
            candidate_trade_executed: false,
            candidate_created: true,
            candidate_canceled: true,
            candidate_promoted: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub api_url: String,
    #[serde(skip)]
    pub bot_token: String,
    #[serde(skip)]
    pub chat_id: String,
    pub notifications: NotificationFlags,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "https://api.telegram.org".to_string(),
            bot_token: String::new(),
            chat_id: String::new(),
            notifications: NotificationFlags::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    /// Inner loop: code quality iterations.
    pub max_revisions: u32,
    /// Outer loop: strategy direction iterations.
    pub max_strategy_iterations: u32,
    /// Max simultaneous candidate slots.
    pub max_candidates: u32,
    /// Skip the cycle below this many remaining tokens.
    pub min_token_budget: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_hour: 3,
            start_minute: 0,
            end_hour: 6,
            max_revisions: 12,
            max_strategy_iterations: 9,
            max_candidates: 3,
            min_token_budget: 200_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub candle_5m_retention_days: i64,
    pub candle_1h_retention_days: i64,
    pub candle_1d_retention_years: i64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            candle_5m_retention_days: 30,
            candle_1h_retention_days: 365,
            candle_1d_retention_years: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub check_interval_hours: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            check_interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_position_pct: f64,
    pub max_positions: usize,
    pub max_leverage: f64,
    pub max_daily_loss_pct: f64,
    pub max_daily_trades: u32,
    pub max_trade_pct: f64,
    pub default_trade_pct: f64,
    pub default_stop_loss_pct: f64,
    pub default_take_profit_pct: f64,
    pub kill_switch: bool,
    pub max_drawdown_pct: f64,
    pub rollback_daily_loss_pct: f64,
    pub rollback_consecutive_losses: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_pct: 0.25,
            max_positions: 5,
            max_leverage: 1.0,
            max_daily_loss_pct: 0.10,
            max_daily_trades: 20,
            max_trade_pct: 0.10,
            default_trade_pct: 0.03,
            default_stop_loss_pct: 0.02,
            default_take_profit_pct: 0.06,
            kill_switch: false,
            max_drawdown_pct: 0.40,
            rollback_daily_loss_pct: 0.15,
            // Effectively disabled by default; drawdown is the structural halt.
            rollback_consecutive_losses: 999,
        }
    }
}

/// How externally generated strategy/analysis code is executed: the worker
/// interpreter command plus the deploy directories.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command prefix that runs a worker script, e.g. ["python3", "-u"].
    pub command: Vec<String>,
    pub strategy_dir: PathBuf,
    pub analysis_dir: PathBuf,
    /// Per-call timeout for worker responses, seconds.
    pub call_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "-u".to_string()],
            strategy_dir: PathBuf::from("strategy"),
            analysis_dir: PathBuf::from("statistics"),
            call_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub paper_balance_usd: f64,
    pub timezone: String,
    pub log_level: String,
    pub default_slippage_factor: f64,
    pub symbols: Vec<String>,
    pub kraken: KrakenConfig,
    pub ai: AiConfig,
    pub telegram: TelegramConfig,
    pub orchestrator: OrchestratorConfig,
    pub data: DataConfig,
    pub fees: FeeConfig,
    pub risk: RiskConfig,
    pub worker: WorkerConfig,
    pub db_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Paper,
            paper_balance_usd: 200.0,
            timezone: "US/Eastern".to_string(),
            log_level: "INFO".to_string(),
            default_slippage_factor: 0.0005,
            symbols: vec![
                "BTC/USD".to_string(),
                "ETH/USD".to_string(),
                "SOL/USD".to_string(),
                "XRP/USD".to_string(),
                "DOGE/USD".to_string(),
                "ADA/USD".to_string(),
                "LINK/USD".to_string(),
                "AVAX/USD".to_string(),
                "DOT/USD".to_string(),
            ],
            kraken: KrakenConfig::default(),
            ai: AiConfig::default(),
            telegram: TelegramConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            data: DataConfig::default(),
            fees: FeeConfig::default(),
            risk: RiskConfig::default(),
            worker: WorkerConfig::default(),
            db_url: "sqlite://data/evotrade.db".to_string(),
        }
    }
}

/// settings.toml shape (every section optional).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    general: GeneralSection,
    markets: MarketsSection,
    kraken: KrakenConfig,
    ai: AiConfig,
    telegram: TelegramConfig,
    orchestrator: OrchestratorConfig,
    data: DataConfig,
    fees: FeeConfig,
    worker: WorkerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralSection {
    mode: Mode,
    paper_balance_usd: f64,
    timezone: String,
    log_level: String,
    default_slippage_factor: f64,
    db_url: String,
}

impl Default for GeneralSection {
    fn default() -> Self {
        let c = Config::default();
        Self {
            mode: c.mode,
            paper_balance_usd: c.paper_balance_usd,
            timezone: c.timezone,
            log_level: c.log_level,
            default_slippage_factor: c.default_slippage_factor,
            db_url: c.db_url,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MarketsSection {
    symbols: Vec<String>,
}

impl Default for MarketsSection {
    fn default() -> Self {
        Self {
            symbols: Config::default().symbols,
        }
    }
}

/// risk_limits.toml shape.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RiskLimitsFile {
    position: PositionSection,
    daily: DailySection,
    per_trade: PerTradeSection,
    emergency: EmergencySection,
    rollback: RollbackSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PositionSection {
    max_position_pct: f64,
    max_positions: usize,
    max_leverage: f64,
}

impl Default for PositionSection {
    fn default() -> Self {
        let r = RiskConfig::default();
        Self {
            max_position_pct: r.max_position_pct,
            max_positions: r.max_positions,
            max_leverage: r.max_leverage,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DailySection {
    max_daily_loss_pct: f64,
    max_daily_trades: u32,
}

impl Default for DailySection {
    fn default() -> Self {
        let r = RiskConfig::default();
        Self {
            max_daily_loss_pct: r.max_daily_loss_pct,
            max_daily_trades: r.max_daily_trades,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PerTradeSection {
    max_trade_pct: f64,
    default_trade_pct: f64,
    default_stop_loss_pct: f64,
    default_take_profit_pct: f64,
}

impl Default for PerTradeSection {
    fn default() -> Self {
        let r = RiskConfig::default();
        Self {
            max_trade_pct: r.max_trade_pct,
            default_trade_pct: r.default_trade_pct,
            default_stop_loss_pct: r.default_stop_loss_pct,
            default_take_profit_pct: r.default_take_profit_pct,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EmergencySection {
    kill_switch: bool,
    max_drawdown_pct: f64,
}

impl Default for EmergencySection {
    fn default() -> Self {
        let r = RiskConfig::default();
        Self {
            kill_switch: r.kill_switch,
            max_drawdown_pct: r.max_drawdown_pct,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RollbackSection {
    max_daily_loss_pct: f64,
    max_consecutive_losses: u32,
}

impl Default for RollbackSection {
    fn default() -> Self {
        let r = RiskConfig::default();
        Self {
            max_daily_loss_pct: r.rollback_daily_loss_pct,
            max_consecutive_losses: r.rollback_consecutive_losses,
        }
    }
}

impl Config {
    /// Load from `<config_dir>/settings.toml` + `<config_dir>/risk_limits.toml`
    /// plus environment variables for secrets. Missing files fall back to
    /// defaults; an invalid file is an error.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let settings: SettingsFile = read_toml(&config_dir.join("settings.toml"))?;
        let limits: RiskLimitsFile = read_toml(&config_dir.join("risk_limits.toml"))?;
        let mut config = Config {
            mode: settings.general.mode,
            paper_balance_usd: settings.general.paper_balance_usd,
            timezone: settings.general.timezone,
            log_level: settings.general.log_level,
            default_slippage_factor: settings.general.default_slippage_factor,
            symbols: settings.markets.symbols,
            kraken: settings.kraken,
            ai: settings.ai,
            telegram: settings.telegram,
            orchestrator: settings.orchestrator,
            data: settings.data,
            fees: settings.fees,
            worker: settings.worker,
            risk: RiskConfig {
                max_position_pct: limits.position.max_position_pct,
                max_positions: limits.position.max_positions,
                max_leverage: limits.position.max_leverage,
                max_daily_loss_pct: limits.daily.max_daily_loss_pct,
                max_daily_trades: limits.daily.max_daily_trades,
                max_trade_pct: limits.per_trade.max_trade_pct,
                default_trade_pct: limits.per_trade.default_trade_pct,
                default_stop_loss_pct: limits.per_trade.default_stop_loss_pct,
                default_take_profit_pct: limits.per_trade.default_take_profit_pct,
                kill_switch: limits.emergency.kill_switch,
                max_drawdown_pct: limits.emergency.max_drawdown_pct,
                rollback_daily_loss_pct: limits.rollback.max_daily_loss_pct,
                rollback_consecutive_losses: limits.rollback.max_consecutive_losses,
            },
            db_url: settings.general.db_url,
        };

        // Secrets come from the environment only
        config.kraken.api_key = std::env::var("KRAKEN_API_KEY").unwrap_or_default();
        config.kraken.secret_key = std::env::var("KRAKEN_SECRET_KEY").unwrap_or_default();
        config.ai.api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
        config.telegram.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        config.telegram.chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();

        config.validate()?;
        Ok(config)
    }

    pub fn is_paper(&self) -> bool {
        self.mode == Mode::Paper
    }

    pub fn tz(&self) -> Tz {
        // Validated at load time; UTC only as a defensive fallback.
        Tz::from_str(&self.timezone).unwrap_or(chrono_tz::UTC)
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_trade_pct: self.risk.max_trade_pct,
            default_trade_pct: self.risk.default_trade_pct,
            max_positions: self.risk.max_positions,
            max_daily_loss_pct: self.risk.max_daily_loss_pct,
            max_drawdown_pct: self.risk.max_drawdown_pct,
            max_position_pct: self.risk.max_position_pct,
            max_daily_trades: self.risk.max_daily_trades,
            rollback_consecutive_losses: self.risk.rollback_consecutive_losses,
        }
    }

    /// Validate everything and report every violation at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let r = &self.risk;

        if !(r.max_trade_pct > 0.0 && r.max_trade_pct <= 1.0) {
            errors.push(format!("max_trade_pct must be 0-1, got {}", r.max_trade_pct));
        }
        if !(r.max_position_pct > 0.0 && r.max_position_pct <= 1.0) {
            errors.push(format!(
                "max_position_pct must be 0-1, got {}",
                r.max_position_pct
            ));
        }
        if !(r.max_daily_loss_pct > 0.0 && r.max_daily_loss_pct <= 1.0) {
            errors.push(format!(
                "max_daily_loss_pct must be 0-1, got {}",
                r.max_daily_loss_pct
            ));
        }
        if !(r.max_drawdown_pct > 0.0 && r.max_drawdown_pct <= 1.0) {
            errors.push(format!(
                "max_drawdown_pct must be 0-1, got {}",
                r.max_drawdown_pct
            ));
        }
        if !(r.rollback_daily_loss_pct > 0.0 && r.rollback_daily_loss_pct <= 1.0) {
            errors.push(format!(
                "rollback.max_daily_loss_pct must be 0-1, got {}",
                r.rollback_daily_loss_pct
            ));
        }
        if r.max_positions < 1 {
            errors.push(format!("max_positions must be >= 1, got {}", r.max_positions));
        }
        if r.max_daily_trades < 1 {
            errors.push(format!(
                "max_daily_trades must be >= 1, got {}",
                r.max_daily_trades
            ));
        }
        if r.rollback_consecutive_losses < 1 {
            errors.push(format!(
                "rollback_consecutive_losses must be >= 1, got {}",
                r.rollback_consecutive_losses
            ));
        }
        if r.default_trade_pct > r.max_trade_pct {
            errors.push(format!(
                "default_trade_pct ({}) > max_trade_pct ({})",
                r.default_trade_pct, r.max_trade_pct
            ));
        }
        if r.max_trade_pct > r.max_position_pct {
            errors.push(format!(
                "max_trade_pct ({}) > max_position_pct ({})",
                r.max_trade_pct, r.max_position_pct
            ));
        }

        if self.paper_balance_usd <= 0.0 {
            errors.push(format!(
                "paper_balance_usd must be > 0, got {}",
                self.paper_balance_usd
            ));
        }
        if !(0.0..=0.05).contains(&self.default_slippage_factor) {
            errors.push(format!(
                "default_slippage_factor must be 0-0.05, got {}",
                self.default_slippage_factor
            ));
        }
        if self.fees.check_interval_hours < 1 {
            errors.push(format!(
                "fees.check_interval_hours must be >= 1, got {}",
                self.fees.check_interval_hours
            ));
        }

        if self.symbols.is_empty() {
            errors.push("at least one trading symbol must be configured".to_string());
        }
        for sym in &self.symbols {
            if !sym.contains('/') {
                errors.push(format!("symbol must contain '/' separator: '{sym}'"));
            } else if !sym.ends_with("USD") {
                errors.push(format!("symbol must end with 'USD': '{sym}'"));
            }
        }

        if Tz::from_str(&self.timezone).is_err() {
            errors.push(format!("invalid timezone: '{}'", self.timezone));
        }

        if self.orchestrator.start_hour > 23 {
            errors.push(format!(
                "orchestrator.start_hour must be 0-23, got {}",
                self.orchestrator.start_hour
            ));
        }
        if self.worker.command.is_empty() {
            errors.push("worker.command must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { violations: errors })
        }
    }
}

fn read_toml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut config = Config::default();
        config.risk.max_trade_pct = 1.5;
        config.risk.max_positions = 0;
        config.timezone = "Mars/Olympus".to_string();
        config.symbols = vec!["BTCUSD".to_string(), "ETH/EUR".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.violations.len() >= 4, "{:?}", err.violations);
    }

    #[test]
    fn trade_pct_ordering_enforced() {
        let mut config = Config::default();
        config.risk.default_trade_pct = 0.2;
        config.risk.max_trade_pct = 0.1;
        let err = config.validate().unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| v.contains("default_trade_pct")));
    }

    #[test]
    fn settings_toml_parses() {
        let raw = r#"
            [general]
            mode = "live"
            timezone = "UTC"
            paper_balance_usd = 1000.0

            [markets]
            symbols = ["BTC/USD", "ETH/USD"]

            [orchestrator]
            max_candidates = 2
        "#;
        let parsed: SettingsFile = toml::from_str(raw).unwrap();
        assert_eq!(parsed.general.mode, Mode::Live);
        assert_eq!(parsed.markets.symbols.len(), 2);
        assert_eq!(parsed.orchestrator.max_candidates, 2);
        // Unset sections keep defaults
        assert_eq!(parsed.orchestrator.max_revisions, 12);
    }
}
