//! Typed, validated, hot-reloadable configuration (C4).
//!
//! Precedence, highest first: command-line overrides, environment
//! variables, the YAML configuration file, compiled defaults.

mod substitution;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::SymbolConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskLimitsConfig {
    #[serde(default = "default_max_daily_drawdown")]
    pub max_daily_drawdown: f64,
    #[serde(default = "default_max_account_leverage")]
    pub max_account_leverage: f64,
    #[serde(default = "default_drawdown_warning")]
    pub drawdown_warning: f64,
    #[serde(default = "default_leverage_warning")]
    pub leverage_warning: f64,
    #[serde(default)]
    pub kill_switch_mode: KillSwitchMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchMode {
    #[default]
    Auto,
    Manual,
}

fn default_max_daily_drawdown() -> f64 {
    0.02
}
fn default_max_account_leverage() -> f64 {
    5.0
}
fn default_drawdown_warning() -> f64 {
    0.015
}
fn default_leverage_warning() -> f64 {
    4.0
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            max_daily_drawdown: default_max_daily_drawdown(),
            max_account_leverage: default_max_account_leverage(),
            drawdown_warning: default_drawdown_warning(),
            leverage_warning: default_leverage_warning(),
            kill_switch_mode: KillSwitchMode::Auto,
        }
    }
}

impl RiskLimitsConfig {
    fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("max_daily_drawdown", self.max_daily_drawdown),
            ("max_account_leverage", self.max_account_leverage),
            ("drawdown_warning", self.drawdown_warning),
            ("leverage_warning", self.leverage_warning),
        ] {
            if !(v > 0.0) {
                return Err(format!("risk.{name} must be > 0, got {v}"));
            }
        }
        if self.drawdown_warning >= self.max_daily_drawdown {
            return Err("risk.drawdown_warning must be < max_daily_drawdown".into());
        }
        if self.leverage_warning >= self.max_account_leverage {
            return Err("risk.leverage_warning must be < max_account_leverage".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl GatewayConfig {
    fn validate(&self) -> Result<(), String> {
        parse_host_port(&self.endpoint)
            .map(|_| ())
            .ok_or_else(|| format!("gateway.endpoint is not host:port: {}", self.endpoint))
    }
}

fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketDataConfig {
    pub endpoint: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size_per_symbol: usize,
}

fn default_buffer_size() -> usize {
    1024
}

impl MarketDataConfig {
    fn validate(&self) -> Result<(), String> {
        parse_host_port(&self.endpoint)
            .map(|_| ())
            .ok_or_else(|| format!("market_data.endpoint is not host:port: {}", self.endpoint))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommonConfig {
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub circuit_breaker_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TradingConfig {
    #[serde(default = "default_theta")]
    pub score_threshold: f64,
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    #[serde(default = "default_slippage_pips")]
    pub slippage_pips: f64,
}

fn default_theta() -> f64 {
    0.5
}
fn default_risk_per_trade() -> f64 {
    0.01
}
fn default_slippage_pips() -> f64 {
    1.0
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_theta(),
            risk_per_trade: default_risk_per_trade(),
            slippage_pips: default_slippage_pips(),
        }
    }
}

/// The fully typed, validated configuration tree (YAML top-level keys:
/// `common`, `symbols`, `trading`, `risk`, `gateway`, `market_data`,
/// `logging`, `metadata`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskLimitsConfig,
    pub gateway: GatewayConfig,
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.risk.validate()?;
        self.gateway.validate()?;
        self.market_data.validate()?;
        let mut seen = std::collections::HashSet::new();
        for s in &self.symbols {
            s.validate()?;
            if !seen.insert(s.symbol.clone()) {
                return Err(format!("duplicate symbol in config: {}", s.symbol));
            }
        }
        Ok(())
    }

    /// Which fields may change on hot reload without an administrative
    /// restart: symbol enablement (next tick) and risk limits (immediately).
    /// Endpoint changes are rejected outright.
    fn check_hot_reload_compatible(&self, incoming: &AppConfig) -> Result<(), String> {
        if self.gateway.endpoint != incoming.gateway.endpoint {
            return Err("gateway.endpoint cannot change via hot reload".into());
        }
        if self.market_data.endpoint != incoming.market_data.endpoint {
            return Err("market_data.endpoint cannot change via hot reload".into());
        }
        Ok(())
    }
}

/// CLI overrides; layered on top of environment variables and the YAML file.
#[derive(Debug, Parser)]
#[command(name = "executor", about = "MT5-CRS core executor")]
pub struct CliArgs {
    /// Path to the YAML configuration file.
    #[arg(long, env = "EXECUTOR_CONFIG_PATH", default_value = "config.yaml")]
    pub config_path: PathBuf,

    /// Overrides gateway.endpoint.
    #[arg(long, env = "EXECUTOR_GATEWAY_ENDPOINT")]
    pub gateway_endpoint: Option<String>,

    /// Overrides risk.max_daily_drawdown.
    #[arg(long, env = "EXECUTOR_MAX_DAILY_DRAWDOWN")]
    pub max_daily_drawdown: Option<f64>,

    /// Overrides risk.max_account_leverage.
    #[arg(long, env = "EXECUTOR_MAX_ACCOUNT_LEVERAGE")]
    pub max_account_leverage: Option<f64>,

    /// Overrides common.circuit_breaker_path.
    #[arg(long, env = "EXECUTOR_CIRCUIT_BREAKER_PATH")]
    pub circuit_breaker_path: Option<String>,
}

/// Loads `.env`, parses CLI args, reads the YAML file, applies
/// `${NAME}`/`${NAME:default}` substitution, then layers CLI overrides on
/// top. Returns the validated config or a descriptive error.
pub fn load(args: &CliArgs) -> anyhow::Result<AppConfig> {
    dotenv::dotenv().ok();

    let raw = std::fs::read_to_string(&args.config_path)
        .map_err(|e| anyhow::anyhow!("reading config file {:?}: {e}", args.config_path))?;
    let substituted = substitution::substitute_env(&raw)?;
    let mut config: AppConfig = serde_yaml::from_str(&substituted)
        .map_err(|e| anyhow::anyhow!("parsing YAML config: {e}"))?;

    if let Some(endpoint) = &args.gateway_endpoint {
        config.gateway.endpoint = endpoint.clone();
    }
    if let Some(v) = args.max_daily_drawdown {
        config.risk.max_daily_drawdown = v;
    }
    if let Some(v) = args.max_account_leverage {
        config.risk.max_account_leverage = v;
    }
    if let Some(p) = &args.circuit_breaker_path {
        config.common.circuit_breaker_path = Some(p.clone());
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {e}"))?;
    Ok(config)
}

/// Holds the active configuration behind a single atomically-swapped
/// pointer (spec.md 9: "prefer an immutable config value swapped behind a
/// single pointer"), plus a poll-driven reload loop.
pub struct ConfigCenter {
    path: PathBuf,
    active: ArcSwap<AppConfig>,
    last_mtime_secs: AtomicI64,
}

impl ConfigCenter {
    pub fn new(path: impl Into<PathBuf>, initial: AppConfig) -> Self {
        let path = path.into();
        let mtime = file_mtime_secs(&path).unwrap_or(0);
        Self {
            path,
            active: ArcSwap::from_pointee(initial),
            last_mtime_secs: AtomicI64::new(mtime),
        }
    }

    pub fn current(&self) -> std::sync::Arc<AppConfig> {
        self.active.load_full()
    }

    /// Re-reads the YAML file, validates, and atomically swaps the active
    /// configuration if it is hot-reload compatible. Returns `Ok(false)` if
    /// nothing changed (mtime unchanged).
    pub fn reload(&self) -> anyhow::Result<bool> {
        let Some(mtime) = file_mtime_secs(&self.path) else {
            return Ok(false);
        };
        if mtime == self.last_mtime_secs.load(Ordering::Acquire) {
            return Ok(false);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let substituted = substitution::substitute_env(&raw)?;
        let incoming: AppConfig = serde_yaml::from_str(&substituted)?;
        incoming
            .validate()
            .map_err(|e| anyhow::anyhow!("reload validation failed: {e}"))?;

        let current = self.active.load();
        current
            .check_hot_reload_compatible(&incoming)
            .map_err(|e| anyhow::anyhow!("reload rejected: {e}"))?;

        self.active.store(std::sync::Arc::new(incoming));
        self.last_mtime_secs.store(mtime, Ordering::Release);
        info!("config hot-reloaded");
        Ok(true)
    }

    /// Polls for file changes on an interval, mirroring the teacher's
    /// `tokio::time::interval` idiom used throughout its background tasks.
    pub async fn run_reload_loop(self: std::sync::Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reload() {
                warn!(error = %e, "config reload failed, keeping previous configuration");
            }
        }
    }
}

fn file_mtime_secs(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    Some(secs as i64)
}
