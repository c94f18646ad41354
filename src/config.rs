// src/config.rs
//
// Session configuration for a tradelink deployment. Loaded from a single
// JSON document with four sections (trading_system, risk, exchanges,
// instruments); absent values fall back to named environment variables and
// then to typed defaults. Instruments without an explicit ticker id are
// assigned one from a monotonic counter at load time.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::types::{Qty, TickerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        TradingMode::Paper
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StrategyKind {
    #[serde(rename = "LIQUIDITY_TAKER")]
    LiquidityTaker,
    #[serde(rename = "MARKET_MAKER")]
    MarketMaker,
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::LiquidityTaker
    }
}

/// Per-strategy tuning knobs. Percentages are in percent (0.5 == 0.5%).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub use_bracket_orders: bool,
    pub stop_loss_percent: f64,
    pub target_percent: f64,
    pub use_vwap_filter: bool,
    /// Max |px/vwap - 1| tolerated on the chasing side.
    pub vwap_threshold: f64,
    pub min_volume_percentile: u8,
    /// Wall-clock trading window, "HH:MM:SS".
    pub trading_start_time: String,
    pub trading_end_time: String,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            use_bracket_orders: false,
            stop_loss_percent: 0.5,
            target_percent: 1.0,
            use_vwap_filter: false,
            vwap_threshold: 0.01,
            min_volume_percentile: 25,
            trading_start_time: "09:15:00".to_string(),
            trading_end_time: "15:30:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub parameters: StrategyParams,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::default(),
            parameters: StrategyParams::default(),
        }
    }
}

/// Knobs for the simulated execution path.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PaperTradingConfig {
    pub fill_probability: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Standard deviation of the relative fill-price perturbation.
    pub slippage_factor: f64,
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        Self {
            fill_probability: 1.0,
            min_latency_ms: 50,
            max_latency_ms: 200,
            slippage_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSystemConfig {
    pub trading_mode: TradingMode,
    pub strategy: StrategyConfig,
    pub paper_trading: PaperTradingConfig,
}

impl Default for TradingSystemConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::default(),
            strategy: StrategyConfig::default(),
            paper_trading: PaperTradingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_daily_loss: f64,
    pub max_position_value: f64,
    pub enforce_circuit_limits: bool,
    pub enforce_trading_hours: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: 0.0,
            max_position_value: 0.0,
            enforce_circuit_limits: true,
            enforce_trading_hours: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub user_id: String,
    pub totp_seed: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_credentials: ApiCredentials,
    /// Per-exchange paper-trading override; falls back to the
    /// trading_system section when absent.
    pub paper_trading: Option<PaperTradingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstrumentEntry {
    pub symbol: String,
    pub exchange: String,
    pub ticker_id: TickerId,
    pub is_futures: bool,
    pub expiry_date: Option<String>,
    /// Unit order size used by the strategy.
    pub clip: Qty,
    /// Aggressor-ratio threshold that arms the taker.
    pub threshold: f64,
    pub max_position: Qty,
    pub max_loss: f64,
}

impl Default for InstrumentEntry {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            exchange: String::new(),
            ticker_id: 0,
            is_futures: false,
            expiry_date: None,
            clip: 1,
            threshold: 0.6,
            max_position: 0,
            max_loss: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub trading_system: TradingSystemConfig,
    pub risk: RiskConfig,
    pub exchanges: HashMap<String, ExchangeConfig>,
    pub instruments: Vec<InstrumentEntry>,
}

impl SessionConfig {
    /// Load and normalize a session config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut cfg: SessionConfig =
            serde_json::from_str(raw).context("parsing session config")?;
        cfg.apply_env_overlays();
        cfg.assign_ticker_ids();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fill credential fields left blank in the JSON from environment
    /// variables named `TRADELINK_<EXCHANGE>_<FIELD>`.
    fn apply_env_overlays(&mut self) {
        for (name, exchange) in self.exchanges.iter_mut() {
            let creds = &mut exchange.api_credentials;
            overlay_env(&mut creds.api_key, name, "API_KEY");
            overlay_env(&mut creds.api_secret, name, "API_SECRET");
            overlay_env(&mut creds.user_id, name, "USER_ID");
            overlay_env(&mut creds.totp_seed, name, "TOTP_SEED");
            overlay_env(&mut creds.password, name, "PASSWORD");
        }
    }

    /// Any instrument with a zero ticker id gets the next free one.
    fn assign_ticker_ids(&mut self) {
        let mut next: TickerId = self
            .instruments
            .iter()
            .map(|i| i.ticker_id)
            .max()
            .unwrap_or(0)
            + 1;
        for instrument in self.instruments.iter_mut() {
            if instrument.ticker_id == 0 {
                instrument.ticker_id = next;
                next += 1;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for instrument in &self.instruments {
            if instrument.symbol.is_empty() {
                bail!("instrument entry with empty symbol");
            }
        }
        if self.trading_system.trading_mode == TradingMode::Live {
            for (name, exchange) in &self.exchanges {
                let creds = &exchange.api_credentials;
                if creds.api_key.is_empty() || creds.api_secret.is_empty() {
                    bail!("exchange {name}: api_key/api_secret required in LIVE mode");
                }
            }
        }
        Ok(())
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.get(name)
    }

    /// Effective paper-trading knobs for one exchange.
    pub fn paper_config(&self, exchange: &str) -> PaperTradingConfig {
        self.exchanges
            .get(exchange)
            .and_then(|e| e.paper_trading)
            .unwrap_or(self.trading_system.paper_trading)
    }
}

fn overlay_env(field: &mut String, exchange: &str, suffix: &str) {
    if field.is_empty() {
        let var = format!("TRADELINK_{}_{}", exchange.to_ascii_uppercase(), suffix);
        if let Ok(value) = std::env::var(&var) {
            if !value.is_empty() {
                *field = value;
            }
        }
    }
}
