// =============================================================================
// Bot Configuration — engine settings with serde defaults and atomic save
// =============================================================================
//
// Central configuration hub for the Vela trading engine.  Every tunable
// parameter lives here; per-symbol overrides (leverage, strategy modules,
// minimum risk-reward) sit in maps keyed by symbol.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::MarginType;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_leverage() -> u32 {
    1
}

fn default_max_risk_per_trade() -> f64 {
    0.01
}

fn default_max_positions() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> f64 {
    0.05
}

fn default_max_position_size_pct() -> f64 {
    0.25
}

fn default_signal_cooldown_secs() -> u64 {
    300
}

fn default_min_risk_reward() -> f64 {
    1.5
}

fn default_liquidation_timeout_secs() -> f64 {
    5.0
}

fn default_price_deviation_pct() -> f64 {
    0.01
}

fn default_trail_replace_min_pct() -> f64 {
    0.0005
}

fn default_backfill_limit() -> u32 {
    200
}

fn default_audit_dir() -> String {
    "audit".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

// =============================================================================
// Strategy module selection
// =============================================================================

/// A single determiner selection: registry name plus free-form parameters
/// interpreted by that determiner's factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeterminerSpec {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DeterminerSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// Per-symbol strategy assembly: one determiner of each kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub entry: DeterminerSpec,
    pub stop_loss: DeterminerSpec,
    pub take_profit: DeterminerSpec,
    pub exit: DeterminerSpec,
}

impl Default for ModuleSpec {
    fn default() -> Self {
        Self {
            entry: DeterminerSpec::named("ict"),
            stop_loss: DeterminerSpec::named("zone"),
            take_profit: DeterminerSpec::named("displacement"),
            exit: DeterminerSpec::named("trailing"),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the Vela engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Universe ------------------------------------------------------------

    /// Symbols the engine streams and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Per-symbol venue leverage (1..=125). Symbols absent from the map use 1.
    #[serde(default)]
    pub leverage: HashMap<String, u32>,

    /// Venue margin mode applied to every symbol at startup.
    #[serde(default)]
    pub margin_type: MarginType,

    // --- Risk ----------------------------------------------------------------

    /// Fraction of account equity risked per trade (0..=0.1).
    #[serde(default = "default_max_risk_per_trade")]
    pub max_risk_per_trade: f64,

    /// Maximum concurrent open positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// Daily halt threshold as a fraction of starting equity.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Notional cap as a fraction of account balance.
    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,

    /// Maximum tolerated |entry - mark| / mark at validation time.
    #[serde(default = "default_price_deviation_pct")]
    pub price_deviation_pct: f64,

    // --- Strategy ------------------------------------------------------------

    /// Per-symbol entry cooldown in seconds (60..=3600).
    #[serde(default = "default_signal_cooldown_secs")]
    pub signal_cooldown_secs: u64,

    /// Global minimum risk-reward ratio for entries (>= 1.0).
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,

    /// Per-symbol min-RR overrides.
    #[serde(default)]
    pub min_risk_reward_overrides: HashMap<String, f64>,

    /// Per-symbol determiner assembly. Symbols absent from the map use
    /// [`ModuleSpec::default`].
    #[serde(default)]
    pub strategy_modules: HashMap<String, ModuleSpec>,

    /// Minimum trailing-level move, as a fraction of price, before the
    /// protective stop is cancelled and re-placed.
    #[serde(default = "default_trail_replace_min_pct")]
    pub trail_replace_min_pct: f64,

    /// Candles requested per (symbol, interval) during warm-up (max 1000).
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: u32,

    // --- Shutdown ------------------------------------------------------------

    /// Close all positions during shutdown. Opt-out.
    #[serde(default = "default_true")]
    pub emergency_liquidation: bool,

    /// Total budget for the shutdown liquidation, in seconds.
    #[serde(default = "default_liquidation_timeout_secs")]
    pub liquidation_timeout_secs: f64,

    // --- Venue ---------------------------------------------------------------

    /// Use the venue testnet endpoints.
    #[serde(default)]
    pub testnet: bool,

    // --- Persistence ---------------------------------------------------------

    /// Directory receiving the daily-rotated audit JSON-line files.
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,

    /// Directory receiving the rotated human-readable trading log.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            leverage: HashMap::new(),
            margin_type: MarginType::Isolated,
            max_risk_per_trade: default_max_risk_per_trade(),
            max_positions: default_max_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_position_size_pct: default_max_position_size_pct(),
            price_deviation_pct: default_price_deviation_pct(),
            signal_cooldown_secs: default_signal_cooldown_secs(),
            min_risk_reward: default_min_risk_reward(),
            min_risk_reward_overrides: HashMap::new(),
            strategy_modules: HashMap::new(),
            trail_replace_min_pct: default_trail_replace_min_pct(),
            backfill_limit: default_backfill_limit(),
            emergency_liquidation: true,
            liquidation_timeout_secs: default_liquidation_timeout_secs(),
            testnet: false,
            audit_dir: default_audit_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            testnet = config.testnet,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Reject configurations that are out of the documented ranges before any
    /// component is built from them.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("config: `symbols` must not be empty");
        }
        if !(60..=3600).contains(&self.signal_cooldown_secs) {
            anyhow::bail!(
                "config: `signal_cooldown_secs` {} outside 60..=3600",
                self.signal_cooldown_secs
            );
        }
        if !(0.0..=0.1).contains(&self.max_risk_per_trade) {
            anyhow::bail!(
                "config: `max_risk_per_trade` {} outside 0.0..=0.1",
                self.max_risk_per_trade
            );
        }
        if self.min_risk_reward < 1.0 {
            anyhow::bail!(
                "config: `min_risk_reward` {} below 1.0",
                self.min_risk_reward
            );
        }
        for (symbol, rr) in &self.min_risk_reward_overrides {
            if *rr < 1.0 {
                anyhow::bail!("config: min RR override for {symbol} below 1.0: {rr}");
            }
        }
        for (symbol, lev) in &self.leverage {
            if !(1..=125).contains(lev) {
                anyhow::bail!("config: leverage for {symbol} outside 1..=125: {lev}");
            }
        }
        if self.liquidation_timeout_secs <= 0.0 {
            anyhow::bail!(
                "config: `liquidation_timeout_secs` must be positive, got {}",
                self.liquidation_timeout_secs
            );
        }
        if self.backfill_limit == 0 || self.backfill_limit > 1000 {
            anyhow::bail!(
                "config: `backfill_limit` {} outside 1..=1000",
                self.backfill_limit
            );
        }
        Ok(())
    }

    /// Leverage for a symbol, defaulting to 1 when not configured.
    pub fn leverage_for(&self, symbol: &str) -> u32 {
        self.leverage.get(symbol).copied().unwrap_or(default_leverage())
    }

    /// Minimum risk-reward for a symbol, honouring per-symbol overrides.
    pub fn min_rr_for(&self, symbol: &str) -> f64 {
        self.min_risk_reward_overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.min_risk_reward)
    }

    /// Determiner assembly for a symbol, falling back to the default set.
    pub fn modules_for(&self, symbol: &str) -> ModuleSpec {
        self.strategy_modules
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }
}
