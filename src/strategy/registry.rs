// =============================================================================
// Module Registry — named determiner factories and per-symbol assembly
// =============================================================================
//
// A process-wide map from determiner names to factory closures, populated
// once during initialisation.  `assemble` builds a fresh determiner instance
// of each kind for the requested symbol, so no mutable determiner state is
// ever shared between symbols.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::config::ModuleSpec;
use crate::determiners::entry::{IctEntry, IctEntryParams};
use crate::determiners::exit::{TrailingExit, TrailingExitParams};
use crate::determiners::stop_loss::{PercentStop, PercentStopParams, ZoneStop, ZoneStopParams};
use crate::determiners::take_profit::{
    DisplacementTarget, DisplacementTargetParams, RrTarget, RrTargetParams,
};
use crate::determiners::parse_params;
use crate::strategy::composite::CompositeStrategy;
use crate::strategy::module::{
    EntryDeterminer, ExitDeterminer, ModuleConfig, StopLossDeterminer, TakeProfitDeterminer,
};

type EntryFactory = Box<dyn Fn(&str, &Value) -> Result<Box<dyn EntryDeterminer>> + Send + Sync>;
type StopFactory = Box<dyn Fn(&str, &Value) -> Result<Box<dyn StopLossDeterminer>> + Send + Sync>;
type TargetFactory =
    Box<dyn Fn(&str, &Value) -> Result<Box<dyn TakeProfitDeterminer>> + Send + Sync>;
type ExitFactory = Box<dyn Fn(&str, &Value) -> Result<Box<dyn ExitDeterminer>> + Send + Sync>;

/// Registry of determiner factories, keyed by the names used in config.
pub struct ModuleRegistry {
    entries: HashMap<String, EntryFactory>,
    stops: HashMap<String, StopFactory>,
    targets: HashMap<String, TargetFactory>,
    exits: HashMap<String, ExitFactory>,
}

impl ModuleRegistry {
    /// An empty registry (tests register their own factories).
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            stops: HashMap::new(),
            targets: HashMap::new(),
            exits: HashMap::new(),
        }
    }

    /// The built-in determiner set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_entry("ict", |symbol, params| {
            let params: IctEntryParams = parse_params(params, "ict")?;
            Ok(Box::new(IctEntry::new(symbol, params)))
        });

        registry.register_stop_loss("zone", |_symbol, params| {
            let params: ZoneStopParams = parse_params(params, "zone")?;
            Ok(Box::new(ZoneStop::new(params)))
        });
        registry.register_stop_loss("percent", |_symbol, params| {
            let params: PercentStopParams = parse_params(params, "percent")?;
            Ok(Box::new(PercentStop::new(params)))
        });

        registry.register_take_profit("displacement", |_symbol, params| {
            let params: DisplacementTargetParams = parse_params(params, "displacement")?;
            Ok(Box::new(DisplacementTarget::new(params)))
        });
        registry.register_take_profit("rr", |_symbol, params| {
            let params: RrTargetParams = parse_params(params, "rr")?;
            Ok(Box::new(RrTarget::new(params)))
        });

        registry.register_exit("trailing", |_symbol, params| {
            let params: TrailingExitParams = parse_params(params, "trailing")?;
            Ok(Box::new(TrailingExit::new(params)))
        });

        registry
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    pub fn register_entry(
        &mut self,
        name: &str,
        factory: impl Fn(&str, &Value) -> Result<Box<dyn EntryDeterminer>> + Send + Sync + 'static,
    ) {
        self.entries.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_stop_loss(
        &mut self,
        name: &str,
        factory: impl Fn(&str, &Value) -> Result<Box<dyn StopLossDeterminer>> + Send + Sync + 'static,
    ) {
        self.stops.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_take_profit(
        &mut self,
        name: &str,
        factory: impl Fn(&str, &Value) -> Result<Box<dyn TakeProfitDeterminer>>
            + Send
            + Sync
            + 'static,
    ) {
        self.targets.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_exit(
        &mut self,
        name: &str,
        factory: impl Fn(&str, &Value) -> Result<Box<dyn ExitDeterminer>> + Send + Sync + 'static,
    ) {
        self.exits.insert(name.to_string(), Box::new(factory));
    }

    // -------------------------------------------------------------------------
    // Assembly
    // -------------------------------------------------------------------------

    /// Build a fresh [`ModuleConfig`] for `symbol` from the named specs.
    pub fn assemble(&self, symbol: &str, spec: &ModuleSpec) -> Result<ModuleConfig> {
        let entry = self
            .entries
            .get(&spec.entry.name)
            .with_context(|| self.unknown("entry", &spec.entry.name, self.entries.keys()))?(
            symbol,
            &spec.entry.params,
        )?;
        let stop_loss = self
            .stops
            .get(&spec.stop_loss.name)
            .with_context(|| self.unknown("stop_loss", &spec.stop_loss.name, self.stops.keys()))?(
            symbol,
            &spec.stop_loss.params,
        )?;
        let take_profit = self.targets.get(&spec.take_profit.name).with_context(|| {
            self.unknown("take_profit", &spec.take_profit.name, self.targets.keys())
        })?(symbol, &spec.take_profit.params)?;
        let exit = self
            .exits
            .get(&spec.exit.name)
            .with_context(|| self.unknown("exit", &spec.exit.name, self.exits.keys()))?(
            symbol,
            &spec.exit.params,
        )?;

        let config = ModuleConfig::new(entry, stop_loss, take_profit, exit);
        debug!(
            symbol,
            requirements = ?config.aggregated_requirements,
            "strategy modules assembled"
        );
        Ok(config)
    }

    /// Assemble and wrap into a ready-to-register [`CompositeStrategy`].
    pub fn build_strategy(
        &self,
        symbol: &str,
        spec: &ModuleSpec,
        min_risk_reward: f64,
    ) -> Result<CompositeStrategy> {
        let config = self.assemble(symbol, spec)?;
        Ok(CompositeStrategy::new(symbol, config, min_risk_reward))
    }

    fn unknown<'a>(
        &self,
        kind: &str,
        name: &str,
        known: impl Iterator<Item = &'a String>,
    ) -> String {
        let mut names: Vec<&str> = known.map(String::as_str).collect();
        names.sort_unstable();
        format!("unknown {kind} determiner '{name}' (known: {})", names.join(", "))
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("entries", &self.entries.len())
            .field("stops", &self.stops.len())
            .field("targets", &self.targets.len())
            .field("exits", &self.exits.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeterminerSpec;
    use crate::strategy::module::PriceContext;
    use crate::types::PositionSide;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    #[test]
    fn builtin_default_spec_assembles() {
        let registry = ModuleRegistry::with_builtins();
        let config = registry.assemble("BTCUSDT", &ModuleSpec::default()).unwrap();
        assert_eq!(config.entry.name(), "ict");
        assert_eq!(config.stop_loss.name(), "zone");
        assert_eq!(config.take_profit.name(), "displacement");
        assert_eq!(config.exit.name(), "trailing");
        // The ICT entry drives the aggregated requirements.
        assert!(config.aggregated_requirements.contains("5m"));
        assert!(config.aggregated_requirements.contains("1h"));
    }

    #[test]
    fn unknown_determiner_is_a_config_error() {
        let registry = ModuleRegistry::with_builtins();
        let mut spec = ModuleSpec::default();
        spec.stop_loss = DeterminerSpec::named("nonexistent");
        let err = registry.assemble("BTCUSDT", &spec).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn params_reach_the_determiner() {
        let registry = ModuleRegistry::with_builtins();
        let mut spec = ModuleSpec::default();
        spec.stop_loss = DeterminerSpec {
            name: "percent".to_string(),
            params: json!({ "pct": 0.02 }),
        };
        let config = registry.assemble("BTCUSDT", &spec).unwrap();

        let ctx = PriceContext::new("BTCUSDT", PositionSide::Long, 100.0, StdHashMap::new());
        let sl = config.stop_loss.compute(&ctx);
        assert!((sl - 98.0).abs() < 1e-9);
    }

    #[test]
    fn bad_params_are_rejected() {
        let registry = ModuleRegistry::with_builtins();
        let mut spec = ModuleSpec::default();
        spec.take_profit = DeterminerSpec {
            name: "rr".to_string(),
            params: json!({ "rr": "not a number" }),
        };
        assert!(registry.assemble("BTCUSDT", &spec).is_err());
    }

    #[test]
    fn build_strategy_binds_symbol() {
        let registry = ModuleRegistry::with_builtins();
        let strategy = registry
            .build_strategy("ETHUSDT", &ModuleSpec::default(), 1.5)
            .unwrap();
        assert_eq!(strategy.symbol(), "ETHUSDT");
        assert_eq!(strategy.name(), "ict/zone/displacement/trailing");
    }
}
