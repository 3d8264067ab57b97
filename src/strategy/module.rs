// =============================================================================
// Strategy Modules — the four-determiner contract
// =============================================================================
//
// A composable strategy is assembled from one determiner of each kind:
//
//   Entry       buffers + latest candle  ->  Option<EntryDecision>
//   StopLoss    PriceContext             ->  SL price
//   TakeProfit  PriceContext             ->  TP price
//   Exit        position + candle + buffers -> Option<Signal>
//
// Compatibility between determiners is carried purely through `price_extras`
// keys: every pairing is technically valid, and pricing determiners fall
// back to percentage / RR-multiple defaults when the extras they want are
// absent.  The `metadata` map is for logging only and never reaches pricing.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::market_data::Candle;
use crate::position::Position;
use crate::strategy::buffer::StrategyBuffers;
use crate::types::{PositionSide, Signal, SignalKind};

// ---------------------------------------------------------------------------
// EntryDecision
// ---------------------------------------------------------------------------

/// Output of an entry determiner.
///
/// `metadata` is public context for logging; `price_extras` is forwarded
/// unchanged into [`PriceContext::extras`] for the pricing determiners. The
/// split keeps log-intended fields out of pricing and vice-versa.
#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub kind: SignalKind,
    pub entry_price: f64,
    /// 0.0..=1.0 conviction, logged alongside the signal.
    pub confidence: f64,
    pub metadata: HashMap<String, Value>,
    pub price_extras: HashMap<String, Value>,
}

impl EntryDecision {
    pub fn new(kind: SignalKind, entry_price: f64, confidence: f64) -> Self {
        debug_assert!(kind.is_entry());
        Self {
            kind,
            entry_price,
            confidence,
            metadata: HashMap::new(),
            price_extras: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.price_extras.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// PriceContext
// ---------------------------------------------------------------------------

/// Frozen pricing input handed to SL and TP determiners.
///
/// Decouples the pricing contract from any specific entry implementation:
/// detector-produced data travels only through `extras`.
#[derive(Debug, Clone)]
pub struct PriceContext {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub extras: HashMap<String, Value>,
}

impl PriceContext {
    pub fn new(
        symbol: impl Into<String>,
        side: PositionSide,
        entry_price: f64,
        extras: HashMap<String, Value>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price,
            extras,
        }
    }

    /// Numeric extra lookup; absent or non-numeric keys yield `None`.
    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extras.get(key).and_then(Value::as_f64)
    }

    /// Nested numeric lookup for object-valued extras (e.g. a zone's bound).
    pub fn extra_field_f64(&self, key: &str, field: &str) -> Option<f64> {
        self.extras.get(key)?.get(field)?.as_f64()
    }
}

// ---------------------------------------------------------------------------
// Determiner traits
// ---------------------------------------------------------------------------

/// Decides whether the latest candle constitutes an entry.
pub trait EntryDeterminer: Send {
    fn name(&self) -> &'static str;

    /// Interval tags this determiner needs buffered and backfilled.
    fn required_intervals(&self) -> BTreeSet<String>;

    fn decide(&mut self, buffers: &StrategyBuffers, candle: &Candle) -> Option<EntryDecision>;
}

/// Computes the protective stop price for a candidate entry.
pub trait StopLossDeterminer: Send {
    fn name(&self) -> &'static str;

    fn required_intervals(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Must return a price on the protective side of the entry; determiners
    /// fall back to a percentage distance when their extras are absent.
    fn compute(&self, ctx: &PriceContext) -> f64;
}

/// Computes the take-profit price for a candidate entry.
pub trait TakeProfitDeterminer: Send {
    fn name(&self) -> &'static str;

    fn required_intervals(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Must return a price on the profit side of the entry; determiners fall
    /// back to an RR multiple of the SL distance when their extras are absent.
    fn compute(&self, ctx: &PriceContext, stop_loss: f64) -> f64;
}

/// Evaluates whether an open position should be closed, and owns any
/// trailing-level state (keyed per (symbol, side) internally).
pub trait ExitDeterminer: Send {
    fn name(&self) -> &'static str;

    fn required_intervals(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn evaluate(
        &mut self,
        position: &Position,
        candle: &Candle,
        buffers: &StrategyBuffers,
    ) -> Option<Signal>;

    /// Current trailing stop level for the position, if this determiner
    /// trails. The dispatcher compares successive levels to decide whether
    /// the venue-side protective stop needs replacing.
    fn trailing_level(&self, _position: &Position) -> Option<f64> {
        None
    }
}

// ---------------------------------------------------------------------------
// ModuleConfig
// ---------------------------------------------------------------------------

/// A per-symbol determiner assembly plus the union of all declared interval
/// requirements.
pub struct ModuleConfig {
    pub entry: Box<dyn EntryDeterminer>,
    pub stop_loss: Box<dyn StopLossDeterminer>,
    pub take_profit: Box<dyn TakeProfitDeterminer>,
    pub exit: Box<dyn ExitDeterminer>,
    pub aggregated_requirements: BTreeSet<String>,
}

impl ModuleConfig {
    /// Assemble the config, deriving `aggregated_requirements` by unioning
    /// each determiner's declared intervals.
    pub fn new(
        entry: Box<dyn EntryDeterminer>,
        stop_loss: Box<dyn StopLossDeterminer>,
        take_profit: Box<dyn TakeProfitDeterminer>,
        exit: Box<dyn ExitDeterminer>,
    ) -> Self {
        let mut aggregated_requirements = entry.required_intervals();
        aggregated_requirements.extend(stop_loss.required_intervals());
        aggregated_requirements.extend(take_profit.required_intervals());
        aggregated_requirements.extend(exit.required_intervals());

        Self {
            entry,
            stop_loss,
            take_profit,
            exit,
            aggregated_requirements,
        }
    }
}

impl std::fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("entry", &self.entry.name())
            .field("stop_loss", &self.stop_loss.name())
            .field("take_profit", &self.take_profit.name())
            .field("exit", &self.exit.name())
            .field("aggregated_requirements", &self.aggregated_requirements)
            .finish()
    }
}
