// =============================================================================
// Composite Strategy — orchestrates the four determiners for one symbol
// =============================================================================
//
// Pipeline on each candle:
//   1. Route the candle into the per-interval buffer (symbol + declared
//      interval filtering happens here; foreign candles are dropped).
//   2. analyze: entry.decide -> PriceContext from the decision's extras ->
//      stop_loss.compute -> take_profit.compute -> geometry validation ->
//      minimum risk-reward gate -> entry Signal (quantity left unset).
//   3. should_exit: delegate to the exit determiner, which owns trailing
//      state per (symbol, side).
//
// Every symbol owns its own CompositeStrategy with its own determiner
// instances; nothing here is shared across symbols.
// =============================================================================

use tracing::{info, warn};

use crate::market_data::Candle;
use crate::position::Position;
use crate::strategy::buffer::{StrategyBuffers, DEFAULT_BUFFER_CAPACITY};
use crate::strategy::module::{ModuleConfig, PriceContext};
use crate::types::Signal;

/// Minimum closed candles per declared interval before the strategy acts.
pub const DEFAULT_MIN_DEPTH: usize = 50;

/// A per-symbol strategy assembled from a [`ModuleConfig`].
pub struct CompositeStrategy {
    symbol: String,
    name: String,
    buffers: StrategyBuffers,
    config: ModuleConfig,
    min_risk_reward: f64,
}

impl CompositeStrategy {
    pub fn new(symbol: impl Into<String>, config: ModuleConfig, min_risk_reward: f64) -> Self {
        Self::with_depth(symbol, config, min_risk_reward, DEFAULT_MIN_DEPTH)
    }

    pub fn with_depth(
        symbol: impl Into<String>,
        config: ModuleConfig,
        min_risk_reward: f64,
        min_depth: usize,
    ) -> Self {
        let symbol = symbol.into();
        let name = format!(
            "{}/{}/{}/{}",
            config.entry.name(),
            config.stop_loss.name(),
            config.take_profit.name(),
            config.exit.name()
        );
        let buffers = StrategyBuffers::new(
            &config.aggregated_requirements,
            DEFAULT_BUFFER_CAPACITY,
            min_depth,
        );
        Self {
            symbol,
            name,
            buffers,
            config,
            min_risk_reward,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interval tags this strategy needs streamed and backfilled.
    pub fn requirements(&self) -> impl Iterator<Item = &String> {
        self.config.aggregated_requirements.iter()
    }

    // -------------------------------------------------------------------------
    // Buffer management
    // -------------------------------------------------------------------------

    /// Insert a candle. Candles for other symbols or undeclared intervals are
    /// rejected; the caller (dispatcher or backfill) relies on this filter.
    pub fn update_buffer(&mut self, candle: Candle) -> bool {
        if candle.symbol != self.symbol {
            return false;
        }
        self.buffers.update(candle)
    }

    /// True when every declared interval holds the minimum closed depth.
    pub fn is_ready(&self) -> bool {
        self.buffers.is_ready()
    }

    // -------------------------------------------------------------------------
    // Entry analysis
    // -------------------------------------------------------------------------

    /// Evaluate the latest candle for an entry. Returns a fully-populated
    /// entry signal with the quantity left unset (the coordinator sizes it).
    pub fn analyze(&mut self, candle: &Candle) -> Option<Signal> {
        if !self.is_ready() {
            return None;
        }

        let decision = self.config.entry.decide(&self.buffers, candle)?;

        let side = decision.kind.position_side();
        let ctx = PriceContext::new(
            self.symbol.clone(),
            side,
            decision.entry_price,
            decision.price_extras.clone(),
        );

        let stop_loss = self.config.stop_loss.compute(&ctx);
        let take_profit = self.config.take_profit.compute(&ctx, stop_loss);

        let signal = match Signal::entry(
            decision.kind,
            self.symbol.clone(),
            candle.close_time,
            decision.entry_price,
            stop_loss,
            take_profit,
            self.name.clone(),
        ) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "entry discarded — invalid SL/TP geometry");
                return None;
            }
        };

        let rr = signal.risk_reward.unwrap_or(0.0);
        if rr < self.min_risk_reward {
            info!(
                symbol = %self.symbol,
                risk_reward = rr,
                min_risk_reward = self.min_risk_reward,
                "entry discarded — risk-reward below minimum"
            );
            return None;
        }

        info!(
            symbol = %self.symbol,
            kind = %signal.kind,
            entry_price = signal.entry_price,
            stop_loss,
            take_profit,
            risk_reward = rr,
            confidence = decision.confidence,
            metadata = ?decision.metadata,
            "entry signal generated"
        );
        Some(signal)
    }

    // -------------------------------------------------------------------------
    // Exit analysis
    // -------------------------------------------------------------------------

    /// Evaluate whether the open position should be closed.
    pub fn should_exit(&mut self, position: &Position, candle: &Candle) -> Option<Signal> {
        if !self.is_ready() {
            return None;
        }

        let mut signal = self
            .config
            .exit
            .evaluate(position, candle, &self.buffers)?;
        signal.strategy = self.name.clone();
        Some(signal)
    }

    /// The exit determiner's current trailing level for the position, used by
    /// the dispatcher to decide on protective-stop replacement.
    pub fn trailing_level(&self, position: &Position) -> Option<f64> {
        self.config.exit.trailing_level(position)
    }
}

impl std::fmt::Debug for CompositeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeStrategy")
            .field("symbol", &self.symbol)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::determiners::stop_loss::{ZoneStop, ZoneStopParams};
    use crate::determiners::take_profit::{DisplacementTarget, DisplacementTargetParams};
    use crate::strategy::module::{
        EntryDecision, EntryDeterminer, ExitDeterminer, StopLossDeterminer, TakeProfitDeterminer,
    };
    use crate::types::{ExitReason, PositionSide, SignalKind};
    use std::collections::BTreeSet;

    fn candle(close_time: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "5m".into(),
            open_time: close_time - 300_000,
            close_time,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1.0,
            is_closed: true,
        }
    }

    /// Entry stub that always fires a long with empty extras.
    struct AlwaysLong;
    impl EntryDeterminer for AlwaysLong {
        fn name(&self) -> &'static str {
            "always_long"
        }
        fn required_intervals(&self) -> BTreeSet<String> {
            ["5m".to_string()].into_iter().collect()
        }
        fn decide(&mut self, _: &StrategyBuffers, candle: &Candle) -> Option<EntryDecision> {
            Some(EntryDecision::new(SignalKind::EntryLong, candle.close, 0.9))
        }
    }

    struct NeverEntry;
    impl EntryDeterminer for NeverEntry {
        fn name(&self) -> &'static str {
            "never"
        }
        fn required_intervals(&self) -> BTreeSet<String> {
            ["5m".to_string()].into_iter().collect()
        }
        fn decide(&mut self, _: &StrategyBuffers, _: &Candle) -> Option<EntryDecision> {
            None
        }
    }

    /// SL stub pinning a specific price.
    struct FixedSl(f64);
    impl StopLossDeterminer for FixedSl {
        fn name(&self) -> &'static str {
            "fixed_sl"
        }
        fn compute(&self, _: &PriceContext) -> f64 {
            self.0
        }
    }

    struct FixedTp(f64);
    impl TakeProfitDeterminer for FixedTp {
        fn name(&self) -> &'static str {
            "fixed_tp"
        }
        fn compute(&self, _: &PriceContext, _: f64) -> f64 {
            self.0
        }
    }

    struct ExitAlways;
    impl ExitDeterminer for ExitAlways {
        fn name(&self) -> &'static str {
            "exit_always"
        }
        fn evaluate(
            &mut self,
            position: &Position,
            candle: &Candle,
            _: &StrategyBuffers,
        ) -> Option<Signal> {
            Some(Signal::exit(
                SignalKind::ExitLong,
                &position.symbol,
                candle.close_time,
                candle.close,
                "stub",
                ExitReason::IndicatorReversal,
            ))
        }
    }

    struct ExitNever;
    impl ExitDeterminer for ExitNever {
        fn name(&self) -> &'static str {
            "exit_never"
        }
        fn evaluate(&mut self, _: &Position, _: &Candle, _: &StrategyBuffers) -> Option<Signal> {
            None
        }
    }

    fn strategy_with(
        entry: Box<dyn EntryDeterminer>,
        sl: Box<dyn StopLossDeterminer>,
        tp: Box<dyn TakeProfitDeterminer>,
        exit: Box<dyn ExitDeterminer>,
        min_rr: f64,
        min_depth: usize,
    ) -> CompositeStrategy {
        CompositeStrategy::with_depth(
            "BTCUSDT",
            ModuleConfig::new(entry, sl, tp, exit),
            min_rr,
            min_depth,
        )
    }

    fn warm_up(strategy: &mut CompositeStrategy, count: usize) {
        for i in 0..count {
            strategy.update_buffer(candle((i as i64 + 1) * 300_000, 100.0));
        }
    }

    #[test]
    fn not_ready_short_circuits_analyze_and_should_exit() {
        let mut s = strategy_with(
            Box::new(AlwaysLong),
            Box::new(FixedSl(99.0)),
            Box::new(FixedTp(102.0)),
            Box::new(ExitAlways),
            1.5,
            10,
        );
        warm_up(&mut s, 5); // below min depth
        assert!(!s.is_ready());
        assert!(s.analyze(&candle(3_000_000, 100.0)).is_none());

        let mut pos = Position::flat("BTCUSDT");
        pos.side = PositionSide::Long;
        pos.quantity = 1.0;
        pos.entry_price = 100.0;
        assert!(s.should_exit(&pos, &candle(3_000_000, 100.0)).is_none());
    }

    #[test]
    fn analyze_produces_sized_free_signal() {
        let mut s = strategy_with(
            Box::new(AlwaysLong),
            Box::new(FixedSl(99.0)),
            Box::new(FixedTp(102.0)),
            Box::new(ExitNever),
            1.5,
            3,
        );
        warm_up(&mut s, 3);

        let sig = s.analyze(&candle(2_000_000, 100.0)).expect("entry signal");
        assert_eq!(sig.kind, SignalKind::EntryLong);
        assert_eq!(sig.stop_loss, Some(99.0));
        assert_eq!(sig.take_profit, Some(102.0));
        assert!(sig.quantity.is_none());
        assert_eq!(sig.strategy, "always_long/fixed_sl/fixed_tp/exit_never");
    }

    #[test]
    fn min_risk_reward_gate_rejects_thin_trades() {
        // RR = (101 - 100) / (100 - 99) = 1.0 < 1.5.
        let mut s = strategy_with(
            Box::new(AlwaysLong),
            Box::new(FixedSl(99.0)),
            Box::new(FixedTp(101.0)),
            Box::new(ExitNever),
            1.5,
            3,
        );
        warm_up(&mut s, 3);
        assert!(s.analyze(&candle(2_000_000, 100.0)).is_none());
    }

    #[test]
    fn invalid_geometry_is_discarded() {
        // SL above entry for a long.
        let mut s = strategy_with(
            Box::new(AlwaysLong),
            Box::new(FixedSl(102.0)),
            Box::new(FixedTp(105.0)),
            Box::new(ExitNever),
            1.5,
            3,
        );
        warm_up(&mut s, 3);
        assert!(s.analyze(&candle(2_000_000, 100.0)).is_none());
    }

    #[test]
    fn fallback_pricing_yields_one_percent_sl_and_double_rr_tp() {
        // Real pricing determiners, empty extras: entry 100 -> SL 99, TP 102.
        let mut s = strategy_with(
            Box::new(AlwaysLong),
            Box::new(ZoneStop::new(ZoneStopParams::default())),
            Box::new(DisplacementTarget::new(DisplacementTargetParams::default())),
            Box::new(ExitNever),
            1.5,
            3,
        );
        warm_up(&mut s, 3);

        let sig = s.analyze(&candle(2_000_000, 100.0)).expect("entry signal");
        assert!((sig.stop_loss.unwrap() - 99.0).abs() < 1e-9);
        assert!((sig.take_profit.unwrap() - 102.0).abs() < 1e-9);
        assert!((sig.risk_reward.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn foreign_symbol_candles_never_enter_buffers() {
        let mut s = strategy_with(
            Box::new(AlwaysLong),
            Box::new(FixedSl(99.0)),
            Box::new(FixedTp(102.0)),
            Box::new(ExitNever),
            1.5,
            1,
        );
        let mut c = candle(300_000, 100.0);
        c.symbol = "ETHUSDT".into();
        assert!(!s.update_buffer(c));
        assert!(!s.is_ready());
    }

    #[test]
    fn should_exit_rebrands_signal_with_strategy_name() {
        let mut s = strategy_with(
            Box::new(NeverEntry),
            Box::new(FixedSl(99.0)),
            Box::new(FixedTp(102.0)),
            Box::new(ExitAlways),
            1.5,
            2,
        );
        warm_up(&mut s, 2);

        let mut pos = Position::flat("BTCUSDT");
        pos.side = PositionSide::Long;
        pos.quantity = 1.0;
        pos.entry_price = 100.0;

        let sig = s
            .should_exit(&pos, &candle(1_200_000, 101.0))
            .expect("exit signal");
        assert_eq!(sig.exit_reason, Some(ExitReason::IndicatorReversal));
        assert_eq!(sig.strategy, "never/fixed_sl/fixed_tp/exit_always");
    }
}
