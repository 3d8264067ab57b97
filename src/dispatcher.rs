// =============================================================================
// Dispatcher — routes candle events to per-symbol strategies
// =============================================================================
//
// Subscribed to both candle tags on the data queue.  For each candle:
//
//   1. Route by symbol; unknown symbols are dropped with a debug note, and
//      intervals the strategy never declared are filtered out before its
//      buffers are touched.
//   2. Symbol holds an open position  -> should_exit exactly once (never
//      analyze); a returned signal is published, otherwise the exit
//      determiner's trailing level may trigger a protective-stop
//      replacement (cancel + re-place — the venue cannot modify in place).
//   3. Symbol is flat -> per-symbol cooldown gate, then analyze; producing
//      a signal stamps the cooldown clock.
//
// The cooldown uses event time (candle close_time), so replayed and live
// streams behave identically.  Strategy calls are synchronous and fast; all
// awaiting (cache reads, publishes, venue calls) happens outside the
// strategy lock.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, EventHandler, EventPayload, EventTag};
use crate::gateway::OrderGateway;
use crate::market_data::Candle;
use crate::position::PositionCache;
use crate::strategy::CompositeStrategy;
use crate::types::{PositionSide, Side, Signal};

enum Action {
    Publish(Signal),
    ReplaceStop { level: f64, entry_side: Side },
    Nothing,
}

pub struct Dispatcher {
    strategies: Mutex<HashMap<String, CompositeStrategy>>,
    positions: Arc<PositionCache>,
    bus: Arc<EventBus>,
    gateway: Arc<OrderGateway>,
    cooldown: Duration,
    /// Minimum trailing-level move (fraction of price) before the venue-side
    /// stop is replaced.
    trail_replace_min_pct: f64,
    /// Event-time (close_time ms) of the last signal per symbol.
    last_signal_time: Mutex<HashMap<String, i64>>,
    /// Trailing level currently standing on the venue per symbol.
    trail_levels: Mutex<HashMap<String, f64>>,
}

impl Dispatcher {
    pub fn new(
        positions: Arc<PositionCache>,
        bus: Arc<EventBus>,
        gateway: Arc<OrderGateway>,
        cooldown: Duration,
        trail_replace_min_pct: f64,
    ) -> Self {
        Self {
            strategies: Mutex::new(HashMap::new()),
            positions,
            bus,
            gateway,
            cooldown,
            trail_replace_min_pct,
            last_signal_time: Mutex::new(HashMap::new()),
            trail_levels: Mutex::new(HashMap::new()),
        }
    }

    /// Register the strategy instance owning `symbol`. One instance per
    /// symbol; re-registration replaces the previous instance.
    pub fn register_strategy(&self, strategy: CompositeStrategy) {
        let symbol = strategy.symbol().to_string();
        info!(symbol = %symbol, strategy = strategy.name(), "strategy registered");
        self.strategies.lock().insert(symbol, strategy);
    }

    /// The aggregated interval requirements for a symbol's strategy; backfill
    /// iterates exactly these.
    pub fn requirements_for(&self, symbol: &str) -> Vec<String> {
        self.strategies
            .lock()
            .get(symbol)
            .map(|s| s.requirements().cloned().collect())
            .unwrap_or_default()
    }

    /// Feed one historical candle into a symbol's strategy buffers (warm-up).
    pub fn backfill_candle(&self, candle: Candle) {
        if let Some(strategy) = self.strategies.lock().get_mut(&candle.symbol) {
            strategy.update_buffer(candle);
        }
    }

    /// True once the symbol's strategy holds the minimum buffer depth.
    pub fn is_ready(&self, symbol: &str) -> bool {
        self.strategies
            .lock()
            .get(symbol)
            .map(CompositeStrategy::is_ready)
            .unwrap_or(false)
    }

    /// Event-time of the last signal for a symbol (tests and diagnostics).
    pub fn last_signal_time(&self, symbol: &str) -> Option<i64> {
        self.last_signal_time.lock().get(symbol).copied()
    }

    // -------------------------------------------------------------------------
    // Candle handling
    // -------------------------------------------------------------------------

    async fn handle_candle(&self, candle: Candle) -> Result<()> {
        let symbol = candle.symbol.clone();

        // Sync pre-checks under the strategy lock: registered symbol and a
        // declared interval.
        {
            let strategies = self.strategies.lock();
            let strategy = match strategies.get(&symbol) {
                Some(strategy) => strategy,
                None => {
                    debug!(symbol = %symbol, "candle for unregistered symbol dropped");
                    return Ok(());
                }
            };
            if !strategy.requirements().any(|iv| iv == &candle.interval) {
                return Ok(());
            }
        }

        let position = match self.positions.get(&symbol).await {
            Ok(position) => position,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "position lookup failed — candle skipped");
                return Ok(());
            }
        };

        let action = self.evaluate(&candle, &position);

        match action {
            Action::Publish(signal) => {
                self.bus
                    .publish(Event::new(
                        EventTag::SignalGenerated,
                        EventPayload::Signal(signal),
                    ))
                    .await;
            }
            Action::ReplaceStop { level, entry_side } => {
                match self
                    .gateway
                    .replace_protective_stop(&symbol, entry_side, level)
                    .await
                {
                    Ok(order_id) => {
                        self.trail_levels.lock().insert(symbol.clone(), level);
                        debug!(symbol = %symbol, level, order_id, "trailing stop replaced");
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "trailing stop replacement failed");
                    }
                }
            }
            Action::Nothing => {}
        }
        Ok(())
    }

    /// Synchronous strategy evaluation; never awaits.
    fn evaluate(&self, candle: &Candle, position: &crate::position::Position) -> Action {
        let symbol = &candle.symbol;
        let mut strategies = self.strategies.lock();
        let strategy = match strategies.get_mut(symbol) {
            Some(strategy) => strategy,
            None => return Action::Nothing,
        };

        strategy.update_buffer(candle.clone());

        if !position.is_flat() {
            // Open position: exit evaluation only, exactly once per candle.
            if let Some(signal) = strategy.should_exit(position, candle) {
                return Action::Publish(signal);
            }
            return self.trailing_action(strategy, position, candle);
        }

        // Flat: any stale trailing bookkeeping dies here.
        self.trail_levels.lock().remove(symbol);

        // Cooldown gate on event time.
        if let Some(last) = self.last_signal_time.lock().get(symbol).copied() {
            let elapsed_ms = candle.close_time.saturating_sub(last);
            if elapsed_ms < self.cooldown.as_millis() as i64 {
                debug!(
                    symbol = %symbol,
                    elapsed_ms,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "analysis skipped — cooldown active"
                );
                return Action::Nothing;
            }
        }

        if let Some(signal) = strategy.analyze(candle) {
            self.last_signal_time
                .lock()
                .insert(symbol.clone(), candle.close_time);
            return Action::Publish(signal);
        }
        Action::Nothing
    }

    fn trailing_action(
        &self,
        strategy: &CompositeStrategy,
        position: &crate::position::Position,
        candle: &Candle,
    ) -> Action {
        let level = match strategy.trailing_level(position) {
            Some(level) => level,
            None => return Action::Nothing,
        };

        let mut levels = self.trail_levels.lock();
        let known = levels.get(&candle.symbol).copied();

        match known {
            None => {
                // First observation: remember the level; the venue-side stop
                // is still the one the coordinator placed at entry.
                levels.insert(candle.symbol.clone(), level);
                Action::Nothing
            }
            Some(previous) => {
                let improving = (level - previous) * position.side.sign() > 0.0;
                let material =
                    (level - previous).abs() >= candle.close * self.trail_replace_min_pct;
                if improving && material {
                    let entry_side = match position.side {
                        PositionSide::Short => Side::Sell,
                        _ => Side::Buy,
                    };
                    Action::ReplaceStop { level, entry_side }
                } else {
                    Action::Nothing
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("strategies", &self.strategies.lock().len())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

#[async_trait::async_trait]
impl EventHandler for Dispatcher {
    fn name(&self) -> &str {
        "dispatcher"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        if let EventPayload::Candle(candle) = event.payload {
            self.handle_candle(candle).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::exchange::ExchangeClient;
    use crate::position::{Position, PositionSource};
    use crate::strategy::module::{
        EntryDecision, EntryDeterminer, ExitDeterminer, ModuleConfig, PriceContext,
        StopLossDeterminer, TakeProfitDeterminer,
    };
    use crate::strategy::StrategyBuffers;
    use crate::types::{ExitReason, SignalKind};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // --- counting stub determiners -----------------------------------------

    struct CountingEntry {
        calls: Arc<AtomicUsize>,
        fire: bool,
    }
    impl EntryDeterminer for CountingEntry {
        fn name(&self) -> &'static str {
            "counting_entry"
        }
        fn required_intervals(&self) -> BTreeSet<String> {
            ["5m".to_string()].into_iter().collect()
        }
        fn decide(&mut self, _: &StrategyBuffers, candle: &Candle) -> Option<EntryDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fire
                .then(|| EntryDecision::new(SignalKind::EntryLong, candle.close, 1.0))
        }
    }

    struct Pct;
    impl StopLossDeterminer for Pct {
        fn name(&self) -> &'static str {
            "pct"
        }
        fn compute(&self, ctx: &PriceContext) -> f64 {
            ctx.entry_price * 0.99
        }
    }

    struct Rr;
    impl TakeProfitDeterminer for Rr {
        fn name(&self) -> &'static str {
            "rr"
        }
        fn compute(&self, ctx: &PriceContext, _: f64) -> f64 {
            ctx.entry_price * 1.02
        }
    }

    struct CountingExit {
        calls: Arc<AtomicUsize>,
    }
    impl ExitDeterminer for CountingExit {
        fn name(&self) -> &'static str {
            "counting_exit"
        }
        fn evaluate(
            &mut self,
            _: &Position,
            _: &Candle,
            _: &StrategyBuffers,
        ) -> Option<Signal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    // --- fixtures ------------------------------------------------------------

    struct FixedSource(f64);

    #[async_trait]
    impl PositionSource for FixedSource {
        async fn fetch_position(&self, symbol: &str) -> Result<Position> {
            Ok(Position::from_signed(
                symbol,
                self.0,
                100.0,
                100.0,
                0.0,
                1,
                crate::types::MarginType::Isolated,
            ))
        }
    }

    fn audit() -> Arc<AuditLogger> {
        let dir = std::env::temp_dir().join(format!("vela-disp-{}", uuid::Uuid::new_v4()));
        Arc::new(AuditLogger::new(dir).unwrap())
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        entry_calls: Arc<AtomicUsize>,
        exit_calls: Arc<AtomicUsize>,
    }

    fn fixture(signed_position: f64, fire_entries: bool) -> Fixture {
        let audit = audit();
        let bus = Arc::new(EventBus::new(audit.clone()));
        let client = Arc::new(ExchangeClient::new("k", "s", true));
        let gateway = Arc::new(OrderGateway::new(client, audit));
        let positions = Arc::new(PositionCache::new(
            Arc::new(FixedSource(signed_position)),
            Duration::from_secs(60),
        ));

        let entry_calls = Arc::new(AtomicUsize::new(0));
        let exit_calls = Arc::new(AtomicUsize::new(0));

        let config = ModuleConfig::new(
            Box::new(CountingEntry {
                calls: entry_calls.clone(),
                fire: fire_entries,
            }),
            Box::new(Pct),
            Box::new(Rr),
            Box::new(CountingExit {
                calls: exit_calls.clone(),
            }),
        );
        let strategy = CompositeStrategy::with_depth("BTCUSDT", config, 1.5, 1);

        let dispatcher = Arc::new(Dispatcher::new(
            positions,
            bus,
            gateway,
            Duration::from_secs(300),
            0.0005,
        ));
        dispatcher.register_strategy(strategy);

        Fixture {
            dispatcher,
            entry_calls,
            exit_calls,
        }
    }

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

    #[tokio::test]
    async fn open_position_calls_should_exit_never_analyze() {
        let fx = fixture(1.0, true);
        fx.dispatcher.handle_candle(candle(600_000, 100.0)).await.unwrap();

        assert_eq!(fx.exit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flat_symbol_analyzes_and_cooldown_gates_reanalysis() {
        let fx = fixture(0.0, true);
        let t0: i64 = 600_000;

        // First candle fires a signal and stamps the cooldown clock.
        fx.dispatcher.handle_candle(candle(t0, 100.0)).await.unwrap();
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.dispatcher.last_signal_time("BTCUSDT"), Some(t0));

        // 299 s later: still inside the 300 s cooldown — analyze not called.
        fx.dispatcher
            .handle_candle(candle(t0 + 299_000, 100.0))
            .await
            .unwrap();
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 1);

        // Exactly 300 s later: cooldown expired — analyze runs again.
        fx.dispatcher
            .handle_candle(candle(t0 + 300_000, 100.0))
            .await
            .unwrap();
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_symbol_dropped() {
        let fx = fixture(0.0, true);
        let mut c = candle(600_000, 100.0);
        c.symbol = "DOGEUSDT".into();
        fx.dispatcher.handle_candle(c).await.unwrap();
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undeclared_interval_filtered_before_buffer_update() {
        let fx = fixture(0.0, true);
        let mut c = candle(600_000, 100.0);
        c.interval = "3m".into();
        fx.dispatcher.handle_candle(c).await.unwrap();
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 0);
        assert!(!fx.dispatcher.is_ready("BTCUSDT"));
    }

    #[tokio::test]
    async fn no_signal_leaves_cooldown_clock_untouched() {
        let fx = fixture(0.0, false);
        fx.dispatcher.handle_candle(candle(600_000, 100.0)).await.unwrap();
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.dispatcher.last_signal_time("BTCUSDT"), None);

        // Next candle analyses again immediately — no cooldown was stamped.
        fx.dispatcher.handle_candle(candle(660_000, 100.0)).await.unwrap();
        assert_eq!(fx.entry_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backfill_reaches_strategy_buffers() {
        let fx = fixture(0.0, true);
        assert!(!fx.dispatcher.is_ready("BTCUSDT"));
        fx.dispatcher.backfill_candle(candle(300_000, 99.0));
        assert!(fx.dispatcher.is_ready("BTCUSDT"));
        assert_eq!(fx.dispatcher.requirements_for("BTCUSDT"), vec!["5m"]);
    }
}
