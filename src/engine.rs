// =============================================================================
// Engine — lifecycle state machine and shutdown orchestration
// =============================================================================
//
//   CREATED --set_components()--> INITIALIZED --run()--> RUNNING
//                                                          |
//                                                        stop()
//                                                          v
//                          STOPPED <---------------- STOPPING
//
// Invalid transitions raise a state error and are audited; they never mutate
// the state.  `run()` wires the bus subscriptions, applies venue settings,
// backfills strategy buffers (only the intervals each strategy declared),
// launches the stream tasks, and finally flips the readiness flag the
// streams wait on before their first publish.
//
// Shutdown order (each step time-bounded, none may hang the process):
//   1. Bus stops accepting publishes and drains (10 s).
//   2. Stream tasks are cancelled (5 s grace).
//   3. Emergency liquidation runs inside its own budget.
//   4. The audit writer drains (owned by main, after stop() returns).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::bus::{Event, EventBus, EventTag};
use crate::config::BotConfig;
use crate::coordinator::TradeCoordinator;
use crate::dispatcher::Dispatcher;
use crate::exchange::ExchangeClient;
use crate::gateway::OrderGateway;
use crate::liquidation::{LiquidationManager, LiquidationReport};
use crate::market_data::stream::run_market_stream;
use crate::market_data::user_stream::run_user_stream;

/// Bus drain grace during shutdown.
const BUS_DRAIN_GRACE: Duration = Duration::from_secs(10);
/// Grace for stream tasks to acknowledge cancellation.
const STREAM_STOP_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Engine lifecycle states. Monotone: the only path is forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// An attempted transition outside the state machine's edges.
#[derive(Debug, thiserror::Error)]
#[error("invalid engine state transition {from} -> {to}")]
pub struct StateError {
    pub from: EngineState,
    pub to: EngineState,
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Everything the engine drives. Built by main, handed over before `run`.
#[derive(Clone)]
pub struct EngineComponents {
    pub config: Arc<BotConfig>,
    pub bus: Arc<EventBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub coordinator: Arc<TradeCoordinator>,
    pub client: Arc<ExchangeClient>,
    pub gateway: Arc<OrderGateway>,
    pub liquidation: Arc<LiquidationManager>,
    pub audit: Arc<AuditLogger>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    state: Mutex<EngineState>,
    components: Mutex<Option<EngineComponents>>,
    ready_tx: watch::Sender<bool>,
    stream_tasks: Mutex<Vec<JoinHandle<()>>>,
    audit: Arc<AuditLogger>,
}

impl Engine {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        let (ready_tx, _ready_rx) = watch::channel(false);
        Self {
            state: Mutex::new(EngineState::Created),
            components: Mutex::new(None),
            ready_tx,
            stream_tasks: Mutex::new(Vec::new()),
            audit,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// A fresh readiness receiver for a stream task to wait on.
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Guarded transition; invalid edges are audited and leave the state
    /// untouched.
    fn transition(&self, to: EngineState) -> Result<(), StateError> {
        let mut state = self.state.lock();
        let from = *state;
        let valid = matches!(
            (from, to),
            (EngineState::Created, EngineState::Initialized)
                | (EngineState::Initialized, EngineState::Running)
                | (EngineState::Running, EngineState::Stopping)
                | (EngineState::Stopping, EngineState::Stopped)
        );
        if !valid {
            let err = StateError { from, to };
            self.audit.log_global(
                AuditKind::EngineState,
                json!({ "error": err.to_string(), "from": from.to_string(), "to": to.to_string() }),
            );
            return Err(err);
        }
        *state = to;
        info!(from = %from, to = %to, "engine state transition");
        self.audit.log_global(
            AuditKind::EngineState,
            json!({ "from": from.to_string(), "to": to.to_string() }),
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lifecycle operations
    // -------------------------------------------------------------------------

    /// Install the component set: CREATED -> INITIALIZED.
    pub fn set_components(&self, components: EngineComponents) -> Result<(), StateError> {
        self.transition(EngineState::Initialized)?;
        *self.components.lock() = Some(components);
        Ok(())
    }

    /// INITIALIZED -> RUNNING: subscribe handlers, apply venue settings,
    /// backfill, launch streams, signal readiness. Errors here are fatal
    /// initialization failures.
    pub async fn run(&self) -> Result<()> {
        self.transition(EngineState::Running)
            .context("engine cannot run")?;

        let components = self
            .components
            .lock()
            .clone()
            .context("engine has no components installed")?;

        // 1. Wire the bus and start its drain tasks.
        Self::subscribe_handlers(&components);
        components.bus.start();

        // 2. Venue setup per symbol: precision filters are load-bearing
        //    (sizing and quantization), leverage and margin are advisory.
        for symbol in &components.config.symbols {
            components
                .gateway
                .load_filters(symbol)
                .await
                .with_context(|| format!("failed to load precision filters for {symbol}"))?;

            let leverage = components.config.leverage_for(symbol);
            match components.client.set_leverage(symbol, leverage).await {
                Ok(()) => components.audit.log(
                    AuditKind::LeverageSet,
                    Some(symbol),
                    json!({ "leverage": leverage }),
                ),
                Err(e) => warn!(symbol = %symbol, error = %e, "failed to set leverage"),
            }

            if let Err(e) = components
                .client
                .set_margin_type(symbol, components.config.margin_type)
                .await
            {
                warn!(symbol = %symbol, error = %e, "failed to set margin type");
            }
        }

        // 3. Backfill: only the intervals each symbol's strategy declared.
        for symbol in &components.config.symbols {
            let intervals = components.dispatcher.requirements_for(symbol);
            for interval in &intervals {
                match components
                    .client
                    .get_historical_candles(symbol, interval, components.config.backfill_limit)
                    .await
                {
                    Ok(candles) => {
                        let count = candles.len();
                        for candle in candles {
                            components.dispatcher.backfill_candle(candle);
                        }
                        info!(symbol = %symbol, interval = %interval, count, "backfill loaded");
                    }
                    Err(e) => {
                        warn!(
                            symbol = %symbol,
                            interval = %interval,
                            error = %e,
                            "backfill failed — strategy will warm up from live data"
                        );
                    }
                }
            }
        }

        // 4. Launch one market stream per symbol plus the user stream.
        let ws_base = components.client.ws_base_url().to_string();
        let mut tasks = self.stream_tasks.lock();

        for symbol in &components.config.symbols {
            let intervals = components.dispatcher.requirements_for(symbol);
            let bus = components.bus.clone();
            let ready = self.ready_receiver();
            let symbol = symbol.clone();
            let ws_base = ws_base.clone();
            tasks.push(tokio::spawn(async move {
                let result = run_market_stream(symbol.clone(), intervals, ws_base, ready, {
                    let bus = bus.clone();
                    move |candle| {
                        bus.try_publish(Event::from_candle(candle));
                    }
                })
                .await;
                if let Err(e) = result {
                    tracing::error!(symbol = %symbol, error = %e, "market stream fatal error");
                }
            }));
        }

        {
            let client = components.client.clone();
            let bus = components.bus.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_user_stream(client, bus).await {
                    tracing::error!(error = %e, "user stream fatal error");
                }
            }));
        }
        drop(tasks);

        // 5. Signal readiness; the streams' bounded waits release here.
        let _ = self.ready_tx.send(true);
        info!(symbols = ?components.config.symbols, "engine running");
        Ok(())
    }

    /// RUNNING -> STOPPING -> STOPPED. Returns the liquidation report; never
    /// hangs past its bounded steps.
    pub async fn stop(&self) -> Result<Option<LiquidationReport>, StateError> {
        self.transition(EngineState::Stopping)?;

        let components = self.components.lock().as_ref().map(|c| {
            (c.bus.clone(), c.liquidation.clone())
        });

        let report = match components {
            Some((bus, liquidation)) => {
                // 1. Stop accepting events; drain what is queued.
                bus.shutdown(BUS_DRAIN_GRACE).await;

                // 2. Cancel the stream tasks.
                let tasks: Vec<JoinHandle<()>> = self.stream_tasks.lock().drain(..).collect();
                for task in &tasks {
                    task.abort();
                }
                let joins = futures_util::future::join_all(tasks);
                if tokio::time::timeout(STREAM_STOP_GRACE, joins).await.is_err() {
                    warn!("stream tasks did not stop within grace — continuing shutdown");
                }

                // 3. Emergency liquidation inside its own budget.
                Some(liquidation.run().await)
            }
            None => None,
        };

        self.transition(EngineState::Stopped)?;
        info!("engine stopped");
        Ok(report)
    }

    fn subscribe_handlers(components: &EngineComponents) {
        let bus = &components.bus;

        bus.subscribe(EventTag::CandleClosed, components.dispatcher.clone());
        bus.subscribe(EventTag::CandleUpdate, components.dispatcher.clone());

        bus.subscribe(EventTag::SignalGenerated, components.coordinator.clone());
        bus.subscribe(EventTag::OrderFilled, components.coordinator.clone());
        bus.subscribe(EventTag::OrderPartiallyFilled, components.coordinator.clone());
        bus.subscribe(EventTag::OrderCancelled, components.coordinator.clone());
        bus.subscribe(EventTag::PositionUpdate, components.coordinator.clone());
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("state", &self.state()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn audit() -> Arc<AuditLogger> {
        let dir = std::env::temp_dir().join(format!("vela-engine-{}", uuid::Uuid::new_v4()));
        Arc::new(AuditLogger::new(dir).unwrap())
    }

    #[test]
    fn starts_created() {
        let engine = Engine::new(audit());
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[test]
    fn valid_forward_transitions() {
        let engine = Engine::new(audit());
        assert!(engine.transition(EngineState::Initialized).is_ok());
        assert!(engine.transition(EngineState::Running).is_ok());
        assert!(engine.transition(EngineState::Stopping).is_ok());
        assert!(engine.transition(EngineState::Stopped).is_ok());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn invalid_transitions_rejected_without_mutation() {
        let engine = Engine::new(audit());

        // Cannot run before components are installed.
        let err = engine.transition(EngineState::Running).unwrap_err();
        assert_eq!(err.from, EngineState::Created);
        assert_eq!(err.to, EngineState::Running);
        assert_eq!(engine.state(), EngineState::Created);

        // Cannot skip backwards.
        engine.transition(EngineState::Initialized).unwrap();
        engine.transition(EngineState::Running).unwrap();
        assert!(engine.transition(EngineState::Initialized).is_err());
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn terminal_state_is_sticky() {
        let engine = Engine::new(audit());
        engine.transition(EngineState::Initialized).unwrap();
        engine.transition(EngineState::Running).unwrap();
        engine.transition(EngineState::Stopping).unwrap();
        engine.transition(EngineState::Stopped).unwrap();

        assert!(engine.transition(EngineState::Running).is_err());
        assert!(engine.transition(EngineState::Stopping).is_err());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_run_is_a_state_error() {
        let engine = Engine::new(audit());
        assert!(engine.stop().await.is_err());
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[tokio::test]
    async fn readiness_flag_observable_from_receivers() {
        let engine = Arc::new(Engine::new(audit()));
        let rx = engine.ready_receiver();
        assert!(!*rx.borrow());
        engine.ready_tx.send(true).unwrap();
        assert!(*rx.borrow());
    }
}
