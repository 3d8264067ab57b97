// =============================================================================
// Vela Futures Engine — Main Entry Point
// =============================================================================
//
// Wires the full pipeline: config -> audit -> event bus -> venue client ->
// position cache -> gateway -> risk guard -> strategies -> dispatcher ->
// coordinator -> liquidation -> engine, then waits for Ctrl+C and walks the
// bounded shutdown sequence.
//
// Exit codes: 0 normal shutdown, 1 fatal initialization error,
// 2 unrecoverable runtime error after partial shutdown.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod audit;
mod bus;
mod config;
mod coordinator;
mod detectors;
mod determiners;
mod dispatcher;
mod engine;
mod exchange;
mod gateway;
mod liquidation;
mod market_data;
mod position;
mod risk;
mod strategy;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::audit::AuditLogger;
use crate::bus::EventBus;
use crate::config::BotConfig;
use crate::coordinator::TradeCoordinator;
use crate::dispatcher::Dispatcher;
use crate::engine::{Engine, EngineComponents};
use crate::exchange::ExchangeClient;
use crate::gateway::OrderGateway;
use crate::liquidation::LiquidationManager;
use crate::position::{PositionCache, DEFAULT_POSITION_TTL};
use crate::risk::RiskGuard;
use crate::strategy::ModuleRegistry;

const EXIT_OK: i32 = 0;
const EXIT_FATAL_INIT: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("VELA_CONFIG").unwrap_or_else(|_| "vela_config.json".to_string());
    let config = BotConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("failed to load config from {config_path}: {e:#} — using defaults");
        BotConfig::default()
    });
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e:#}");
        return EXIT_FATAL_INIT;
    }
    let config = Arc::new(config);

    // ── 2. Logging: console + daily-rotated file ─────────────────────────
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "vela.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║             Vela Futures Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(symbols = ?config.symbols, testnet = config.testnet, "configured universe");

    // ── 3. Audit trail ───────────────────────────────────────────────────
    let audit = match AuditLogger::new(&config.audit_dir) {
        Ok(audit) => Arc::new(audit),
        Err(e) => {
            error!(error = %e, "cannot start audit logger");
            return EXIT_FATAL_INIT;
        }
    };

    // ── 4. Venue client ──────────────────────────────────────────────────
    let api_key = std::env::var("VELA_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("VELA_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("VELA_API_KEY / VELA_API_SECRET not set — signed endpoints will be rejected");
    }
    let client = Arc::new(ExchangeClient::new(api_key, api_secret, config.testnet));

    // Starting equity anchors the daily drawdown halt line.
    let starting_equity = match client.get_available_balance().await {
        Ok(balance) => {
            info!(balance, "account balance fetched");
            balance
        }
        Err(e) => {
            error!(error = %e, "cannot fetch account balance — venue unreachable");
            audit.shutdown();
            return EXIT_FATAL_INIT;
        }
    };

    // ── 5. Core components ───────────────────────────────────────────────
    let bus = Arc::new(EventBus::new(audit.clone()));
    let positions = Arc::new(PositionCache::new(client.clone(), DEFAULT_POSITION_TTL));
    let gateway = Arc::new(OrderGateway::new(client.clone(), audit.clone()));
    let risk = Arc::new(RiskGuard::new(&config, starting_equity, audit.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        positions.clone(),
        bus.clone(),
        gateway.clone(),
        Duration::from_secs(config.signal_cooldown_secs),
        config.trail_replace_min_pct,
    ));

    // Per-symbol strategy assembly: fresh determiner instances per symbol.
    let registry = ModuleRegistry::with_builtins();
    for symbol in &config.symbols {
        let spec = config.modules_for(symbol);
        match registry.build_strategy(symbol, &spec, config.min_rr_for(symbol)) {
            Ok(strategy) => dispatcher.register_strategy(strategy),
            Err(e) => {
                error!(symbol = %symbol, error = %e, "strategy assembly failed");
                audit.shutdown();
                return EXIT_FATAL_INIT;
            }
        }
    }

    let coordinator = Arc::new(TradeCoordinator::new(
        gateway.clone(),
        risk.clone(),
        positions.clone(),
        client.clone(),
        config.clone(),
        audit.clone(),
    ));

    let liquidation = Arc::new(LiquidationManager::new(
        gateway.clone(),
        config.symbols.clone(),
        config.emergency_liquidation,
        Duration::from_secs_f64(config.liquidation_timeout_secs),
        audit.clone(),
    ));

    // ── 6. Engine lifecycle ──────────────────────────────────────────────
    let engine = Arc::new(Engine::new(audit.clone()));
    if let Err(e) = engine.set_components(EngineComponents {
        config: config.clone(),
        bus: bus.clone(),
        dispatcher: dispatcher.clone(),
        coordinator: coordinator.clone(),
        client: client.clone(),
        gateway: gateway.clone(),
        liquidation: liquidation.clone(),
        audit: audit.clone(),
    }) {
        error!(error = %e, "component installation failed");
        audit.shutdown();
        return EXIT_FATAL_INIT;
    }

    if let Err(e) = engine.run().await {
        error!(error = %e, "engine failed to start");
        // Best-effort teardown of whatever partially started.
        if engine.stop().await.is_err() {
            warn!("partial shutdown after failed start was incomplete");
        }
        audit.shutdown();
        return EXIT_FATAL_INIT;
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    warn!("Shutdown signal received — stopping gracefully");

    let code = match engine.stop().await {
        Ok(report) => {
            if let Some(report) = report {
                info!(
                    state = %report.state,
                    closed = report.closed.len(),
                    still_open = report.still_open.len(),
                    "liquidation report"
                );
            }
            EXIT_OK
        }
        Err(e) => {
            error!(error = %e, "shutdown did not complete cleanly");
            EXIT_RUNTIME
        }
    };

    audit.shutdown();
    info!("Vela Futures Engine shut down complete.");
    code
}
