// =============================================================================
// Liquidation Manager — bounded emergency close-all on shutdown
// =============================================================================
//
// Invoked during STOPPING when emergency liquidation is enabled.  All work
// runs inside one total time budget (default 5 s):
//
//   1. Cancel all open orders for every configured symbol (in parallel).
//   2. Query open positions.
//   3. Market-close every non-flat position with reduce-only, retrying up
//      to 3 times with 0.5 s backoff.
//
// Progress is recorded through a shared ledger, so when the budget expires
// mid-flight the report still lists exactly what was confirmed closed and
// what remains open.  The manager is one-shot and idempotent: re-invocation
// returns the stored report.  Shutdown never hangs here — after the budget,
// the report goes out regardless.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::position::Position;

/// Close retry policy inside the budget.
const CLOSE_RETRIES: u32 = 3;
const CLOSE_BACKOFF: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// State and report
// ---------------------------------------------------------------------------

/// One-shot liquidation outcome states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationState {
    Idle,
    InProgress,
    Completed,
    Partial,
    Failed,
    Skipped,
    TimedOut,
}

impl std::fmt::Display for LiquidationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// What the manager accomplished before returning.
#[derive(Debug, Clone, Serialize)]
pub struct LiquidationReport {
    pub state: LiquidationState,
    /// Symbols whose positions were confirmed closed.
    pub closed: Vec<String>,
    /// Symbols whose close attempts all failed.
    pub failed: Vec<String>,
    /// Symbols reported (or presumed) still open at the moment of report.
    pub still_open: Vec<String>,
    pub elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Venue abstraction
// ---------------------------------------------------------------------------

/// The venue operations liquidation needs. Implemented by the order gateway;
/// tests substitute scripted fakes.
#[async_trait]
pub trait LiquidationVenue: Send + Sync {
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;
    /// All currently non-flat positions.
    async fn open_positions(&self) -> Result<Vec<Position>>;
    async fn market_close(&self, position: &Position) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Progress ledger (survives a budget timeout)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Progress {
    targets: BTreeSet<String>,
    closed: BTreeSet<String>,
    failed: BTreeSet<String>,
    venue_unreachable: bool,
}

// ---------------------------------------------------------------------------
// LiquidationManager
// ---------------------------------------------------------------------------

pub struct LiquidationManager {
    venue: Arc<dyn LiquidationVenue>,
    symbols: Vec<String>,
    enabled: bool,
    budget: Duration,
    state: Mutex<LiquidationState>,
    report: Mutex<Option<LiquidationReport>>,
    audit: Arc<AuditLogger>,
}

impl LiquidationManager {
    pub fn new(
        venue: Arc<dyn LiquidationVenue>,
        symbols: Vec<String>,
        enabled: bool,
        budget: Duration,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            venue,
            symbols,
            enabled,
            budget,
            state: Mutex::new(LiquidationState::Idle),
            report: Mutex::new(None),
            audit,
        }
    }

    pub fn state(&self) -> LiquidationState {
        *self.state.lock()
    }

    /// Run the emergency liquidation. Safe to call more than once: a second
    /// invocation returns the stored report without touching the venue.
    pub async fn run(&self) -> LiquidationReport {
        if let Some(report) = self.report.lock().clone() {
            info!(state = %report.state, "liquidation already ran — returning stored report");
            return report;
        }

        if !self.enabled {
            let report = LiquidationReport {
                state: LiquidationState::Skipped,
                closed: Vec::new(),
                failed: Vec::new(),
                still_open: Vec::new(),
                elapsed_ms: 0,
            };
            *self.state.lock() = LiquidationState::Skipped;
            *self.report.lock() = Some(report.clone());
            self.audit
                .log_global(AuditKind::LiquidationSkipped, json!({ "reason": "disabled" }));
            info!("emergency liquidation disabled — skipping");
            return report;
        }

        *self.state.lock() = LiquidationState::InProgress;
        self.audit.log_global(
            AuditKind::LiquidationStarted,
            json!({ "symbols": self.symbols, "budget_secs": self.budget.as_secs_f64() }),
        );
        info!(budget_secs = self.budget.as_secs_f64(), "emergency liquidation started");

        let started = Instant::now();
        let progress = Arc::new(Mutex::new(Progress::default()));

        let work = self.close_everything(progress.clone());
        let timed_out = tokio::time::timeout(self.budget, work).await.is_err();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let report = Self::build_report(&progress.lock(), timed_out, elapsed_ms);

        *self.state.lock() = report.state;
        *self.report.lock() = Some(report.clone());
        self.audit_outcome(&report);
        report
    }

    /// The actual close-all sequence; cancelled mid-flight on timeout.
    async fn close_everything(&self, progress: Arc<Mutex<Progress>>) {
        // 1. Cancel open orders for every configured symbol, in parallel.
        let cancels = self.symbols.iter().map(|symbol| {
            let venue = self.venue.clone();
            async move {
                if let Err(e) = venue.cancel_all_orders(symbol).await {
                    warn!(symbol = %symbol, error = %e, "cancel-all failed during liquidation");
                }
            }
        });
        join_all(cancels).await;

        // 2. Query open positions.
        let positions = match self.venue.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "cannot query positions — liquidation failed");
                progress.lock().venue_unreachable = true;
                return;
            }
        };

        {
            let mut p = progress.lock();
            p.targets = positions
                .iter()
                .filter(|pos| !pos.is_flat())
                .map(|pos| pos.symbol.clone())
                .collect();
        }

        // 3. Close every non-flat position with bounded retries.
        for position in positions.iter().filter(|pos| !pos.is_flat()) {
            let mut closed = false;
            for attempt in 0..CLOSE_RETRIES {
                match self.venue.market_close(position).await {
                    Ok(()) => {
                        info!(
                            symbol = %position.symbol,
                            side = %position.side,
                            quantity = position.quantity,
                            "position closed during liquidation"
                        );
                        closed = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            symbol = %position.symbol,
                            attempt = attempt + 1,
                            error = %e,
                            "liquidation close failed"
                        );
                        if attempt + 1 < CLOSE_RETRIES {
                            tokio::time::sleep(CLOSE_BACKOFF).await;
                        }
                    }
                }
            }
            let mut p = progress.lock();
            if closed {
                p.closed.insert(position.symbol.clone());
            } else {
                p.failed.insert(position.symbol.clone());
            }
        }
    }

    fn build_report(progress: &Progress, timed_out: bool, elapsed_ms: u64) -> LiquidationReport {
        let still_open: Vec<String> = progress
            .targets
            .difference(&progress.closed)
            .cloned()
            .collect();
        let closed: Vec<String> = progress.closed.iter().cloned().collect();
        let failed: Vec<String> = progress.failed.iter().cloned().collect();

        let state = if timed_out {
            LiquidationState::TimedOut
        } else if progress.venue_unreachable {
            LiquidationState::Failed
        } else if still_open.is_empty() {
            LiquidationState::Completed
        } else if closed.is_empty() {
            LiquidationState::Failed
        } else {
            LiquidationState::Partial
        };

        LiquidationReport {
            state,
            closed,
            failed,
            still_open,
            elapsed_ms,
        }
    }

    fn audit_outcome(&self, report: &LiquidationReport) {
        let kind = match report.state {
            LiquidationState::Completed => AuditKind::LiquidationCompleted,
            LiquidationState::Partial => AuditKind::LiquidationPartial,
            LiquidationState::TimedOut => AuditKind::LiquidationTimedOut,
            _ => AuditKind::LiquidationFailed,
        };
        self.audit.log_global(kind, json!(report));
        info!(
            state = %report.state,
            closed = report.closed.len(),
            still_open = report.still_open.len(),
            elapsed_ms = report.elapsed_ms,
            "liquidation finished"
        );
    }
}

impl std::fmt::Debug for LiquidationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidationManager")
            .field("enabled", &self.enabled)
            .field("budget", &self.budget)
            .field("state", &self.state())
            .finish()
    }
}
