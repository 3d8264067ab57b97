// =============================================================================
// Audit Log — append-only JSON-line event trail on a dedicated writer thread
// =============================================================================
//
// Producers (strategy, coordinator, risk guard, gateway, liquidation) enqueue
// onto an unbounded channel and return immediately; a single writer thread
// formats each event as one JSON line and appends it to a daily file
// (`audit-YYYY-MM-DD.jsonl`) under the configured directory.  The file is
// re-opened when the UTC date rolls over.
//
// On shutdown the writer drains the queue fully before the thread exits, so
// no event accepted before `shutdown()` is ever lost.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Every auditable event kind the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SignalProcessing,
    RiskValidation,
    RiskRejection,
    PositionSizeCalculated,
    PositionSizeCapped,
    OrderPlaced,
    OrderRejected,
    TradeExecuted,
    TradeExecutionFailed,
    PositionClosed,
    LeverageSet,
    EngineState,
    HandlerError,
    EventDropped,
    LiquidationStarted,
    LiquidationCompleted,
    LiquidationPartial,
    LiquidationFailed,
    LiquidationTimedOut,
    LiquidationSkipped,
}

/// One audit line as serialised to disk.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// ISO-8601 UTC timestamp.
    pub at: String,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub detail: serde_json::Value,
}

enum WriterMsg {
    Record(AuditRecord),
    Shutdown,
}

// ---------------------------------------------------------------------------
// AuditLogger
// ---------------------------------------------------------------------------

/// Handle to the audit writer thread. Cheap to share via `Arc`; `log` never
/// blocks on I/O.
pub struct AuditLogger {
    tx: mpsc::Sender<WriterMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Create the audit directory if needed and start the writer thread.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create audit dir {}", dir.display()))?;

        let (tx, rx) = mpsc::channel::<WriterMsg>();

        let writer_dir = dir.clone();
        let handle = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || writer_loop(writer_dir, rx))
            .context("failed to spawn audit writer thread")?;

        info!(dir = %dir.display(), "audit logger started");

        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue one audit event. Returns immediately; dropped silently only if
    /// the writer thread has already shut down (a `warn!` is emitted so the
    /// condition is visible in the trading log).
    pub fn log(&self, kind: AuditKind, symbol: Option<&str>, detail: serde_json::Value) {
        let record = AuditRecord {
            at: Utc::now().to_rfc3339(),
            kind,
            symbol: symbol.map(str::to_string),
            detail,
        };
        if self.tx.send(WriterMsg::Record(record)).is_err() {
            warn!(?kind, "audit event dropped — writer thread not running");
        }
    }

    /// Convenience for events without a symbol.
    pub fn log_global(&self, kind: AuditKind, detail: serde_json::Value) {
        self.log(kind, None, detail);
    }

    /// Stop accepting events and block until the writer has drained the queue
    /// and flushed. Idempotent: subsequent calls are no-ops.
    pub fn shutdown(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(WriterMsg::Shutdown);
            if handle.join().is_err() {
                error!("audit writer thread panicked during shutdown");
            } else {
                info!("audit writer drained and stopped");
            }
        }
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Writer thread
// ---------------------------------------------------------------------------

struct DailyFile {
    date: String,
    writer: BufWriter<File>,
}

fn open_for_date(dir: &Path, date: &str) -> std::io::Result<DailyFile> {
    let path = dir.join(format!("audit-{date}.jsonl"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(DailyFile {
        date: date.to_string(),
        writer: BufWriter::new(file),
    })
}

fn write_record(dir: &Path, current: &mut Option<DailyFile>, record: &AuditRecord) {
    let today = Utc::now().format("%Y-%m-%d").to_string();

    // Re-open on first write and on date roll.
    let needs_reopen = match current {
        Some(f) => f.date != today,
        None => true,
    };
    if needs_reopen {
        if let Some(old) = current.as_mut() {
            let _ = old.writer.flush();
        }
        match open_for_date(dir, &today) {
            Ok(f) => *current = Some(f),
            Err(e) => {
                error!(error = %e, "failed to open audit file — event lost");
                return;
            }
        }
    }

    let file = current.as_mut().expect("audit file opened above");
    match serde_json::to_string(record) {
        Ok(line) => {
            if let Err(e) = writeln!(file.writer, "{line}") {
                error!(error = %e, "failed to write audit line");
            }
            let _ = file.writer.flush();
        }
        Err(e) => error!(error = %e, "failed to serialise audit record"),
    }
}

fn writer_loop(dir: PathBuf, rx: mpsc::Receiver<WriterMsg>) {
    let mut current: Option<DailyFile> = None;

    while let Ok(msg) = rx.recv() {
        match msg {
            WriterMsg::Record(record) => write_record(&dir, &mut current, &record),
            WriterMsg::Shutdown => break,
        }
    }

    // Drain whatever producers managed to enqueue before shutdown.
    while let Ok(msg) = rx.try_recv() {
        if let WriterMsg::Record(record) = msg {
            write_record(&dir, &mut current, &record);
        }
    }

    if let Some(f) = current.as_mut() {
        let _ = f.writer.flush();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("vela-audit-{}", uuid::Uuid::new_v4()))
    }

    fn read_lines(dir: &Path) -> Vec<serde_json::Value> {
        let mut lines = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            for line in content.lines() {
                lines.push(serde_json::from_str(line).unwrap());
            }
        }
        lines
    }

    #[test]
    fn events_written_as_json_lines() {
        let dir = temp_dir();
        let logger = AuditLogger::new(&dir).unwrap();

        logger.log(
            AuditKind::RiskRejection,
            Some("BTCUSDT"),
            json!({ "rule": "tp_sl_geometry" }),
        );
        logger.log_global(AuditKind::EngineState, json!({ "state": "RUNNING" }));
        logger.shutdown();

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "risk_rejection");
        assert_eq!(lines[0]["symbol"], "BTCUSDT");
        assert_eq!(lines[0]["detail"]["rule"], "tp_sl_geometry");
        assert_eq!(lines[1]["kind"], "engine_state");
        assert!(lines[1].get("symbol").is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn shutdown_drains_pending_events() {
        let dir = temp_dir();
        let logger = AuditLogger::new(&dir).unwrap();

        for i in 0..200 {
            logger.log_global(AuditKind::SignalProcessing, json!({ "seq": i }));
        }
        logger.shutdown();

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[199]["detail"]["seq"], 199);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dir = temp_dir();
        let logger = AuditLogger::new(&dir).unwrap();
        logger.shutdown();
        logger.shutdown();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_name_carries_utc_date() {
        let dir = temp_dir();
        let logger = AuditLogger::new(&dir).unwrap();
        logger.log_global(AuditKind::EngineState, json!({}));
        logger.shutdown();

        let name = std::fs::read_dir(&dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .file_name()
            .into_string()
            .unwrap();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(name, format!("audit-{today}.jsonl"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
