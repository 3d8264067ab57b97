// =============================================================================
// Candle — OHLCV record parsed from the venue kline stream
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle for one (symbol, interval) series.
///
/// Produced at high frequency: every kline WebSocket message becomes one
/// `Candle`, with `is_closed == false` for the in-progress update ticks and
/// `true` exactly once per period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    /// Period open, epoch milliseconds.
    pub open_time: i64,
    /// Period close, epoch milliseconds.
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// The series key for this candle.
    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
        }
    }

    /// Body size in price units (always non-negative).
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Full high-low range in price units.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// True when close > open.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// True when close < open.
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Kline message parsing
// ---------------------------------------------------------------------------

/// Helper: the venue sends numeric values as JSON strings inside kline
/// objects.
pub(crate) fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse a kline message into a [`Candle`].
///
/// Supports both the combined-stream envelope and the direct single-stream
/// payload:
/// ```json
/// { "stream": "btcusdt@kline_1m", "data": { "s": "BTCUSDT", "k": { ... } } }
/// { "e": "kline", "s": "BTCUSDT", "k": { ... } }
/// ```
pub fn parse_kline_message(text: &str) -> Result<Candle> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    let interval = k["i"].as_str().context("missing field k.i")?.to_string();

    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;

    let open = parse_string_f64(&k["o"], "k.o")?;
    let high = parse_string_f64(&k["h"], "k.h")?;
    let low = parse_string_f64(&k["l"], "k.l")?;
    let close = parse_string_f64(&k["c"], "k.c")?;
    let volume = parse_string_f64(&k["v"], "k.v")?;

    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(Candle {
        symbol,
        interval,
        open_time,
        close_time,
        open,
        high,
        low,
        close,
        volume,
        is_closed,
    })
}
