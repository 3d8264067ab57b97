// =============================================================================
// Swing Point Detection — local extrema over a symmetric lookback window
// =============================================================================
//
// A candle at index i is a swing high when its high strictly exceeds the
// highs of the `lookback` candles on both sides (mirror rule for swing lows).
// The last `lookback` candles of a series can therefore never be confirmed
// swings; callers needing the freshest structure should use a small lookback.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// Kind of swing extremum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwingKind {
    High,
    Low,
}

/// A confirmed local extremum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    /// Index into the candle slice the detection ran over.
    pub index: usize,
    pub price: f64,
    pub kind: SwingKind,
    /// Close time of the swing candle, epoch milliseconds.
    pub time_ms: i64,
}

/// Detect all confirmed swing points in `candles` using a symmetric
/// `lookback` window. Returns points in chronological order.
pub fn detect_swings(candles: &[Candle], lookback: usize) -> Vec<SwingPoint> {
    let mut swings = Vec::new();
    if lookback == 0 || candles.len() < 2 * lookback + 1 {
        return swings;
    }

    for i in lookback..candles.len() - lookback {
        let c = &candles[i];

        let is_high = (i - lookback..i + lookback + 1)
            .filter(|&j| j != i)
            .all(|j| candles[j].high < c.high);
        if is_high {
            swings.push(SwingPoint {
                index: i,
                price: c.high,
                kind: SwingKind::High,
                time_ms: c.close_time,
            });
            continue;
        }

        let is_low = (i - lookback..i + lookback + 1)
            .filter(|&j| j != i)
            .all(|j| candles[j].low > c.low);
        if is_low {
            swings.push(SwingPoint {
                index: i,
                price: c.low,
                kind: SwingKind::Low,
                time_ms: c.close_time,
            });
        }
    }

    swings
}

/// The most recent confirmed swing high, if any.
pub fn last_swing_high(candles: &[Candle], lookback: usize) -> Option<SwingPoint> {
    detect_swings(candles, lookback)
        .into_iter()
        .rev()
        .find(|s| s.kind == SwingKind::High)
}

/// The most recent confirmed swing low, if any.
pub fn last_swing_low(candles: &[Candle], lookback: usize) -> Option<SwingPoint> {
    detect_swings(candles, lookback)
        .into_iter()
        .rev()
        .find(|s| s.kind == SwingKind::Low)
}
