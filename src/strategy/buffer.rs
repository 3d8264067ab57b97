// =============================================================================
// SeriesBuffer — bounded per-(symbol, interval) candle ring
// =============================================================================
//
// Insertion order is time order; candles are deduplicated on `close_time`.
// The last element may be the in-progress (unclosed) candle, which is
// replaced in place when either a newer tick or the final closed version of
// the same period arrives.  `close_time` is strictly increasing within a
// buffer; stale candles are ignored.
// =============================================================================

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::market_data::Candle;

/// Default ring capacity per (symbol, interval) series.
pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// A bounded ring of candles for one (symbol, interval) series.
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl SeriesBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Insert or replace a candle, maintaining the ordering and dedup
    /// invariants. Returns `true` when the buffer changed.
    pub fn update(&mut self, candle: Candle) -> bool {
        match self.candles.back() {
            Some(last) if candle.close_time == last.close_time => {
                // Same period: in-progress tick replacement, or the closed
                // version superseding the live one. A duplicate closed candle
                // collapses to a single entry either way.
                *self.candles.back_mut().expect("non-empty ring") = candle;
                true
            }
            Some(last) if candle.close_time < last.close_time => {
                // Stale — would break the strictly-increasing invariant.
                false
            }
            _ => {
                self.candles.push_back(candle);
                while self.candles.len() > self.capacity {
                    self.candles.pop_front();
                }
                true
            }
        }
    }

    /// All candles, oldest first, including any in-progress last element.
    pub fn candles(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Snapshot of the closed candles only (oldest first).
    pub fn closed(&self) -> Vec<Candle> {
        self.candles.iter().filter(|c| c.is_closed).cloned().collect()
    }

    /// Number of closed candles held.
    pub fn closed_count(&self) -> usize {
        self.candles.iter().filter(|c| c.is_closed).count()
    }

    /// The most recent closed candle, if any.
    pub fn last_closed(&self) -> Option<&Candle> {
        self.candles.iter().rev().find(|c| c.is_closed)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StrategyBuffers — the interval → ring map a strategy owns
// ---------------------------------------------------------------------------

/// Per-strategy candle storage: one ring per required interval tag.
///
/// A single-interval strategy is simply the degenerate case with one entry.
#[derive(Debug)]
pub struct StrategyBuffers {
    buffers: HashMap<String, SeriesBuffer>,
    /// Minimum closed candles required per interval before the strategy is
    /// considered ready.
    min_depth: usize,
}

impl StrategyBuffers {
    /// Create one ring per interval in `intervals`.
    pub fn new(intervals: &BTreeSet<String>, capacity: usize, min_depth: usize) -> Self {
        let buffers = intervals
            .iter()
            .map(|iv| (iv.clone(), SeriesBuffer::new(capacity)))
            .collect();
        Self { buffers, min_depth }
    }

    /// Route a candle into its interval ring. Candles for intervals this
    /// strategy never declared are ignored.
    pub fn update(&mut self, candle: Candle) -> bool {
        match self.buffers.get_mut(&candle.interval) {
            Some(ring) => ring.update(candle),
            None => false,
        }
    }

    /// True only when every declared interval holds at least `min_depth`
    /// closed candles.
    pub fn is_ready(&self) -> bool {
        !self.buffers.is_empty()
            && self
                .buffers
                .values()
                .all(|ring| ring.closed_count() >= self.min_depth)
    }

    /// The ring for `interval`, if declared.
    pub fn get(&self, interval: &str) -> Option<&SeriesBuffer> {
        self.buffers.get(interval)
    }

    /// Closed candles for `interval` (empty when undeclared).
    pub fn closed(&self, interval: &str) -> Vec<Candle> {
        self.buffers
            .get(interval)
            .map(SeriesBuffer::closed)
            .unwrap_or_default()
    }

    /// Declared interval tags.
    pub fn intervals(&self) -> impl Iterator<Item = &String> {
        self.buffers.keys()
    }

    pub fn min_depth(&self) -> usize {
        self.min_depth
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "5m".into(),
            open_time: close_time - 300_000,
            close_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            is_closed,
        }
    }

    fn intervals(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ring_trims_to_capacity() {
        let mut ring = SeriesBuffer::new(3);
        for i in 0..5 {
            ring.update(candle(i * 300_000, 100.0 + i as f64, true));
        }
        assert_eq!(ring.len(), 3);
        let closes: Vec<f64> = ring.candles().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn duplicate_close_time_collapses_to_one_entry() {
        let mut ring = SeriesBuffer::new(10);
        ring.update(candle(300_000, 100.0, true));
        ring.update(candle(300_000, 100.0, true));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn live_candle_replaced_in_place_by_closed_version() {
        let mut ring = SeriesBuffer::new(10);
        ring.update(candle(300_000, 100.0, false));
        ring.update(candle(300_000, 100.5, false));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.closed_count(), 0);

        ring.update(candle(300_000, 101.0, true));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.closed_count(), 1);
        assert!((ring.last_closed().unwrap().close - 101.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_candle_ignored() {
        let mut ring = SeriesBuffer::new(10);
        ring.update(candle(600_000, 101.0, true));
        assert!(!ring.update(candle(300_000, 100.0, true)));
        assert_eq!(ring.len(), 1);
        // close_time stays strictly increasing.
        let times: Vec<i64> = ring.candles().map(|c| c.close_time).collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn readiness_requires_every_interval() {
        let mut buffers = StrategyBuffers::new(&intervals(&["5m", "1h"]), 100, 2);
        assert!(!buffers.is_ready());

        for i in 0..2 {
            buffers.update(candle(i * 300_000 + 300_000, 100.0, true));
        }
        // 5m has depth 2; 1h still empty.
        assert!(!buffers.is_ready());

        for i in 0..2 {
            let mut c = candle(i * 3_600_000 + 3_600_000, 100.0, true);
            c.interval = "1h".into();
            buffers.update(c);
        }
        assert!(buffers.is_ready());
    }

    #[test]
    fn undeclared_interval_is_ignored() {
        let mut buffers = StrategyBuffers::new(&intervals(&["5m"]), 100, 1);
        let mut c = candle(300_000, 100.0, true);
        c.interval = "15m".into();
        assert!(!buffers.update(c));
        assert!(buffers.closed("15m").is_empty());
    }
}
