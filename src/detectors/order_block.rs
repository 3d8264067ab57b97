// =============================================================================
// Order Block Detection — the last opposing candle before a displacement
// =============================================================================
//
// A bullish order block is the final bearish candle immediately preceding a
// bullish displacement: the zone where resting institutional orders absorbed
// the selling before driving price up.  Its body range [open, close] is the
// zone of interest for stop placement.  Bearish order blocks mirror this.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::displacement::detect_displacements;
use super::Direction;
use crate::market_data::Candle;

/// An order block zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObZone {
    /// Upper bound of the block's body range.
    pub upper: f64,
    /// Lower bound of the block's body range.
    pub lower: f64,
    /// Direction of the move the block precedes (a bullish OB fuels longs).
    pub direction: Direction,
    /// Index of the order-block candle in the detection slice.
    pub index: usize,
    /// Close time of the block candle, epoch milliseconds.
    pub time_ms: i64,
}

impl ObZone {
    pub fn height(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Detect order blocks: for every displacement, walk back to the nearest
/// opposing candle and record its body range.
pub fn detect_order_blocks(candles: &[Candle], window: usize, factor: f64) -> Vec<ObZone> {
    let mut zones = Vec::new();

    for disp in detect_displacements(candles, window, factor) {
        // Walk backwards from the displacement candle looking for the last
        // candle of the opposite colour.
        let opposing = candles[..disp.index].iter().enumerate().rev().find(|(_, c)| {
            match disp.direction {
                Direction::Bullish => c.is_bearish(),
                Direction::Bearish => c.is_bullish(),
            }
        });

        if let Some((idx, block)) = opposing {
            zones.push(ObZone {
                upper: block.open.max(block.close),
                lower: block.open.min(block.close),
                direction: disp.direction,
                index: idx,
                time_ms: block.close_time,
            });
        }
    }

    zones
}

/// Most recent order block in `direction`, if any.
pub fn latest_order_block(
    candles: &[Candle],
    window: usize,
    factor: f64,
    direction: Direction,
) -> Option<ObZone> {
    detect_order_blocks(candles, window, factor)
        .into_iter()
        .rev()
        .find(|z| z.direction == direction)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, open: f64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "5m".into(),
            open_time: i * 300_000,
            close_time: (i + 1) * 300_000 - 1,
            open,
            high: open.max(close) + 0.2,
            low: open.min(close) - 0.2,
            close,
            volume: 1.0,
            is_closed: true,
        }
    }

    #[test]
    fn bullish_ob_is_last_bearish_candle_before_burst() {
        let candles = vec![
            candle(0, 100.0, 100.5), // bullish
            candle(1, 100.5, 100.1), // small bearish
            candle(2, 100.1, 100.5), // bullish
            candle(3, 100.5, 100.0), // bearish — the order block
            candle(4, 100.0, 103.5), // bullish displacement
        ];
        let ob = latest_order_block(&candles, 4, 2.0, Direction::Bullish).expect("order block");
        assert_eq!(ob.index, 3);
        assert!((ob.upper - 100.5).abs() < f64::EPSILON);
        assert!((ob.lower - 100.0).abs() < f64::EPSILON);
        assert!((ob.height() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn bearish_ob_is_last_bullish_candle_before_drop() {
        let candles = vec![
            candle(0, 100.0, 99.8),
            candle(1, 99.8, 100.3), // bullish — the order block
            candle(2, 100.3, 100.1),
            candle(3, 100.1, 100.0),
            candle(4, 100.0, 96.5), // bearish displacement
        ];
        let ob = latest_order_block(&candles, 4, 2.0, Direction::Bearish).expect("order block");
        assert_eq!(ob.index, 1);
        assert!((ob.upper - 100.3).abs() < f64::EPSILON);
        assert!((ob.lower - 99.8).abs() < f64::EPSILON);
    }

    #[test]
    fn no_displacement_no_blocks() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| candle(i, 100.0, if i % 2 == 0 { 100.3 } else { 99.7 }))
            .collect();
        assert!(detect_order_blocks(&candles, 4, 3.0).is_empty());
    }
}
