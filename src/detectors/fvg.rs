// =============================================================================
// Fair Value Gap (FVG) Detection — three-candle imbalance zones
// =============================================================================
//
// A bullish FVG exists at candle i when candles[i-2].high < candles[i].low:
// the middle candle moved so fast that the wicks of its neighbours never
// overlapped, leaving an unfilled zone [prev.high, next.low].  Bearish is the
// mirror image.  A gap counts as filled once a later candle trades back
// through the whole zone.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::Direction;
use crate::market_data::Candle;

/// An unfilled (or partially filled) fair value gap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FvgZone {
    /// Upper bound of the gap in price units.
    pub upper: f64,
    /// Lower bound of the gap in price units.
    pub lower: f64,
    pub direction: Direction,
    /// Index of the third (confirming) candle in the detection slice.
    pub index: usize,
    /// Close time of the confirming candle, epoch milliseconds.
    pub time_ms: i64,
}

impl FvgZone {
    /// Zone height in price units.
    pub fn height(&self) -> f64 {
        self.upper - self.lower
    }

    /// Midpoint of the zone (the "consequent encroachment" level).
    pub fn midpoint(&self) -> f64 {
        (self.upper + self.lower) / 2.0
    }

    /// True when `price` lies inside the zone bounds.
    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower && price <= self.upper
    }
}

/// Detect all FVGs in `candles`, dropping zones a later candle fully filled.
pub fn detect_fvgs(candles: &[Candle]) -> Vec<FvgZone> {
    let mut zones: Vec<FvgZone> = Vec::new();
    if candles.len() < 3 {
        return zones;
    }

    for i in 2..candles.len() {
        let first = &candles[i - 2];
        let third = &candles[i];

        if first.high < third.low {
            zones.push(FvgZone {
                upper: third.low,
                lower: first.high,
                direction: Direction::Bullish,
                index: i,
                time_ms: third.close_time,
            });
        } else if first.low > third.high {
            zones.push(FvgZone {
                upper: first.low,
                lower: third.high,
                direction: Direction::Bearish,
                index: i,
                time_ms: third.close_time,
            });
        }
    }

    // Remove zones that price later traded back through entirely.
    zones.retain(|zone| {
        !candles[zone.index + 1..].iter().any(|c| match zone.direction {
            Direction::Bullish => c.low <= zone.lower,
            Direction::Bearish => c.high >= zone.upper,
        })
    });

    zones
}

/// The most recent unfilled FVG in `direction`, if any.
pub fn latest_unfilled_fvg(candles: &[Candle], direction: Direction) -> Option<FvgZone> {
    detect_fvgs(candles)
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

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "5m".into(),
            open_time: i * 300_000,
            close_time: (i + 1) * 300_000 - 1,
            open,
            high,
            low,
            close,
            volume: 1.0,
            is_closed: true,
        }
    }

    #[test]
    fn detects_bullish_gap() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5),
            candle(1, 100.5, 104.0, 100.4, 103.8), // displacement candle
            candle(2, 103.8, 105.0, 102.5, 104.5), // low 102.5 > first high 101.0
        ];
        let zones = detect_fvgs(&candles);
        assert_eq!(zones.len(), 1);
        let z = zones[0];
        assert_eq!(z.direction, Direction::Bullish);
        assert!((z.lower - 101.0).abs() < f64::EPSILON);
        assert!((z.upper - 102.5).abs() < f64::EPSILON);
        assert!(z.contains(102.0));
        assert!((z.midpoint() - 101.75).abs() < f64::EPSILON);
    }

    #[test]
    fn detects_bearish_gap() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 99.5),
            candle(1, 99.5, 99.6, 95.0, 95.2),
            candle(2, 95.2, 96.5, 94.0, 94.5), // high 96.5 < first low 99.0
        ];
        let z = latest_unfilled_fvg(&candles, Direction::Bearish).expect("bearish fvg");
        assert!((z.upper - 99.0).abs() < f64::EPSILON);
        assert!((z.lower - 96.5).abs() < f64::EPSILON);
    }

    #[test]
    fn filled_gap_is_dropped() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5),
            candle(1, 100.5, 104.0, 100.4, 103.8),
            candle(2, 103.8, 105.0, 102.5, 104.5),
            // Trades all the way back below the zone's lower bound.
            candle(3, 104.5, 104.6, 100.5, 100.8),
        ];
        assert!(latest_unfilled_fvg(&candles, Direction::Bullish).is_none());
    }

    #[test]
    fn overlapping_candles_produce_no_gap() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5),
            candle(1, 100.5, 101.5, 100.0, 101.0),
            candle(2, 101.0, 102.0, 100.5, 101.5),
        ];
        assert!(detect_fvgs(&candles).is_empty());
    }
}
