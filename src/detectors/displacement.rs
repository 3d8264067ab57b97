// =============================================================================
// Displacement Detection — candles whose body dwarfs the recent average
// =============================================================================
//
// A displacement candle signals aggressive one-sided participation: its body
// must exceed `factor` times the average body of the preceding `window`
// candles.  Displacement magnitude (the body size) is forwarded to the
// take-profit determiner as a projection distance.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::Direction;
use crate::market_data::Candle;

/// A detected displacement candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Displacement {
    /// Index of the displacement candle in the detection slice.
    pub index: usize,
    pub direction: Direction,
    /// Body size in price units.
    pub magnitude: f64,
    /// Ratio of body to the preceding average body.
    pub strength: f64,
    /// Close time of the candle, epoch milliseconds.
    pub time_ms: i64,
}

/// Detect every displacement candle in `candles`.
///
/// `window` is the number of preceding candles averaged; `factor` the minimum
/// body-to-average ratio. Doji-dominated windows (near-zero average body)
/// yield no detections rather than infinite strength readings.
pub fn detect_displacements(candles: &[Candle], window: usize, factor: f64) -> Vec<Displacement> {
    let mut out = Vec::new();
    if window == 0 || candles.len() <= window {
        return out;
    }

    for i in window..candles.len() {
        let c = &candles[i];
        let avg_body: f64 = candles[i - window..i]
            .iter()
            .map(Candle::body)
            .sum::<f64>()
            / window as f64;

        if avg_body <= f64::EPSILON {
            continue;
        }

        let strength = c.body() / avg_body;
        if strength >= factor && c.body() > 0.0 {
            out.push(Displacement {
                index: i,
                direction: if c.is_bullish() {
                    Direction::Bullish
                } else {
                    Direction::Bearish
                },
                magnitude: c.body(),
                strength,
                time_ms: c.close_time,
            });
        }
    }

    out
}

/// Most recent displacement in `direction`, if any.
pub fn last_displacement(
    candles: &[Candle],
    window: usize,
    factor: f64,
    direction: Direction,
) -> Option<Displacement> {
    detect_displacements(candles, window, factor)
        .into_iter()
        .rev()
        .find(|d| d.direction == direction)
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
            high: open.max(close) + 0.1,
            low: open.min(close) - 0.1,
            close,
            volume: 1.0,
            is_closed: true,
        }
    }

    #[test]
    fn detects_bullish_displacement() {
        // Four quiet candles (body 0.5) then a 3.0 body burst.
        let candles = vec![
            candle(0, 100.0, 100.5),
            candle(1, 100.5, 100.0),
            candle(2, 100.0, 100.5),
            candle(3, 100.5, 100.0),
            candle(4, 100.0, 103.0),
        ];
        let d = last_displacement(&candles, 4, 2.0, Direction::Bullish).expect("displacement");
        assert_eq!(d.index, 4);
        assert!((d.magnitude - 3.0).abs() < f64::EPSILON);
        assert!(d.strength >= 2.0);
    }

    #[test]
    fn quiet_market_yields_nothing() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| candle(i, 100.0, if i % 2 == 0 { 100.4 } else { 99.6 }))
            .collect();
        assert!(detect_displacements(&candles, 4, 2.5).is_empty());
    }

    #[test]
    fn bearish_displacement_direction() {
        let candles = vec![
            candle(0, 100.0, 100.4),
            candle(1, 100.4, 100.0),
            candle(2, 100.0, 100.4),
            candle(3, 100.4, 100.0),
            candle(4, 100.0, 97.0),
        ];
        let d = last_displacement(&candles, 4, 2.0, Direction::Bearish).expect("displacement");
        assert_eq!(d.direction, Direction::Bearish);
        assert!(last_displacement(&candles, 4, 2.0, Direction::Bullish).is_none());
    }

    #[test]
    fn doji_window_does_not_divide_by_zero() {
        let candles = vec![
            candle(0, 100.0, 100.0),
            candle(1, 100.0, 100.0),
            candle(2, 100.0, 100.0),
            candle(3, 100.0, 100.0),
            candle(4, 100.0, 105.0),
        ];
        assert!(detect_displacements(&candles, 4, 2.0).is_empty());
    }
}
