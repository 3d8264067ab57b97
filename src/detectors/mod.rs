// =============================================================================
// Pattern Detectors Module
// =============================================================================
//
// Pure, side-effect-free detectors over candle slices: swing points, fair
// value gaps, order blocks, displacement candles, and kill-zone session
// gating.  Every public function returns `Option<T>` or an empty collection
// so callers are forced to handle insufficient-data scenarios.
//
// Detector output feeds entry determiners, which forward zone data to the
// pricing determiners through `price_extras`.

pub mod displacement;
pub mod fvg;
pub mod kill_zone;
pub mod order_block;
pub mod swing;

pub use displacement::{detect_displacements, last_displacement, Displacement};
pub use fvg::{detect_fvgs, latest_unfilled_fvg, FvgZone};
pub use kill_zone::{default_kill_zones, in_any_kill_zone, KillZone};
pub use order_block::{detect_order_blocks, latest_order_block, ObZone};
pub use swing::{detect_swings, last_swing_high, last_swing_low, SwingKind, SwingPoint};

/// Direction of a detected structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
        }
    }
}
