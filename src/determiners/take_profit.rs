// =============================================================================
// Take-Profit Determiners — displacement projection with RR-multiple fallback
// =============================================================================
//
// `DisplacementTarget` projects the displacement magnitude that triggered the
// entry forward from the entry price; without a `displacement_size` extra it
// degrades to an RR multiple of the stop distance, so any entry determiner
// can be paired with it.
// =============================================================================

use serde::Deserialize;
use tracing::debug;

use crate::strategy::module::{PriceContext, TakeProfitDeterminer};
use crate::types::PositionSide;

// ---------------------------------------------------------------------------
// DisplacementTarget
// ---------------------------------------------------------------------------

/// Parameters for [`DisplacementTarget`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplacementTargetParams {
    /// Multiplier applied to the displacement magnitude.
    pub projection: f64,
    /// Fallback reward-to-risk multiple when no displacement extra exists.
    pub fallback_rr: f64,
}

impl Default for DisplacementTargetParams {
    fn default() -> Self {
        Self {
            projection: 1.0,
            fallback_rr: 2.0,
        }
    }
}

/// Take-profit projected from the entry displacement.
#[derive(Debug)]
pub struct DisplacementTarget {
    params: DisplacementTargetParams,
}

impl DisplacementTarget {
    pub fn new(params: DisplacementTargetParams) -> Self {
        Self { params }
    }
}

impl TakeProfitDeterminer for DisplacementTarget {
    fn name(&self) -> &'static str {
        "displacement"
    }

    fn compute(&self, ctx: &PriceContext, stop_loss: f64) -> f64 {
        let sign = ctx.side.sign();

        if let Some(size) = ctx.extra_f64("displacement_size") {
            if size > 0.0 {
                let tp = ctx.entry_price + sign * size * self.params.projection;
                debug!(symbol = %ctx.symbol, tp, size, "displacement take-profit placed");
                return tp;
            }
        }

        let risk = (ctx.entry_price - stop_loss).abs();
        let tp = ctx.entry_price + sign * risk * self.params.fallback_rr;
        debug!(symbol = %ctx.symbol, tp, "take-profit fell back to RR multiple");
        tp
    }
}

// ---------------------------------------------------------------------------
// RrTarget
// ---------------------------------------------------------------------------

/// Parameters for [`RrTarget`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RrTargetParams {
    /// Reward-to-risk multiple of the stop distance.
    pub rr: f64,
}

impl Default for RrTargetParams {
    fn default() -> Self {
        Self { rr: 2.0 }
    }
}

/// Pure RR-multiple take-profit: needs nothing from `price_extras`.
#[derive(Debug)]
pub struct RrTarget {
    params: RrTargetParams,
}

impl RrTarget {
    pub fn new(params: RrTargetParams) -> Self {
        Self { params }
    }
}

impl TakeProfitDeterminer for RrTarget {
    fn name(&self) -> &'static str {
        "rr"
    }

    fn compute(&self, ctx: &PriceContext, stop_loss: f64) -> f64 {
        let risk = (ctx.entry_price - stop_loss).abs();
        ctx.entry_price + ctx.side.sign() * risk * self.params.rr
    }
}
