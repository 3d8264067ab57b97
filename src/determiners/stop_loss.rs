// =============================================================================
// Stop-Loss Determiners — zone-based placement with percentage fallback
// =============================================================================
//
// `ZoneStop` places the stop just beyond the structure that justified the
// entry (FVG or order-block zone from `price_extras`); when neither zone is
// present it degrades to a plain percentage stop, so any entry determiner can
// be paired with it.
// =============================================================================

use serde::Deserialize;
use tracing::debug;

use crate::strategy::module::{PriceContext, StopLossDeterminer};
use crate::types::PositionSide;

// ---------------------------------------------------------------------------
// ZoneStop
// ---------------------------------------------------------------------------

/// Parameters for [`ZoneStop`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZoneStopParams {
    /// Extra distance beyond the zone edge, as a fraction of price.
    pub zone_buffer_pct: f64,
    /// Fallback stop distance when no zone extra is present.
    pub fallback_pct: f64,
}

impl Default for ZoneStopParams {
    fn default() -> Self {
        Self {
            zone_buffer_pct: 0.0005,
            fallback_pct: 0.01,
        }
    }
}

/// Stop-loss behind the entry zone (`fvg_zone`, then `ob_zone`), with a
/// percentage fallback.
#[derive(Debug)]
pub struct ZoneStop {
    params: ZoneStopParams,
}

impl ZoneStop {
    pub fn new(params: ZoneStopParams) -> Self {
        Self { params }
    }

    /// The protective edge of whichever zone is available: the lower bound
    /// for longs, the upper bound for shorts.
    fn zone_edge(&self, ctx: &PriceContext) -> Option<f64> {
        let field = match ctx.side {
            PositionSide::Long => "lower",
            PositionSide::Short => "upper",
            PositionSide::Flat => return None,
        };
        ctx.extra_field_f64("fvg_zone", field)
            .or_else(|| ctx.extra_field_f64("ob_zone", field))
    }
}

impl StopLossDeterminer for ZoneStop {
    fn name(&self) -> &'static str {
        "zone"
    }

    fn compute(&self, ctx: &PriceContext) -> f64 {
        if let Some(edge) = self.zone_edge(ctx) {
            let sl = match ctx.side {
                PositionSide::Long => edge * (1.0 - self.params.zone_buffer_pct),
                PositionSide::Short => edge * (1.0 + self.params.zone_buffer_pct),
                PositionSide::Flat => ctx.entry_price,
            };
            // A zone edge on the wrong side of the entry (stale structure)
            // falls through to the percentage stop.
            let protective = (ctx.entry_price - sl) * ctx.side.sign() > 0.0;
            if protective {
                debug!(symbol = %ctx.symbol, sl, "zone stop placed");
                return sl;
            }
        }

        let sl = match ctx.side {
            PositionSide::Long => ctx.entry_price * (1.0 - self.params.fallback_pct),
            _ => ctx.entry_price * (1.0 + self.params.fallback_pct),
        };
        debug!(symbol = %ctx.symbol, sl, "zone stop fell back to percentage");
        sl
    }
}

// ---------------------------------------------------------------------------
// PercentStop
// ---------------------------------------------------------------------------

/// Parameters for [`PercentStop`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PercentStopParams {
    /// Stop distance as a fraction of entry price.
    pub pct: f64,
}

impl Default for PercentStopParams {
    fn default() -> Self {
        Self { pct: 0.01 }
    }
}

/// Fixed-percentage stop: needs nothing from `price_extras`.
#[derive(Debug)]
pub struct PercentStop {
    params: PercentStopParams,
}

impl PercentStop {
    pub fn new(params: PercentStopParams) -> Self {
        Self { params }
    }
}

impl StopLossDeterminer for PercentStop {
    fn name(&self) -> &'static str {
        "percent"
    }

    fn compute(&self, ctx: &PriceContext) -> f64 {
        match ctx.side {
            PositionSide::Long => ctx.entry_price * (1.0 - self.params.pct),
            _ => ctx.entry_price * (1.0 + self.params.pct),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx_with(
        side: PositionSide,
        entry: f64,
        extras: &[(&str, serde_json::Value)],
    ) -> PriceContext {
        let extras: HashMap<String, serde_json::Value> = extras
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        PriceContext::new("BTCUSDT", side, entry, extras)
    }

    #[test]
    fn long_stop_sits_below_fvg_zone() {
        let sl = ZoneStop::new(ZoneStopParams::default()).compute(&ctx_with(
            PositionSide::Long,
            100.0,
            &[("fvg_zone", json!({ "upper": 99.8, "lower": 99.0 }))],
        ));
        assert!(sl < 99.0);
        assert!(sl > 98.5);
    }

    #[test]
    fn short_stop_sits_above_ob_zone() {
        let sl = ZoneStop::new(ZoneStopParams::default()).compute(&ctx_with(
            PositionSide::Short,
            100.0,
            &[("ob_zone", json!({ "upper": 101.0, "lower": 100.4 }))],
        ));
        assert!(sl > 101.0);
    }

    #[test]
    fn empty_extras_fall_back_to_one_percent() {
        let sl = ZoneStop::new(ZoneStopParams::default())
            .compute(&ctx_with(PositionSide::Long, 100.0, &[]));
        assert!((sl - 99.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_side_zone_falls_back() {
        // Zone lower bound above entry — unusable for a long stop.
        let sl = ZoneStop::new(ZoneStopParams::default()).compute(&ctx_with(
            PositionSide::Long,
            100.0,
            &[("fvg_zone", json!({ "upper": 103.0, "lower": 101.0 }))],
        ));
        assert!((sl - 99.0).abs() < 1e-9);
    }

    #[test]
    fn percent_stop_both_sides() {
        let stop = PercentStop::new(PercentStopParams { pct: 0.02 });
        let long = stop.compute(&ctx_with(PositionSide::Long, 100.0, &[]));
        let short = stop.compute(&ctx_with(PositionSide::Short, 100.0, &[]));
        assert!((long - 98.0).abs() < 1e-9);
        assert!((short - 102.0).abs() < 1e-9);
    }
}
