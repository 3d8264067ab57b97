// =============================================================================
// ICT Entry Determiner — kill zone + HTF bias + displacement/FVG confluence
// =============================================================================
//
// Three-timeframe confluence model:
//
//   HTF  — market structure bias from swing points (higher highs + higher
//          lows = bullish, the mirror = bearish; anything else = no trade).
//   MTF  — momentum agreement: the recent close must have moved in the bias
//          direction over the lookback.
//   LTF  — execution: a fresh displacement candle in the bias direction with
//          an unfilled fair value gap left behind it.
//
// The FVG zone, any order block and the displacement magnitude are forwarded
// to the pricing determiners through `price_extras`.  Entries are gated to
// the configured kill-zone session windows.
// =============================================================================

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::detectors::{
    default_kill_zones, detect_swings, in_any_kill_zone, last_displacement, latest_order_block,
    latest_unfilled_fvg, Direction, KillZone, SwingKind,
};
use crate::market_data::Candle;
use crate::strategy::buffer::StrategyBuffers;
use crate::strategy::module::{EntryDecision, EntryDeterminer};
use crate::types::SignalKind;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Parameters for [`IctEntry`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IctEntryParams {
    /// Execution timeframe.
    pub ltf: String,
    /// Momentum-confirmation timeframe.
    pub mtf: String,
    /// Structure-bias timeframe.
    pub htf: String,
    /// Symmetric swing-detection lookback on the HTF.
    pub swing_lookback: usize,
    /// Displacement detection window on the LTF.
    pub displacement_window: usize,
    /// Minimum body-to-average ratio for a displacement candle.
    pub displacement_factor: f64,
    /// The displacement must sit within this many candles of the present.
    pub recent_candles: usize,
    /// MTF momentum lookback in candles.
    pub mtf_momentum_lookback: usize,
    /// Gate entries to the kill-zone session windows.
    pub use_kill_zones: bool,
    /// Session windows; empty means no gating even when enabled.
    pub kill_zones: Vec<KillZone>,
}

impl Default for IctEntryParams {
    fn default() -> Self {
        Self {
            ltf: "5m".to_string(),
            mtf: "15m".to_string(),
            htf: "1h".to_string(),
            swing_lookback: 3,
            displacement_window: 12,
            displacement_factor: 2.0,
            recent_candles: 5,
            mtf_momentum_lookback: 8,
            use_kill_zones: true,
            kill_zones: default_kill_zones(),
        }
    }
}

// ---------------------------------------------------------------------------
// IctEntry
// ---------------------------------------------------------------------------

/// The reference entry determiner.
#[derive(Debug)]
pub struct IctEntry {
    symbol: String,
    params: IctEntryParams,
}

impl IctEntry {
    pub fn new(symbol: impl Into<String>, params: IctEntryParams) -> Self {
        Self {
            symbol: symbol.into(),
            params,
        }
    }

    /// Market-structure bias from HTF swing sequences. `None` when the
    /// structure is mixed or there are too few confirmed swings.
    fn htf_bias(&self, htf_candles: &[Candle]) -> Option<Direction> {
        let swings = detect_swings(htf_candles, self.params.swing_lookback);

        let highs: Vec<f64> = swings
            .iter()
            .filter(|s| s.kind == SwingKind::High)
            .map(|s| s.price)
            .collect();
        let lows: Vec<f64> = swings
            .iter()
            .filter(|s| s.kind == SwingKind::Low)
            .map(|s| s.price)
            .collect();

        if highs.len() < 2 || lows.len() < 2 {
            return None;
        }

        let hh = highs[highs.len() - 1] > highs[highs.len() - 2];
        let hl = lows[lows.len() - 1] > lows[lows.len() - 2];
        let lh = highs[highs.len() - 1] < highs[highs.len() - 2];
        let ll = lows[lows.len() - 1] < lows[lows.len() - 2];

        if hh && hl {
            Some(Direction::Bullish)
        } else if lh && ll {
            Some(Direction::Bearish)
        } else {
            None
        }
    }

    /// MTF momentum must agree with the bias direction.
    fn mtf_agrees(&self, mtf_candles: &[Candle], bias: Direction) -> bool {
        let lookback = self.params.mtf_momentum_lookback;
        if mtf_candles.len() <= lookback {
            return false;
        }
        let last = mtf_candles[mtf_candles.len() - 1].close;
        let past = mtf_candles[mtf_candles.len() - 1 - lookback].close;
        match bias {
            Direction::Bullish => last > past,
            Direction::Bearish => last < past,
        }
    }
}

impl EntryDeterminer for IctEntry {
    fn name(&self) -> &'static str {
        "ict"
    }

    fn required_intervals(&self) -> BTreeSet<String> {
        [
            self.params.ltf.clone(),
            self.params.mtf.clone(),
            self.params.htf.clone(),
        ]
        .into_iter()
        .collect()
    }

    fn decide(&mut self, buffers: &StrategyBuffers, candle: &Candle) -> Option<EntryDecision> {
        // Only act on a closed execution-timeframe candle.
        if candle.interval != self.params.ltf || !candle.is_closed {
            return None;
        }

        // Session gate.
        if self.params.use_kill_zones
            && !in_any_kill_zone(&self.params.kill_zones, candle.close_time)
        {
            debug!(symbol = %self.symbol, "entry skipped — outside kill zones");
            return None;
        }

        let htf = buffers.closed(&self.params.htf);
        let bias = self.htf_bias(&htf)?;

        let mtf = buffers.closed(&self.params.mtf);
        if !self.mtf_agrees(&mtf, bias) {
            debug!(symbol = %self.symbol, bias = %bias, "entry skipped — MTF momentum disagrees");
            return None;
        }

        let ltf = buffers.closed(&self.params.ltf);

        // Fresh displacement in the bias direction.
        let disp = last_displacement(
            &ltf,
            self.params.displacement_window,
            self.params.displacement_factor,
            bias,
        )?;
        if disp.index + self.params.recent_candles < ltf.len() {
            debug!(symbol = %self.symbol, "entry skipped — displacement too old");
            return None;
        }

        // The displacement must have left an unfilled gap behind it.
        let fvg = latest_unfilled_fvg(&ltf, bias)?;

        let ob = latest_order_block(
            &ltf,
            self.params.displacement_window,
            self.params.displacement_factor,
            bias,
        );

        let kind = match bias {
            Direction::Bullish => SignalKind::EntryLong,
            Direction::Bearish => SignalKind::EntryShort,
        };

        let confidence = {
            let base = 0.5;
            let ob_bonus = if ob.is_some() { 0.2 } else { 0.0 };
            let strength_bonus =
                ((disp.strength - self.params.displacement_factor) * 0.1).clamp(0.0, 0.3);
            (base + ob_bonus + strength_bonus).min(1.0)
        };

        let mut decision = EntryDecision::new(kind, candle.close, confidence)
            .with_extra("fvg_zone", json!({ "upper": fvg.upper, "lower": fvg.lower }))
            .with_extra("displacement_size", json!(disp.magnitude))
            .with_metadata("htf_bias", json!(bias.to_string()))
            .with_metadata("displacement_strength", json!(disp.strength));

        if let Some(ob) = ob {
            decision = decision
                .with_extra("ob_zone", json!({ "upper": ob.upper, "lower": ob.lower }));
        }

        debug!(
            symbol = %self.symbol,
            kind = %kind,
            entry_price = decision.entry_price,
            confidence,
            "entry decision produced"
        );
        Some(decision)
    }
}
