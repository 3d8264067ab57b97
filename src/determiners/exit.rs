// =============================================================================
// Exit Determiner — trailing stop with breakeven, time-limit and reversal
// =============================================================================
//
// Owns per-(symbol, side) trailing state keyed by `"{symbol}_{side}"`.  The
// trail follows the best price seen since entry at a fixed percentage
// distance; once price has moved `breakeven_trigger_pct` in favour, a
// breakeven floor at the entry price is armed.  A position held longer than
// `max_hold_secs` exits on time; an opposing displacement candle exits on
// structure reversal.
//
// State re-initialises automatically when a new position (different entry
// price) appears under the same key, and is dropped when an exit fires.
// =============================================================================

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use crate::detectors::{last_displacement, Direction};
use crate::market_data::Candle;
use crate::position::Position;
use crate::strategy::buffer::StrategyBuffers;
use crate::strategy::module::ExitDeterminer;
use crate::types::{ExitReason, PositionSide, Signal, SignalKind};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Parameters for [`TrailingExit`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrailingExitParams {
    /// Trail distance as a fraction of the best price.
    pub trail_pct: f64,
    /// Favourable move (fraction of entry) that arms the breakeven floor.
    pub breakeven_trigger_pct: f64,
    /// Maximum holding time in seconds; 0 disables the time exit.
    pub max_hold_secs: u64,
    /// Displacement detection window for the reversal exit.
    pub reversal_window: usize,
    /// Displacement strength factor for the reversal exit; 0 disables it.
    pub reversal_factor: f64,
}

impl Default for TrailingExitParams {
    fn default() -> Self {
        Self {
            trail_pct: 0.005,
            breakeven_trigger_pct: 0.01,
            max_hold_secs: 86_400,
            reversal_window: 12,
            reversal_factor: 2.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-position state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TrailState {
    entry_price: f64,
    /// Highest close for longs, lowest for shorts.
    best_price: f64,
    trail_level: f64,
    breakeven_armed: bool,
    /// Close time of the first candle observed for this position.
    opened_ms: i64,
}

impl TrailState {
    fn init(entry_price: f64, side: PositionSide, trail_pct: f64, now_ms: i64) -> Self {
        Self {
            entry_price,
            best_price: entry_price,
            trail_level: trail_from(entry_price, side, trail_pct),
            breakeven_armed: false,
            opened_ms: now_ms,
        }
    }
}

fn trail_from(best: f64, side: PositionSide, trail_pct: f64) -> f64 {
    match side {
        PositionSide::Long => best * (1.0 - trail_pct),
        _ => best * (1.0 + trail_pct),
    }
}

// ---------------------------------------------------------------------------
// TrailingExit
// ---------------------------------------------------------------------------

/// The reference exit determiner.
#[derive(Debug)]
pub struct TrailingExit {
    params: TrailingExitParams,
    state: HashMap<String, TrailState>,
}

impl TrailingExit {
    pub fn new(params: TrailingExitParams) -> Self {
        Self {
            params,
            state: HashMap::new(),
        }
    }

    fn key(position: &Position) -> String {
        format!("{}_{}", position.symbol, position.side)
    }

    /// Fetch-or-create the state entry, resetting when the entry price no
    /// longer matches (a new trade reused the key).
    fn state_for(&mut self, position: &Position, now_ms: i64) -> &mut TrailState {
        let key = Self::key(position);
        let params = &self.params;

        let stale = self
            .state
            .get(&key)
            .map(|s| (s.entry_price - position.entry_price).abs() > position.entry_price * 1e-9)
            .unwrap_or(true);

        if stale {
            debug!(
                symbol = %position.symbol,
                side = %position.side,
                entry_price = position.entry_price,
                "trail state initialised"
            );
            self.state.insert(
                key.clone(),
                TrailState::init(position.entry_price, position.side, params.trail_pct, now_ms),
            );
        }
        self.state.get_mut(&key).expect("state inserted above")
    }

    fn exit_signal(
        position: &Position,
        candle: &Candle,
        price: f64,
        reason: ExitReason,
    ) -> Signal {
        let kind = match position.side {
            PositionSide::Short => SignalKind::ExitShort,
            _ => SignalKind::ExitLong,
        };
        info!(
            symbol = %position.symbol,
            side = %position.side,
            price,
            reason = %reason,
            "exit determiner triggered"
        );
        Signal::exit(kind, &position.symbol, candle.close_time, price, "trailing", reason)
    }
}

impl ExitDeterminer for TrailingExit {
    fn name(&self) -> &'static str {
        "trailing"
    }

    fn evaluate(
        &mut self,
        position: &Position,
        candle: &Candle,
        buffers: &StrategyBuffers,
    ) -> Option<Signal> {
        if position.is_flat() || candle.symbol != position.symbol {
            return None;
        }

        let side = position.side;
        let price = candle.close;
        let trail_pct = self.params.trail_pct;
        let breakeven_trigger = self.params.breakeven_trigger_pct;
        let max_hold_secs = self.params.max_hold_secs;
        let reversal_window = self.params.reversal_window;
        let reversal_factor = self.params.reversal_factor;

        let key = Self::key(position);
        let state = self.state_for(position, candle.close_time);

        // Advance the best price and the trail behind it.
        let improved = match side {
            PositionSide::Long => price > state.best_price,
            _ => price < state.best_price,
        };
        if improved {
            state.best_price = price;
            state.trail_level = trail_from(price, side, trail_pct);
        }

        // Arm breakeven once the move is far enough in favour.
        let profit_frac = (price - state.entry_price) * side.sign() / state.entry_price;
        if !state.breakeven_armed && profit_frac >= breakeven_trigger {
            state.breakeven_armed = true;
            debug!(symbol = %position.symbol, side = %side, "breakeven floor armed");
        }

        // Check the state-dependent exits while the entry is borrowed.
        let time_hit = max_hold_secs > 0
            && candle.close_time.saturating_sub(state.opened_ms)
                >= (max_hold_secs as i64) * 1000;
        let trail_hit = match side {
            PositionSide::Long => price <= state.trail_level,
            _ => price >= state.trail_level,
        };
        let breakeven_hit =
            state.breakeven_armed && (price - state.entry_price) * side.sign() <= 0.0;

        let mut reason = if time_hit {
            Some(ExitReason::TimeLimit)
        } else if trail_hit {
            Some(ExitReason::TrailingStop)
        } else if breakeven_hit {
            Some(ExitReason::Breakeven)
        } else {
            None
        };

        // Structure reversal: a fresh displacement against the position.
        if reason.is_none() && reversal_factor > 0.0 {
            let against = match side {
                PositionSide::Long => Direction::Bearish,
                _ => Direction::Bullish,
            };
            let closed = buffers.closed(&candle.interval);
            if let Some(disp) =
                last_displacement(&closed, reversal_window, reversal_factor, against)
            {
                // Only the freshest structure counts.
                if disp.index + 1 >= closed.len() {
                    reason = Some(ExitReason::IndicatorReversal);
                }
            }
        }

        match reason {
            Some(reason) => {
                self.state.remove(&key);
                Some(Self::exit_signal(position, candle, price, reason))
            }
            None => None,
        }
    }

    fn trailing_level(&self, position: &Position) -> Option<f64> {
        self.state
            .get(&Self::key(position))
            .map(|s| s.trail_level)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn candle(close_time: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "5m".into(),
            open_time: close_time - 300_000,
            close_time,
            open: close,
            high: close + 0.1,
            low: close - 0.1,
            close,
            volume: 1.0,
            is_closed: true,
        }
    }

    fn long_position(entry: f64) -> Position {
        let mut p = Position::flat("BTCUSDT");
        p.side = PositionSide::Long;
        p.quantity = 1.0;
        p.entry_price = entry;
        p
    }

    fn buffers() -> StrategyBuffers {
        let tags: BTreeSet<String> = ["5m".to_string()].into_iter().collect();
        StrategyBuffers::new(&tags, 100, 1)
    }

    fn exit_with(params: TrailingExitParams) -> TrailingExit {
        TrailingExit::new(params)
    }

    fn no_reversal_params() -> TrailingExitParams {
        TrailingExitParams {
            reversal_factor: 0.0,
            max_hold_secs: 0,
            ..Default::default()
        }
    }

    #[test]
    fn trailing_stop_fires_after_retreat() {
        let mut exit = exit_with(no_reversal_params());
        let pos = long_position(100.0);
        let bufs = buffers();

        // Price runs up to 103, trail follows at 0.5%.
        assert!(exit.evaluate(&pos, &candle(1_000, 101.0), &bufs).is_none());
        assert!(exit.evaluate(&pos, &candle(2_000, 103.0), &bufs).is_none());
        let level = exit.trailing_level(&pos).unwrap();
        assert!((level - 103.0 * 0.995).abs() < 1e-9);

        // Retreat through the trail.
        let sig = exit
            .evaluate(&pos, &candle(3_000, 102.0), &bufs)
            .expect("trail hit");
        assert_eq!(sig.exit_reason, Some(ExitReason::TrailingStop));
        assert_eq!(sig.kind, SignalKind::ExitLong);
        // State dropped once the exit fired.
        assert!(exit.trailing_level(&pos).is_none());
    }

    #[test]
    fn breakeven_fires_after_armed_retreat() {
        let mut exit = exit_with(TrailingExitParams {
            trail_pct: 0.05, // keep the trail far away
            breakeven_trigger_pct: 0.01,
            max_hold_secs: 0,
            reversal_factor: 0.0,
            ..Default::default()
        });
        let pos = long_position(100.0);
        let bufs = buffers();

        // +1.5% arms breakeven.
        assert!(exit.evaluate(&pos, &candle(1_000, 101.5), &bufs).is_none());
        // Fall back to entry.
        let sig = exit
            .evaluate(&pos, &candle(2_000, 100.0), &bufs)
            .expect("breakeven hit");
        assert_eq!(sig.exit_reason, Some(ExitReason::Breakeven));
    }

    #[test]
    fn time_limit_fires() {
        let mut exit = exit_with(TrailingExitParams {
            trail_pct: 0.5,
            breakeven_trigger_pct: 10.0,
            max_hold_secs: 60,
            reversal_factor: 0.0,
            ..Default::default()
        });
        let pos = long_position(100.0);
        let bufs = buffers();

        assert!(exit.evaluate(&pos, &candle(1_000, 100.1), &bufs).is_none());
        let sig = exit
            .evaluate(&pos, &candle(1_000 + 60_000, 100.2), &bufs)
            .expect("time limit");
        assert_eq!(sig.exit_reason, Some(ExitReason::TimeLimit));
    }

    #[test]
    fn short_side_trails_downward() {
        let mut exit = exit_with(no_reversal_params());
        let mut pos = long_position(100.0);
        pos.side = PositionSide::Short;
        let bufs = buffers();

        assert!(exit.evaluate(&pos, &candle(1_000, 98.0), &bufs).is_none());
        let level = exit.trailing_level(&pos).unwrap();
        assert!((level - 98.0 * 1.005).abs() < 1e-9);

        let sig = exit
            .evaluate(&pos, &candle(2_000, 99.0), &bufs)
            .expect("short trail hit");
        assert_eq!(sig.kind, SignalKind::ExitShort);
    }

    #[test]
    fn new_entry_price_reinitialises_state() {
        let mut exit = exit_with(no_reversal_params());
        let bufs = buffers();

        let first = long_position(100.0);
        exit.evaluate(&first, &candle(1_000, 105.0), &bufs); // best = 105

        // A new trade at a different entry under the same key must not
        // inherit the old best price.
        let second = long_position(110.0);
        assert!(exit.evaluate(&second, &candle(2_000, 110.5), &bufs).is_none());
        let level = exit.trailing_level(&second).unwrap();
        assert!((level - 110.5 * 0.995).abs() < 1e-9);
    }

    #[test]
    fn flat_position_is_ignored() {
        let mut exit = exit_with(no_reversal_params());
        let pos = Position::flat("BTCUSDT");
        assert!(exit.evaluate(&pos, &candle(1_000, 100.0), &buffers()).is_none());
    }
}
