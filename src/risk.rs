// =============================================================================
// Risk Guard — pre-trade validation rules and position sizing
// =============================================================================
//
// Validation rules (first failure names the rule in the audit trail):
//   max_positions    — concurrent open positions below the cap
//   whitelist        — symbol inside the configured universe
//   tp_sl_geometry   — SL/TP on the correct side of entry for the direction
//   daily_drawdown   — realized PnL today above the daily-loss halt line
//   price_deviation  — entry within tolerance of the last mark price
//
// Exit signals only pass the whitelist rule: a drawdown halt or position cap
// must never prevent closing existing exposure.
//
// Sizing: risk a fixed fraction of equity over the stop distance, scale by
// leverage, cap notional by a fraction of the balance, and round down to the
// venue step.  Daily counters reset when the UTC date rolls (the reset is
// double-checked under the write lock).
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::config::BotConfig;
use crate::exchange::SymbolFilters;
use crate::types::Signal;

// ---------------------------------------------------------------------------
// Rejection type
// ---------------------------------------------------------------------------

/// A failed risk rule. `rule` is the stable machine-readable name recorded
/// in the audit trail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("risk rule '{rule}' failed: {detail}")]
pub struct RiskRejection {
    pub rule: &'static str,
    pub detail: String,
}

impl RiskRejection {
    fn new(rule: &'static str, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Daily state
// ---------------------------------------------------------------------------

struct DailyState {
    date: String,
    starting_equity: f64,
    realized_pnl: f64,
}

// ---------------------------------------------------------------------------
// RiskGuard
// ---------------------------------------------------------------------------

/// Stateless-ish validator plus sizer. The only mutable state is the daily
/// PnL ledger.
pub struct RiskGuard {
    max_positions: u32,
    whitelist: HashSet<String>,
    max_daily_loss_pct: f64,
    max_risk_per_trade: f64,
    max_position_size_pct: f64,
    price_deviation_pct: f64,
    daily: RwLock<DailyState>,
    audit: Arc<AuditLogger>,
}

impl RiskGuard {
    pub fn new(config: &BotConfig, starting_equity: f64, audit: Arc<AuditLogger>) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            max_positions = config.max_positions,
            max_daily_loss_pct = config.max_daily_loss_pct,
            max_risk_per_trade = config.max_risk_per_trade,
            starting_equity,
            "RiskGuard initialised"
        );

        Self {
            max_positions: config.max_positions,
            whitelist: config.symbols.iter().cloned().collect(),
            max_daily_loss_pct: config.max_daily_loss_pct,
            max_risk_per_trade: config.max_risk_per_trade,
            max_position_size_pct: config.max_position_size_pct,
            price_deviation_pct: config.price_deviation_pct,
            daily: RwLock::new(DailyState {
                date: today,
                starting_equity,
                realized_pnl: 0.0,
            }),
            audit,
        }
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Run every applicable rule against `signal`. Both outcomes are audited
    /// with the full signal snapshot; a rejection names the failing rule.
    pub fn validate(
        &self,
        signal: &Signal,
        open_position_count: usize,
        last_mark: Option<f64>,
    ) -> Result<(), RiskRejection> {
        self.maybe_reset_daily();

        let result = self.run_rules(signal, open_position_count, last_mark);

        match &result {
            Ok(()) => {
                self.audit.log(
                    AuditKind::RiskValidation,
                    Some(&signal.symbol),
                    json!({ "signal": signal, "open_positions": open_position_count }),
                );
            }
            Err(rejection) => {
                warn!(
                    symbol = %signal.symbol,
                    kind = %signal.kind,
                    rule = rejection.rule,
                    detail = %rejection.detail,
                    "signal rejected by risk guard"
                );
                self.audit.log(
                    AuditKind::RiskRejection,
                    Some(&signal.symbol),
                    json!({
                        "rule": rejection.rule,
                        "detail": rejection.detail,
                        "signal": signal,
                    }),
                );
            }
        }
        result
    }

    fn run_rules(
        &self,
        signal: &Signal,
        open_position_count: usize,
        last_mark: Option<f64>,
    ) -> Result<(), RiskRejection> {
        // Exits only need to target a known symbol; everything else must
        // never block closing exposure.
        if !self.whitelist.contains(&signal.symbol) {
            return Err(RiskRejection::new(
                "whitelist",
                format!("{} not in configured universe", signal.symbol),
            ));
        }
        if signal.kind.is_exit() {
            return Ok(());
        }

        if open_position_count >= self.max_positions as usize {
            return Err(RiskRejection::new(
                "max_positions",
                format!("{open_position_count} open >= cap {}", self.max_positions),
            ));
        }

        let (sl, tp) = match (signal.stop_loss, signal.take_profit) {
            (Some(sl), Some(tp)) => (sl, tp),
            _ => {
                return Err(RiskRejection::new(
                    "tp_sl_geometry",
                    "entry signal missing stop-loss or take-profit",
                ))
            }
        };

        let sign = signal.kind.side_sign();
        let sl_ok = (signal.entry_price - sl) * sign > 0.0;
        let tp_ok = (tp - signal.entry_price) * sign > 0.0;
        if !sl_ok || !tp_ok {
            return Err(RiskRejection::new(
                "tp_sl_geometry",
                format!(
                    "{}: entry={} sl={} tp={}",
                    signal.kind, signal.entry_price, sl, tp
                ),
            ));
        }

        {
            let daily = self.daily.read();
            let halt_line = -self.max_daily_loss_pct * daily.starting_equity;
            if daily.realized_pnl <= halt_line {
                return Err(RiskRejection::new(
                    "daily_drawdown",
                    format!(
                        "realized pnl {:.2} breached halt line {:.2}",
                        daily.realized_pnl, halt_line
                    ),
                ));
            }
        }

        if let Some(mark) = last_mark {
            if mark > 0.0 {
                let deviation = (signal.entry_price - mark).abs() / mark;
                if deviation >= self.price_deviation_pct {
                    return Err(RiskRejection::new(
                        "price_deviation",
                        format!(
                            "entry {} deviates {:.4} from mark {} (max {:.4})",
                            signal.entry_price, deviation, mark, self.price_deviation_pct
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// Size an entry: risk a fixed equity fraction over the stop distance,
    /// scale by leverage, cap the notional, round down to the venue step.
    pub fn size_position(
        &self,
        signal: &Signal,
        account_balance: f64,
        leverage: u32,
        filters: &SymbolFilters,
    ) -> Result<Decimal, RiskRejection> {
        let sl = signal.stop_loss.ok_or_else(|| {
            RiskRejection::new("tp_sl_geometry", "cannot size entry without stop-loss")
        })?;

        let entry = signal.entry_price;
        let sl_distance = (entry - sl).abs();
        let sl_distance_pct = sl_distance / entry;
        if sl_distance <= 0.0 || !sl_distance.is_finite() {
            return Err(RiskRejection::new(
                "quantity_zero",
                "stop distance is zero — refusing unbounded size",
            ));
        }

        // risk_amount / (entry * sl_distance_pct) reduces to
        // risk_amount / |entry - SL|.
        let risk_amount = account_balance * self.max_risk_per_trade;
        let qty_raw = risk_amount / sl_distance * leverage as f64;

        // Notional cap as a fraction of balance.
        let cap_notional = self.max_position_size_pct * account_balance;
        let qty_cap = cap_notional / entry;
        let capped = qty_raw > qty_cap;
        let quantity = if capped { qty_cap } else { qty_raw };

        if capped {
            info!(
                symbol = %signal.symbol,
                qty_raw,
                qty_cap,
                "position size capped by notional limit"
            );
            self.audit.log(
                AuditKind::PositionSizeCapped,
                Some(&signal.symbol),
                json!({ "raw": qty_raw, "capped": qty_cap, "cap_notional": cap_notional }),
            );
        }

        let qty = filters
            .quantize_qty(quantity)
            .map_err(|e| RiskRejection::new("quantity_zero", e.to_string()))?;
        if !filters.meets_min_qty(qty) {
            return Err(RiskRejection::new(
                "quantity_zero",
                format!("quantized quantity {qty} below venue minimum"),
            ));
        }

        self.audit.log(
            AuditKind::PositionSizeCalculated,
            Some(&signal.symbol),
            json!({
                "quantity": qty.to_string(),
                "risk_amount": risk_amount,
                "sl_distance_pct": sl_distance_pct,
                "leverage": leverage,
                "capped": capped,
            }),
        );
        debug!(symbol = %signal.symbol, quantity = %qty, capped, "position sized");
        Ok(qty)
    }

    // -------------------------------------------------------------------------
    // Daily ledger
    // -------------------------------------------------------------------------

    /// Record the realized PnL of a closed trade.
    pub fn record_realized_pnl(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut daily = self.daily.write();
        daily.realized_pnl += pnl;
        debug!(pnl, realized_today = daily.realized_pnl, "realized pnl recorded");
    }

    /// Today's realized PnL.
    pub fn realized_pnl_today(&self) -> f64 {
        self.maybe_reset_daily();
        self.daily.read().realized_pnl
    }

    /// If the calendar date has changed since the last check, reset the daily
    /// ledger. Equity re-bases to starting equity plus yesterday's result.
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let daily = self.daily.read();
            if daily.date == today {
                return;
            }
        }
        let mut daily = self.daily.write();
        // Double-check after acquiring the write lock.
        if daily.date != today {
            info!(
                old_date = %daily.date,
                new_date = %today,
                "date rolled — resetting daily risk counters"
            );
            daily.starting_equity += daily.realized_pnl;
            daily.realized_pnl = 0.0;
            daily.date = today;
        }
    }
}

impl std::fmt::Debug for RiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGuard")
            .field("max_positions", &self.max_positions)
            .field("whitelist", &self.whitelist.len())
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .finish()
    }
}
