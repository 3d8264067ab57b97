// =============================================================================
// Trade Coordinator — signal -> risk -> order pipeline with fill tracking
// =============================================================================
//
// Single subscriber of the signal queue.  For each signal:
//
//   1. Take the symbol's critical-section lock: entry placement and its two
//      protective orders are one atomic unit; no other signal for the same
//      symbol is processed until the section completes.
//   2. Enforce at-most-one open trade per symbol (entries need a flat
//      symbol; exits must match the open side).
//   3. RiskGuard validation, then sizing for entries.
//   4. MARKET entry, then STOP_MARKET + TAKE_PROFIT_MARKET immediately
//      after.  A failed protective placement triggers a best-effort market
//      close of the just-opened position and a critical audit event.
//
// The coordinator also consumes the order queue: fills update the in-memory
// trade record, invalidate the position cache, and emit trade_executed /
// position_closed audit events.  A protective fill books realized PnL into
// the risk guard's daily ledger.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::bus::{Event, EventHandler, EventPayload};
use crate::config::BotConfig;
use crate::exchange::ExchangeClient;
use crate::gateway::OrderGateway;
use crate::position::{Position, PositionCache};
use crate::risk::RiskGuard;
use crate::types::{now_ms, OrderStatus, OrderUpdate, Signal};

// ---------------------------------------------------------------------------
// Trade record
// ---------------------------------------------------------------------------

/// In-memory record of one active trade, keyed by symbol, reconciled against
/// fills from the user stream.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub signal: Signal,
    pub entry_order_id: u64,
    pub quantity: f64,
    /// Average entry fill price; zero until the first fill arrives.
    pub entry_fill_price: f64,
    pub filled_quantity: f64,
    pub opened_ms: i64,
}

// ---------------------------------------------------------------------------
// TradeCoordinator
// ---------------------------------------------------------------------------

pub struct TradeCoordinator {
    gateway: Arc<OrderGateway>,
    risk: Arc<RiskGuard>,
    positions: Arc<PositionCache>,
    client: Arc<ExchangeClient>,
    config: Arc<BotConfig>,
    audit: Arc<AuditLogger>,
    symbol_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    trades: Mutex<HashMap<String, TradeRecord>>,
}

impl TradeCoordinator {
    pub fn new(
        gateway: Arc<OrderGateway>,
        risk: Arc<RiskGuard>,
        positions: Arc<PositionCache>,
        client: Arc<ExchangeClient>,
        config: Arc<BotConfig>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            gateway,
            risk,
            positions,
            client,
            config,
            audit,
            symbol_locks: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
        }
    }

    /// The active trade record for `symbol`, if any.
    pub fn trade_for(&self, symbol: &str) -> Option<TradeRecord> {
        self.trades.lock().get(symbol).cloned()
    }

    fn lock_for(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Admission (pure position-state checks)
    // -------------------------------------------------------------------------

    /// The hard correctness gate: an entry is admitted only when the symbol
    /// is flat.
    fn admit_entry(position: &Position) -> Result<(), String> {
        if position.is_flat() {
            Ok(())
        } else {
            Err(format!(
                "existing {} position of {}",
                position.side, position.quantity
            ))
        }
    }

    /// An exit is admitted only when the open side matches the signal's.
    fn admit_exit(position: &Position, signal: &Signal) -> bool {
        !position.is_flat() && position.side == signal.kind.position_side()
    }

    // -------------------------------------------------------------------------
    // Signal handling
    // -------------------------------------------------------------------------

    pub async fn handle_signal(&self, signal: Signal) -> Result<()> {
        self.audit.log(
            AuditKind::SignalProcessing,
            Some(&signal.symbol),
            json!({ "signal": signal }),
        );

        let lock = self.lock_for(&signal.symbol);
        let _guard = lock.lock().await;

        let position = match self.positions.get(&signal.symbol).await {
            Ok(position) => position,
            Err(e) => {
                warn!(
                    symbol = %signal.symbol,
                    error = %e,
                    "cannot verify position state — dropping signal"
                );
                return Ok(());
            }
        };

        if signal.kind.is_entry() {
            if let Err(detail) = Self::admit_entry(&position) {
                warn!(symbol = %signal.symbol, detail = %detail, "entry rejected — symbol not flat");
                self.audit.log(
                    AuditKind::RiskRejection,
                    Some(&signal.symbol),
                    json!({ "rule": "existing_position", "detail": detail, "signal": signal }),
                );
                return Ok(());
            }
            self.execute_entry(signal, &position).await
        } else {
            if !Self::admit_exit(&position, &signal) {
                debug!(
                    symbol = %signal.symbol,
                    kind = %signal.kind,
                    position_side = %position.side,
                    "exit signal does not match open position — dropped"
                );
                return Ok(());
            }
            self.execute_exit(signal, &position).await
        }
    }

    async fn execute_entry(&self, mut signal: Signal, position: &Position) -> Result<()> {
        let symbol = signal.symbol.clone();

        let mark = if position.mark_price > 0.0 {
            Some(position.mark_price)
        } else {
            None
        };
        if self
            .risk
            .validate(&signal, self.positions.non_flat_count(), mark)
            .is_err()
        {
            // Already audited with the failing rule; no retry.
            return Ok(());
        }

        let balance = match self.client.get_available_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "balance fetch failed — dropping entry");
                return Ok(());
            }
        };

        let filters = match self.gateway.filters_for(&symbol) {
            Some(filters) => filters,
            None => {
                warn!(symbol = %symbol, "no precision filters loaded — dropping entry");
                return Ok(());
            }
        };

        let leverage = self.config.leverage_for(&symbol);
        let quantity = match self.risk.size_position(&signal, balance, leverage, &filters) {
            Ok(quantity) => quantity,
            Err(_) => return Ok(()), // audited by the sizer
        };
        signal.quantity = quantity.to_f64();

        let side = signal.kind.order_side();
        let entry_order = match self
            .gateway
            .place_entry(&symbol, side, quantity.to_f64().unwrap_or(0.0))
            .await
        {
            Ok(order) => order,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "entry order failed");
                self.audit.log(
                    AuditKind::TradeExecutionFailed,
                    Some(&symbol),
                    json!({ "stage": "entry", "error": e.to_string(), "signal": signal }),
                );
                return Ok(());
            }
        };

        // Protective orders are attached within the same critical section:
        // no code path leaves the position without both TP and SL, except
        // while actively recovering below.
        let sl = signal.stop_loss.expect("validated entry has stop-loss");
        let tp = signal.take_profit.expect("validated entry has take-profit");

        if let Err(e) = self
            .gateway
            .place_protective_pair(&symbol, side, sl, tp)
            .await
        {
            error!(
                symbol = %symbol,
                error = %e,
                "protective placement failed — closing naked position"
            );
            self.audit.log(
                AuditKind::TradeExecutionFailed,
                Some(&symbol),
                json!({
                    "stage": "protective",
                    "error": e.to_string(),
                    "entry_order_id": entry_order.order_id,
                    "recovery": "market_close",
                }),
            );
            let close = self
                .gateway
                .close_position_market(
                    &symbol,
                    signal.kind.position_side(),
                    quantity.to_f64().unwrap_or(0.0),
                )
                .await;
            if let Err(close_err) = close {
                error!(
                    symbol = %symbol,
                    error = %close_err,
                    "RECOVERY FAILED — position may be unprotected on the venue"
                );
            }
            self.positions.invalidate(&symbol);
            return Ok(());
        }

        self.trades.lock().insert(
            symbol.clone(),
            TradeRecord {
                quantity: quantity.to_f64().unwrap_or(0.0),
                signal: signal.clone(),
                entry_order_id: entry_order.order_id,
                entry_fill_price: 0.0,
                filled_quantity: 0.0,
                opened_ms: now_ms(),
            },
        );
        self.positions.invalidate(&symbol);

        info!(
            symbol = %symbol,
            kind = %signal.kind,
            quantity = %quantity,
            entry_order_id = entry_order.order_id,
            "entry executed with protective pair attached"
        );
        Ok(())
    }

    async fn execute_exit(&self, signal: Signal, position: &Position) -> Result<()> {
        let symbol = signal.symbol.clone();

        if self
            .risk
            .validate(&signal, self.positions.non_flat_count(), None)
            .is_err()
        {
            return Ok(());
        }

        // Drop the protective pair first so the close cannot race a stop
        // trigger into overshooting flat.
        if let Err(e) = self.gateway.cancel_all(&symbol).await {
            warn!(symbol = %symbol, error = %e, "cancel-all before exit failed — continuing");
        }

        match self
            .gateway
            .close_position_market(&symbol, position.side, position.quantity)
            .await
        {
            Ok(order) => {
                info!(
                    symbol = %symbol,
                    reason = ?signal.exit_reason,
                    order_id = order.order_id,
                    "exit close order placed"
                );
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "exit close order failed");
                self.audit.log(
                    AuditKind::TradeExecutionFailed,
                    Some(&symbol),
                    json!({ "stage": "exit", "error": e.to_string(), "signal": signal }),
                );
            }
        }
        self.positions.invalidate(&symbol);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fill handling
    // -------------------------------------------------------------------------

    pub async fn handle_order_update(&self, update: OrderUpdate) -> Result<()> {
        let symbol = update.symbol.clone();
        self.positions.invalidate(&symbol);

        match update.status {
            OrderStatus::PartiallyFilled => {
                let mut trades = self.trades.lock();
                if let Some(record) = trades.get_mut(&symbol) {
                    if record.entry_order_id == update.order_id {
                        record.filled_quantity = update.filled_quantity;
                        record.entry_fill_price = update.average_price;
                        debug!(
                            symbol = %symbol,
                            filled = update.filled_quantity,
                            "entry partially filled"
                        );
                    }
                }
            }
            OrderStatus::Filled => {
                let entry_fill = {
                    let mut trades = self.trades.lock();
                    match trades.get_mut(&symbol) {
                        Some(record) if record.entry_order_id == update.order_id => {
                            record.filled_quantity = update.filled_quantity;
                            record.entry_fill_price = update.average_price;
                            Some(record.clone())
                        }
                        _ => None,
                    }
                };

                if let Some(record) = entry_fill {
                    self.audit.log(
                        AuditKind::TradeExecuted,
                        Some(&symbol),
                        json!({
                            "order_id": update.order_id,
                            "price": update.average_price,
                            "quantity": update.filled_quantity,
                            "strategy": record.signal.strategy,
                        }),
                    );
                    info!(
                        symbol = %symbol,
                        price = update.average_price,
                        quantity = update.filled_quantity,
                        "entry fill confirmed"
                    );
                } else if self.gateway.is_protective_order(&symbol, update.order_id) {
                    self.settle_protective_fill(&symbol, &update).await;
                } else {
                    debug!(
                        symbol = %symbol,
                        order_id = update.order_id,
                        "fill for untracked order"
                    );
                }
            }
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => {
                let mut trades = self.trades.lock();
                if let Some(record) = trades.get(&symbol) {
                    if record.entry_order_id == update.order_id {
                        warn!(
                            symbol = %symbol,
                            order_id = update.order_id,
                            status = %update.status,
                            "entry order terminated without fill — dropping trade record"
                        );
                        trades.remove(&symbol);
                    }
                }
            }
            OrderStatus::New => {}
        }
        Ok(())
    }

    /// A protective order filled: the venue flattened the position. Book the
    /// realized PnL, clean up the sibling order, audit `position_closed`.
    async fn settle_protective_fill(&self, symbol: &str, update: &OrderUpdate) {
        let record = self.trades.lock().remove(symbol);

        let realized = record.as_ref().map(|record| {
            let entry = if record.entry_fill_price > 0.0 {
                record.entry_fill_price
            } else {
                record.signal.entry_price
            };
            let sign = record.signal.kind.position_side().sign();
            (update.average_price - entry) * sign * update.filled_quantity
        });

        if let Some(pnl) = realized {
            self.risk.record_realized_pnl(pnl);
        }

        self.audit.log(
            AuditKind::PositionClosed,
            Some(symbol),
            json!({
                "order_id": update.order_id,
                "price": update.average_price,
                "quantity": update.filled_quantity,
                "realized_pnl": realized,
            }),
        );
        info!(
            symbol,
            price = update.average_price,
            realized_pnl = ?realized,
            "position closed by protective order"
        );

        self.gateway.clear_protective(symbol);
        // The sibling protective order is now pointless; sweep it.
        if let Err(e) = self.gateway.cancel_all(symbol).await {
            warn!(symbol, error = %e, "failed to sweep sibling protective order");
        }
    }
}

impl std::fmt::Debug for TradeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeCoordinator")
            .field("active_trades", &self.trades.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Bus integration
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl EventHandler for TradeCoordinator {
    fn name(&self) -> &str {
        "trade_coordinator"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        match event.payload {
            EventPayload::Signal(signal) => self.handle_signal(signal).await,
            EventPayload::Order(update) => self.handle_order_update(update).await,
            EventPayload::Position(update) => {
                self.positions.apply_user_stream(&update);
                Ok(())
            }
            EventPayload::Candle(_) => Ok(()),
        }
    }
}
