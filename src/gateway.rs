// =============================================================================
// Order Gateway — venue order operations with precision and order tracking
// =============================================================================
//
// Wraps the REST client with:
//   - per-symbol tick/step quantization before anything is transmitted
//   - a per-symbol map of live protective orders (SL + TP ids) so that
//     trailing-stop replacement (cancel + re-place; the venue cannot modify
//     an order in place) never orphans an order
//   - audit events for every placement and rejection
//
// Weight accounting and retry policy live one layer down in ExchangeClient.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{error, info, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::exchange::{ExchangeClient, OrderRequest, SymbolFilters, VenueError, VenueResult};
use crate::types::{Order, OrderType, PositionSide, Side};

/// Ids of the protective pair guarding one open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectiveOrders {
    pub stop_loss_id: u64,
    pub take_profit_id: u64,
}

/// The engine's single gateway to venue order state.
pub struct OrderGateway {
    client: Arc<ExchangeClient>,
    filters: RwLock<HashMap<String, SymbolFilters>>,
    protective: Mutex<HashMap<String, ProtectiveOrders>>,
    audit: Arc<AuditLogger>,
}

impl OrderGateway {
    pub fn new(client: Arc<ExchangeClient>, audit: Arc<AuditLogger>) -> Self {
        Self {
            client,
            filters: RwLock::new(HashMap::new()),
            protective: Mutex::new(HashMap::new()),
            audit,
        }
    }

    // -------------------------------------------------------------------------
    // Filters
    // -------------------------------------------------------------------------

    /// Fetch and cache the precision filters for `symbol`. Called once per
    /// symbol during engine initialisation.
    pub async fn load_filters(&self, symbol: &str) -> VenueResult<()> {
        let filters = self.client.get_symbol_filters(symbol).await?;
        info!(
            symbol,
            tick_size = %filters.tick_size,
            step_size = %filters.step_size,
            "symbol filters loaded"
        );
        self.filters.write().insert(symbol.to_string(), filters);
        Ok(())
    }

    /// Cached filters for `symbol`, if loaded.
    pub fn filters_for(&self, symbol: &str) -> Option<SymbolFilters> {
        self.filters.read().get(symbol).cloned()
    }

    /// Inject filters directly (tests and warm-start paths).
    pub fn set_filters(&self, filters: SymbolFilters) {
        self.filters.write().insert(filters.symbol.clone(), filters);
    }

    fn require_filters(&self, symbol: &str) -> VenueResult<SymbolFilters> {
        self.filters_for(symbol).ok_or_else(|| {
            VenueError::Parse(format!("no precision filters loaded for {symbol}"))
        })
    }

    // -------------------------------------------------------------------------
    // Entry and close orders
    // -------------------------------------------------------------------------

    /// Place the entry MARKET order and wait for the REST acknowledgment.
    pub async fn place_entry(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> VenueResult<Order> {
        let filters = self.require_filters(symbol)?;
        let qty = filters
            .quantize_qty(quantity)
            .map_err(|e| VenueError::Parse(e.to_string()))?;
        if !filters.meets_min_qty(qty) {
            return Err(VenueError::Rejected {
                code: 0,
                message: format!("quantity {quantity} below venue minimum for {symbol}"),
            });
        }

        let request = OrderRequest::market(symbol, side, qty);
        match self.client.place_order(&request).await {
            Ok(order) => {
                self.audit.log(
                    AuditKind::OrderPlaced,
                    Some(symbol),
                    json!({ "order_id": order.order_id, "side": side.as_str(), "type": "MARKET", "quantity": qty.to_string() }),
                );
                Ok(order)
            }
            Err(e) => {
                self.audit.log(
                    AuditKind::OrderRejected,
                    Some(symbol),
                    json!({ "side": side.as_str(), "type": "MARKET", "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Best-effort reduce-only MARKET close of an open position.
    pub async fn close_position_market(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
    ) -> VenueResult<Order> {
        let side = position_side.closing_side().ok_or_else(|| {
            VenueError::Parse(format!("cannot close flat position for {symbol}"))
        })?;
        let filters = self.require_filters(symbol)?;
        let qty = filters
            .quantize_qty(quantity)
            .map_err(|e| VenueError::Parse(e.to_string()))?;

        let request = OrderRequest::market_close(symbol, side, qty);
        let order = self.client.place_order(&request).await?;
        info!(symbol, side = %side, quantity = %qty, "position close order placed");
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Protective orders
    // -------------------------------------------------------------------------

    /// Place the STOP_MARKET + TAKE_PROFIT_MARKET pair guarding a freshly
    /// opened position.  Both are `close_position` orders on the side that
    /// flattens the entry.  On success the pair is tracked for later
    /// replacement or cancellation.
    pub async fn place_protective_pair(
        &self,
        symbol: &str,
        entry_side: Side,
        stop_loss: f64,
        take_profit: f64,
    ) -> VenueResult<ProtectiveOrders> {
        let filters = self.require_filters(symbol)?;
        let protect_side = entry_side.opposite();

        let sl_price = filters
            .quantize_price(stop_loss)
            .map_err(|e| VenueError::Parse(e.to_string()))?;
        let tp_price = filters
            .quantize_price(take_profit)
            .map_err(|e| VenueError::Parse(e.to_string()))?;

        let sl_request =
            OrderRequest::protective(symbol, protect_side, OrderType::StopMarket, sl_price);
        let sl_order = self.placed_and_audited(symbol, &sl_request).await?;

        let tp_request = OrderRequest::protective(
            symbol,
            protect_side,
            OrderType::TakeProfitMarket,
            tp_price,
        );
        let tp_order = match self.placed_and_audited(symbol, &tp_request).await {
            Ok(order) => order,
            Err(e) => {
                // Half a protective pair is worse than none: try to cancel
                // the stop before surfacing the failure to the coordinator.
                warn!(symbol, error = %e, "take-profit placement failed — cancelling the stop");
                if let Err(cancel_err) =
                    self.client.cancel_order(symbol, sl_order.order_id).await
                {
                    error!(symbol, error = %cancel_err, "failed to cancel orphaned stop order");
                }
                return Err(e);
            }
        };

        let pair = ProtectiveOrders {
            stop_loss_id: sl_order.order_id,
            take_profit_id: tp_order.order_id,
        };
        self.protective.lock().insert(symbol.to_string(), pair);
        info!(
            symbol,
            stop_loss_id = pair.stop_loss_id,
            take_profit_id = pair.take_profit_id,
            "protective pair placed"
        );
        Ok(pair)
    }

    /// Replace the tracked protective stop with one at `new_stop` (trailing
    /// update). Cancel first, then re-place; the tracked id is updated so no
    /// order is orphaned.
    pub async fn replace_protective_stop(
        &self,
        symbol: &str,
        entry_side: Side,
        new_stop: f64,
    ) -> VenueResult<u64> {
        let filters = self.require_filters(symbol)?;
        let existing = self.protective.lock().get(symbol).copied();

        if let Some(pair) = existing {
            self.client
                .cancel_order(symbol, pair.stop_loss_id)
                .await?;
        }

        let price = filters
            .quantize_price(new_stop)
            .map_err(|e| VenueError::Parse(e.to_string()))?;
        let request = OrderRequest::protective(
            symbol,
            entry_side.opposite(),
            OrderType::StopMarket,
            price,
        );
        let order = self.placed_and_audited(symbol, &request).await?;

        let mut map = self.protective.lock();
        match map.get_mut(symbol) {
            Some(pair) => pair.stop_loss_id = order.order_id,
            None => {
                map.insert(
                    symbol.to_string(),
                    ProtectiveOrders {
                        stop_loss_id: order.order_id,
                        take_profit_id: 0,
                    },
                );
            }
        }
        info!(symbol, new_stop = %price, order_id = order.order_id, "protective stop replaced");
        Ok(order.order_id)
    }

    /// Cancel every open order for `symbol` and forget its protective pair.
    /// Idempotent.
    pub async fn cancel_all(&self, symbol: &str) -> VenueResult<()> {
        self.client.cancel_all_open_orders(symbol).await?;
        self.protective.lock().remove(symbol);
        Ok(())
    }

    /// The tracked protective pair for `symbol`, if any.
    pub fn protective_for(&self, symbol: &str) -> Option<ProtectiveOrders> {
        self.protective.lock().get(symbol).copied()
    }

    /// Forget the tracked pair (after a protective order filled and the
    /// venue auto-cancelled its sibling).
    pub fn clear_protective(&self, symbol: &str) {
        self.protective.lock().remove(symbol);
    }

    /// Whether `order_id` is one of the symbol's tracked protective orders.
    pub fn is_protective_order(&self, symbol: &str, order_id: u64) -> bool {
        self.protective
            .lock()
            .get(symbol)
            .map(|p| p.stop_loss_id == order_id || p.take_profit_id == order_id)
            .unwrap_or(false)
    }

    async fn placed_and_audited(
        &self,
        symbol: &str,
        request: &OrderRequest,
    ) -> VenueResult<Order> {
        match self.client.place_order(request).await {
            Ok(order) => {
                self.audit.log(
                    AuditKind::OrderPlaced,
                    Some(symbol),
                    json!({
                        "order_id": order.order_id,
                        "side": request.side.as_str(),
                        "type": request.order_type.as_str(),
                        "stop_price": request.stop_price.as_ref().map(|p| p.to_string()),
                    }),
                );
                Ok(order)
            }
            Err(e) => {
                self.audit.log(
                    AuditKind::OrderRejected,
                    Some(symbol),
                    json!({
                        "side": request.side.as_str(),
                        "type": request.order_type.as_str(),
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::liquidation::LiquidationVenue for OrderGateway {
    async fn cancel_all_orders(&self, symbol: &str) -> anyhow::Result<()> {
        Ok(self.cancel_all(symbol).await?)
    }

    async fn open_positions(&self) -> anyhow::Result<Vec<crate::position::Position>> {
        let positions = self.client.get_all_positions().await?;
        Ok(positions.into_iter().filter(|p| !p.is_flat()).collect())
    }

    async fn market_close(&self, position: &crate::position::Position) -> anyhow::Result<()> {
        self.close_position_market(&position.symbol, position.side, position.quantity)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for OrderGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderGateway")
            .field("filters", &self.filters.read().len())
            .field("protective", &self.protective.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn audit() -> Arc<AuditLogger> {
        let dir = std::env::temp_dir().join(format!("vela-gw-{}", uuid::Uuid::new_v4()));
        Arc::new(AuditLogger::new(dir).unwrap())
    }

    fn gateway() -> OrderGateway {
        let client = Arc::new(ExchangeClient::new("k", "s", true));
        let gw = OrderGateway::new(client, audit());
        gw.set_filters(SymbolFilters {
            symbol: "BTCUSDT".into(),
            tick_size: dec!(0.10),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
        });
        gw
    }

    #[test]
    fn filters_roundtrip() {
        let gw = gateway();
        let f = gw.filters_for("BTCUSDT").expect("filters set");
        assert_eq!(f.tick_size, dec!(0.10));
        assert!(gw.filters_for("ETHUSDT").is_none());
    }

    #[test]
    fn protective_tracking_lifecycle() {
        let gw = gateway();
        assert!(gw.protective_for("BTCUSDT").is_none());

        gw.protective.lock().insert(
            "BTCUSDT".into(),
            ProtectiveOrders {
                stop_loss_id: 11,
                take_profit_id: 22,
            },
        );

        assert!(gw.is_protective_order("BTCUSDT", 11));
        assert!(gw.is_protective_order("BTCUSDT", 22));
        assert!(!gw.is_protective_order("BTCUSDT", 33));
        assert!(!gw.is_protective_order("ETHUSDT", 11));

        gw.clear_protective("BTCUSDT");
        assert!(gw.protective_for("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn entry_below_min_qty_rejected_before_transmission() {
        let gw = gateway();
        let err = gw
            .place_entry("BTCUSDT", Side::Buy, 0.0004)
            .await
            .unwrap_err();
        match err {
            VenueError::Rejected { message, .. } => {
                assert!(message.contains("below venue minimum"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_filters_is_an_error() {
        let gw = gateway();
        let err = gw.place_entry("ETHUSDT", Side::Buy, 1.0).await.unwrap_err();
        assert!(err.to_string().contains("no precision filters"));
    }
}
