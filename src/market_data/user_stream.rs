// =============================================================================
// User Stream — listen-key lifecycle plus order and position updates
// =============================================================================
//
// The venue authorizes the user-data WebSocket with a listen key that must
// be refreshed at most every 30 minutes (we keep alive at 25).  Events:
//
//   ORDER_TRADE_UPDATE  -> OrderUpdate, published on the order queue
//                          (blocking publish — order events are never lost)
//   ACCOUNT_UPDATE      -> one PositionUpdate per changed position
//
// Disconnects reconnect with the same capped backoff as the market streams,
// recreating the listen key each time.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, EventPayload, EventTag};
use crate::exchange::ExchangeClient;
use crate::market_data::candle::parse_string_f64;
use crate::market_data::stream::next_backoff;
use crate::types::{OrderStatus, OrderType, OrderUpdate, PositionUpdate, Side};

/// Listen-key keepalive cadence (venue requires <= 30 min).
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25 * 60);

/// A decoded user-stream event.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Order(OrderUpdate),
    Positions(Vec<PositionUpdate>),
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Decode one user-stream message. Returns `None` for event types the engine
/// does not consume (margin calls, balance-only updates, acks).
pub fn parse_user_event(text: &str) -> Option<UserEvent> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;

    match root["e"].as_str()? {
        "ORDER_TRADE_UPDATE" => parse_order_trade_update(&root).map(UserEvent::Order),
        "ACCOUNT_UPDATE" => parse_account_update(&root).map(UserEvent::Positions),
        other => {
            debug!(event_type = other, "user-stream event ignored");
            None
        }
    }
}

fn parse_order_trade_update(root: &serde_json::Value) -> Option<OrderUpdate> {
    let o = &root["o"];
    let symbol = o["s"].as_str()?.to_string();
    let order_id = o["i"].as_u64()?;

    let side = match o["S"].as_str()? {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return None,
    };

    // "ot" is the original order type; "o" may be mutated by the venue on
    // trigger (STOP_MARKET executes as MARKET).
    let order_type = match o["ot"].as_str().or_else(|| o["o"].as_str())? {
        "MARKET" => OrderType::Market,
        "STOP_MARKET" => OrderType::StopMarket,
        "TAKE_PROFIT_MARKET" => OrderType::TakeProfitMarket,
        other => {
            debug!(order_type = other, "order update for unsupported type ignored");
            return None;
        }
    };

    let status = OrderStatus::parse(o["X"].as_str()?)?;

    let num = |key: &str| parse_string_f64(&o[key], key).unwrap_or(0.0);
    let stop_price = match num("sp") {
        p if p > 0.0 => Some(p),
        _ => None,
    };

    Some(OrderUpdate {
        order_id,
        symbol,
        side,
        order_type,
        status,
        last_filled_quantity: num("l"),
        filled_quantity: num("z"),
        average_price: num("ap"),
        stop_price,
        reduce_only: o["R"].as_bool().unwrap_or(false),
        timestamp_ms: root["T"].as_i64().unwrap_or(0),
    })
}

fn parse_account_update(root: &serde_json::Value) -> Option<Vec<PositionUpdate>> {
    let timestamp_ms = root["T"].as_i64().unwrap_or(0);
    let positions = root["a"]["P"].as_array()?;

    let updates: Vec<PositionUpdate> = positions
        .iter()
        .filter_map(|p| {
            Some(PositionUpdate {
                symbol: p["s"].as_str()?.to_string(),
                quantity: parse_string_f64(&p["pa"], "pa").ok()?,
                entry_price: parse_string_f64(&p["ep"], "ep").ok()?,
                unrealized_pnl: parse_string_f64(&p["up"], "up").unwrap_or(0.0),
                timestamp_ms,
            })
        })
        .collect();

    if updates.is_empty() {
        None
    } else {
        Some(updates)
    }
}

/// The event tag an order update travels under.
pub fn order_event_tag(status: OrderStatus) -> Option<EventTag> {
    match status {
        OrderStatus::Filled => Some(EventTag::OrderFilled),
        OrderStatus::PartiallyFilled => Some(EventTag::OrderPartiallyFilled),
        OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => {
            Some(EventTag::OrderCancelled)
        }
        OrderStatus::New => None,
    }
}

// ---------------------------------------------------------------------------
// Stream task
// ---------------------------------------------------------------------------

/// Run the user-data stream until the task is cancelled. Creates a fresh
/// listen key per connection and keeps it alive while connected.
pub async fn run_user_stream(client: Arc<ExchangeClient>, bus: Arc<EventBus>) -> Result<()> {
    let mut attempt: u32 = 0;

    loop {
        let listen_key = match client.create_listen_key().await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "failed to create listen key");
                let backoff = next_backoff(attempt);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let url = format!("{}/ws/{}", client.ws_base_url(), listen_key);
        info!("connecting to user-data WebSocket");

        match connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                info!("user-data WebSocket connected");
                attempt = 0;

                let (_write, mut read) = ws_stream.split();
                let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
                keepalive.tick().await; // immediate first tick is a no-op

                loop {
                    tokio::select! {
                        _ = keepalive.tick() => {
                            if let Err(e) = client.keepalive_listen_key().await {
                                warn!(error = %e, "listen-key keepalive failed — reconnecting");
                                break;
                            }
                            debug!("listen key kept alive");
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                                    dispatch_user_message(&bus, &text).await;
                                }
                                Some(Ok(_)) => {} // ping/pong/binary
                                Some(Err(e)) => {
                                    error!(error = %e, "user-data WebSocket read error");
                                    break;
                                }
                                None => {
                                    warn!("user-data WebSocket stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "user-data WebSocket connect failed");
            }
        }

        let backoff = next_backoff(attempt);
        attempt = attempt.saturating_add(1);
        warn!(backoff_secs = backoff.as_secs(), "reconnecting user-data WebSocket");
        tokio::time::sleep(backoff).await;
    }
}

async fn dispatch_user_message(bus: &EventBus, text: &str) {
    match parse_user_event(text) {
        Some(UserEvent::Order(update)) => {
            if let Some(tag) = order_event_tag(update.status) {
                debug!(
                    symbol = %update.symbol,
                    order_id = update.order_id,
                    status = %update.status,
                    "order update received"
                );
                bus.publish(Event::new(tag, EventPayload::Order(update))).await;
            }
        }
        Some(UserEvent::Positions(updates)) => {
            for update in updates {
                debug!(
                    symbol = %update.symbol,
                    quantity = update.quantity,
                    "position update received"
                );
                bus.publish(Event::new(
                    EventTag::PositionUpdate,
                    EventPayload::Position(update),
                ))
                .await;
            }
        }
        None => {}
    }
}
