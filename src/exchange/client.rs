// =============================================================================
// Exchange REST Client — HMAC-SHA256 signed futures API access
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and the venue.
//
// Error and retry policy (typed via [`VenueError`]):
//   Transport   — retried up to 3 times, exponential backoff 0.5 s -> 4 s cap
//   RateLimited — sleeps the server-advertised wait; does NOT consume a retry
//   Rejected    — business rejection; surfaced immediately, never retried
//   Parse       — malformed venue response; surfaced immediately
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::filters::SymbolFilters;
use crate::exchange::rate_limit::{RateLimiter, DEFAULT_WEIGHT_LIMIT};
use crate::market_data::candle::parse_string_f64;
use crate::market_data::Candle;
use crate::position::{Position, PositionSource};
use crate::types::{now_ms, MarginType, Order, OrderStatus, OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport retries after the initial attempt.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(4);

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Typed venue-boundary error; the retry policy branches on the variant.
#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited — retry after {wait:?}")]
    RateLimited { wait: Duration },

    #[error("venue rejection {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error("unexpected venue response: {0}")]
    Parse(String),
}

pub type VenueResult<T> = Result<T, VenueError>;

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Order request
// ---------------------------------------------------------------------------

/// Parameters for one order placement. Prices and quantities are already
/// quantized to the symbol's tick/step by the caller.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Required for MARKET orders; omitted when `close_position` is set.
    pub quantity: Option<Decimal>,
    /// Trigger price for STOP_MARKET / TAKE_PROFIT_MARKET.
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// A plain market order.
    pub fn market(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity: Some(quantity),
            stop_price: None,
            reduce_only: false,
            close_position: false,
            client_order_id: None,
        }
    }

    /// A reduce-only market order that flattens exposure.
    pub fn market_close(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            reduce_only: true,
            ..Self::market(symbol, side, quantity)
        }
    }

    /// A protective stop-style order (`close_position` makes the venue
    /// flatten the symbol on trigger).
    pub fn protective(
        symbol: impl Into<String>,
        side: Side,
        order_type: OrderType,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type,
            quantity: None,
            stop_price: Some(stop_price),
            reduce_only: true,
            close_position: true,
            client_order_id: None,
        }
    }

    fn to_query(&self) -> String {
        let mut params = format!(
            "symbol={}&side={}&type={}",
            self.symbol,
            self.side.as_str(),
            self.order_type.as_str()
        );
        if let Some(qty) = &self.quantity {
            params.push_str(&format!("&quantity={qty}"));
        }
        if let Some(stop) = &self.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }
        if self.close_position {
            params.push_str("&closePosition=true");
        } else if self.reduce_only {
            // The venue rejects reduceOnly combined with closePosition.
            params.push_str("&reduceOnly=true");
        }
        if let Some(id) = &self.client_order_id {
            params.push_str(&format!("&newClientOrderId={id}"));
        }
        params
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct ExchangeClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
}

impl ExchangeClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — venue API key (sent as a header, never in query params).
    /// * `secret`  — venue secret key used exclusively for HMAC signing.
    /// * `testnet` — route to the venue testnet endpoints.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL }.to_string();
        debug!(base_url = %base_url, "ExchangeClient initialised");

        Self {
            secret,
            base_url,
            client,
            rate_limiter: Arc::new(RateLimiter::new(DEFAULT_WEIGHT_LIMIT)),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Core request machinery
    // -------------------------------------------------------------------------

    /// Send one request with weight accounting, retry/backoff and typed
    /// error mapping. The signed query is rebuilt on every attempt so the
    /// timestamp stays within the recv-window.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> VenueResult<serde_json::Value> {
        let mut attempt: u32 = 0;

        loop {
            self.rate_limiter.acquire(weight).await;

            let query = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };
            let url = if query.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query)
            };

            let outcome = self.send_once(method.clone(), &url).await;

            match outcome {
                Ok(body) => return Ok(body),
                Err(VenueError::Transport(msg)) => {
                    if attempt >= MAX_RETRIES {
                        return Err(VenueError::Transport(msg));
                    }
                    let backoff = retry_backoff(attempt);
                    warn!(
                        path,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %msg,
                        "transport error — retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(VenueError::RateLimited { wait }) => {
                    // Honoring the advertised wait does not consume a retry.
                    warn!(path, wait_ms = wait.as_millis() as u64, "venue rate limit — waiting");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, method: Method, url: &str) -> VenueResult<serde_json::Value> {
        let resp = self.client.request(method, url).send().await?;

        self.rate_limiter.update_from_headers(resp.headers());

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let wait = retry_after(resp.headers());
            return Err(VenueError::RateLimited { wait });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Parse(e.to_string()))?;

        if !status.is_success() {
            return Err(map_business_error(status, &body));
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Account setup
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "exchange::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.request(Method::POST, "/fapi/v1/leverage", &params, true, 1)
            .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    /// POST /fapi/v1/marginType (signed). Idempotent: the venue's
    /// "no need to change" rejection counts as success.
    #[instrument(skip(self), name = "exchange::set_margin_type")]
    pub async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> VenueResult<()> {
        let params = format!("symbol={symbol}&marginType={}", margin.as_str());
        match self
            .request(Method::POST, "/fapi/v1/marginType", &params, true, 1)
            .await
        {
            Ok(_) => Ok(()),
            // -4046: No need to change margin type.
            Err(VenueError::Rejected { code: -4046, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// GET /fapi/v2/balance (signed) — available USDT balance.
    #[instrument(skip(self), name = "exchange::get_balance")]
    pub async fn get_available_balance(&self) -> VenueResult<f64> {
        let body = self
            .request(Method::GET, "/fapi/v2/balance", "", true, 5)
            .await?;
        parse_usdt_balance(&body)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/positionRisk (signed) for one symbol.
    #[instrument(skip(self), name = "exchange::get_position")]
    pub async fn get_position(&self, symbol: &str) -> VenueResult<Position> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(Method::GET, "/fapi/v2/positionRisk", &params, true, 5)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Parse("positionRisk response is not an array".into()))?;

        match entries.first() {
            Some(entry) => parse_position_entry(entry),
            None => Ok(Position::flat(symbol)),
        }
    }

    /// GET /fapi/v2/positionRisk (signed) for all symbols.
    #[instrument(skip(self), name = "exchange::get_positions")]
    pub async fn get_all_positions(&self) -> VenueResult<Vec<Position>> {
        let body = self
            .request(Method::GET, "/fapi/v2/positionRisk", "", true, 5)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Parse("positionRisk response is not an array".into()))?;

        entries.iter().map(parse_position_entry).collect()
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo filtered to one symbol's precision filters.
    #[instrument(skip(self), name = "exchange::get_symbol_filters")]
    pub async fn get_symbol_filters(&self, symbol: &str) -> VenueResult<SymbolFilters> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", &params, false, 1)
            .await?;

        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|e| e["symbol"].as_str() == Some(symbol)))
            .ok_or_else(|| {
                VenueError::Parse(format!("symbol {symbol} not found in exchangeInfo"))
            })?;

        SymbolFilters::from_exchange_info(entry).map_err(|e| VenueError::Parse(e.to_string()))
    }

    /// GET /fapi/v1/klines (public) — historical candles, oldest first.
    /// `limit` defaults to 200 when zero and is clamped to the venue max of
    /// 1000.
    #[instrument(skip(self), name = "exchange::get_historical_candles")]
    pub async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> VenueResult<Vec<Candle>> {
        let limit = if limit == 0 { 200 } else { limit.min(1000) };
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self
            .request(Method::GET, "/fapi/v1/klines", &params, false, 5)
            .await?;

        let candles = parse_klines(symbol, interval, &body)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed).
    #[instrument(skip(self, request), name = "exchange::place_order", fields(symbol = %request.symbol, side = %request.side, order_type = %request.order_type))]
    pub async fn place_order(&self, request: &OrderRequest) -> VenueResult<Order> {
        let params = request.to_query();
        let body = self
            .request(Method::POST, "/fapi/v1/order", &params, true, 1)
            .await?;
        let order = parse_order(&body)?;
        debug!(order_id = order.order_id, status = %order.status, "order placed");
        Ok(order)
    }

    /// DELETE /fapi/v1/order (signed).
    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> VenueResult<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        match self
            .request(Method::DELETE, "/fapi/v1/order", &params, true, 1)
            .await
        {
            Ok(_) => Ok(()),
            // -2011: unknown order — already gone; cancellation is idempotent.
            Err(VenueError::Rejected { code: -2011, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// DELETE /fapi/v1/allOpenOrders (signed). Idempotent by venue contract.
    #[instrument(skip(self), name = "exchange::cancel_all_open_orders")]
    pub async fn cancel_all_open_orders(&self, symbol: &str) -> VenueResult<()> {
        let params = format!("symbol={symbol}");
        self.request(Method::DELETE, "/fapi/v1/allOpenOrders", &params, true, 1)
            .await?;
        debug!(symbol, "all open orders cancelled");
        Ok(())
    }

    /// GET /fapi/v1/order (signed).
    #[instrument(skip(self), name = "exchange::query_order")]
    pub async fn query_order(&self, symbol: &str, order_id: u64) -> VenueResult<Order> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .request(Method::GET, "/fapi/v1/order", &params, true, 1)
            .await?;
        parse_order(&body)
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "exchange::get_open_orders")]
    pub async fn get_open_orders(&self, symbol: &str) -> VenueResult<Vec<Order>> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(Method::GET, "/fapi/v1/openOrders", &params, true, 3)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Parse("openOrders response is not an array".into()))?;
        entries.iter().map(parse_order).collect()
    }

    // -------------------------------------------------------------------------
    // User data stream
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/listenKey (signed via API key header only).
    #[instrument(skip(self), name = "exchange::create_listen_key")]
    pub async fn create_listen_key(&self) -> VenueResult<String> {
        let body = self
            .request(Method::POST, "/fapi/v1/listenKey", "", false, 1)
            .await?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VenueError::Parse("listenKey missing from response".into()))
    }

    /// PUT /fapi/v1/listenKey — keepalive, required at least every 30 min.
    #[instrument(skip(self), name = "exchange::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self) -> VenueResult<()> {
        self.request(Method::PUT, "/fapi/v1/listenKey", "", false, 1)
            .await?;
        Ok(())
    }

    /// The WebSocket base URL matching this client's environment.
    pub fn ws_base_url(&self) -> &'static str {
        if self.base_url == TESTNET_URL {
            "wss://stream.binancefuture.com"
        } else {
            "wss://fstream.binance.com"
        }
    }
}

#[async_trait::async_trait]
impl PositionSource for ExchangeClient {
    async fn fetch_position(&self, symbol: &str) -> anyhow::Result<Position> {
        Ok(self.get_position(symbol).await?)
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Free parsing helpers (unit-testable without a network)
// ---------------------------------------------------------------------------

fn retry_backoff(attempt: u32) -> Duration {
    RETRY_CAP.min(RETRY_BASE * 2u32.saturating_pow(attempt))
}

fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(1))
}

fn map_business_error(status: StatusCode, body: &serde_json::Value) -> VenueError {
    match (body["code"].as_i64(), body["msg"].as_str()) {
        (Some(code), Some(msg)) => VenueError::Rejected {
            code,
            message: msg.to_string(),
        },
        _ => VenueError::Parse(format!("HTTP {status} with unrecognised body: {body}")),
    }
}

fn parse_usdt_balance(body: &serde_json::Value) -> VenueResult<f64> {
    let entries = body
        .as_array()
        .ok_or_else(|| VenueError::Parse("balance response is not an array".into()))?;

    for entry in entries {
        if entry["asset"].as_str() == Some("USDT") {
            return parse_string_f64(&entry["availableBalance"], "availableBalance")
                .map_err(|e| VenueError::Parse(e.to_string()));
        }
    }
    warn!("USDT not present in balance response — treating as zero");
    Ok(0.0)
}

fn parse_position_entry(entry: &serde_json::Value) -> VenueResult<Position> {
    let symbol = entry["symbol"]
        .as_str()
        .ok_or_else(|| VenueError::Parse("position entry missing symbol".into()))?;

    let parse = |field: &str| -> VenueResult<f64> {
        parse_string_f64(&entry[field], field).map_err(|e| VenueError::Parse(e.to_string()))
    };

    let amount = parse("positionAmt")?;
    let entry_price = parse("entryPrice")?;
    let mark_price = parse("markPrice")?;
    let unrealized = parse("unRealizedProfit")?;
    let leverage = parse("leverage")? as u32;

    let margin_type = match entry["marginType"].as_str() {
        Some("cross") | Some("CROSSED") => MarginType::Cross,
        _ => MarginType::Isolated,
    };

    Ok(Position::from_signed(
        symbol,
        amount,
        entry_price,
        mark_price,
        unrealized,
        leverage.max(1),
        margin_type,
    ))
}

fn parse_order(body: &serde_json::Value) -> VenueResult<Order> {
    let order_id = body["orderId"]
        .as_u64()
        .ok_or_else(|| VenueError::Parse("order response missing orderId".into()))?;
    let symbol = body["symbol"]
        .as_str()
        .ok_or_else(|| VenueError::Parse("order response missing symbol".into()))?
        .to_string();

    let side = match body["side"].as_str() {
        Some("BUY") => Side::Buy,
        Some("SELL") => Side::Sell,
        other => return Err(VenueError::Parse(format!("unknown order side: {other:?}"))),
    };

    let order_type = match body["type"].as_str() {
        Some("MARKET") => OrderType::Market,
        Some("STOP_MARKET") => OrderType::StopMarket,
        Some("TAKE_PROFIT_MARKET") => OrderType::TakeProfitMarket,
        other => return Err(VenueError::Parse(format!("unknown order type: {other:?}"))),
    };

    let status = body["status"]
        .as_str()
        .and_then(OrderStatus::parse)
        .ok_or_else(|| VenueError::Parse(format!("unknown order status: {}", body["status"])))?;

    let num = |field: &str| parse_string_f64(&body[field], field).unwrap_or(0.0);

    let stop_price = match num("stopPrice") {
        p if p > 0.0 => Some(p),
        _ => None,
    };
    let price = match num("price") {
        p if p > 0.0 => Some(p),
        _ => None,
    };

    Ok(Order {
        order_id,
        symbol,
        side,
        order_type,
        price,
        stop_price,
        quantity: num("origQty"),
        filled_quantity: num("executedQty"),
        status,
        reduce_only: body["reduceOnly"].as_bool().unwrap_or(false),
        close_position: body["closePosition"].as_bool().unwrap_or(false),
        created_ms: body["updateTime"].as_i64().unwrap_or_else(now_ms),
        updated_ms: body["updateTime"].as_i64().unwrap_or_else(now_ms),
    })
}

fn parse_klines(
    symbol: &str,
    interval: &str,
    body: &serde_json::Value,
) -> VenueResult<Vec<Candle>> {
    let raw = body
        .as_array()
        .ok_or_else(|| VenueError::Parse("klines response is not an array".into()))?;

    let now = now_ms();
    let mut candles = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = match entry.as_array() {
            Some(arr) if arr.len() >= 7 => arr,
            _ => {
                warn!("skipping malformed kline entry");
                continue;
            }
        };

        let parse =
            |v: &serde_json::Value, name: &str| -> VenueResult<f64> {
                parse_string_f64(v, name).map_err(|e| VenueError::Parse(e.to_string()))
            };

        let open_time = arr[0].as_i64().unwrap_or(0);
        let close_time = arr[6].as_i64().unwrap_or(0);

        candles.push(Candle {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time,
            close_time,
            open: parse(&arr[1], "open")?,
            high: parse(&arr[2], "high")?,
            low: parse(&arr[3], "low")?,
            close: parse(&arr[4], "close")?,
            volume: parse(&arr[5], "volume")?,
            // The venue includes the still-forming period as the last entry.
            is_closed: close_time <= now,
        });
    }

    Ok(candles)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn signature_matches_known_vector() {
        // Public HMAC-SHA256 test vector from the venue API docs.
        let client = ExchangeClient::new(
            "key",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            false,
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_carries_timestamp_and_signature() {
        let client = ExchangeClient::new("key", "secret", false);
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn order_request_query_shapes() {
        let market = OrderRequest::market("BTCUSDT", Side::Buy, dec!(0.5));
        assert_eq!(
            market.to_query(),
            "symbol=BTCUSDT&side=BUY&type=MARKET&quantity=0.5"
        );

        let close = OrderRequest::market_close("BTCUSDT", Side::Sell, dec!(0.5));
        assert!(close.to_query().contains("&reduceOnly=true"));
        assert!(!close.to_query().contains("closePosition"));

        let stop = OrderRequest::protective(
            "BTCUSDT",
            Side::Sell,
            OrderType::StopMarket,
            dec!(36000.5),
        );
        let q = stop.to_query();
        assert!(q.contains("type=STOP_MARKET"));
        assert!(q.contains("stopPrice=36000.5"));
        assert!(q.contains("closePosition=true"));
        // closePosition implies venue-side flattening; reduceOnly must not
        // also be transmitted.
        assert!(!q.contains("reduceOnly"));
    }

    #[test]
    fn business_error_mapping() {
        let err = map_business_error(
            StatusCode::BAD_REQUEST,
            &json!({ "code": -2019, "msg": "Margin is insufficient." }),
        );
        match err {
            VenueError::Rejected { code, message } => {
                assert_eq!(code, -2019);
                assert!(message.contains("insufficient"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn retry_backoff_caps_at_four_seconds() {
        assert_eq!(retry_backoff(0), Duration::from_millis(500));
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(4));
        assert_eq!(retry_backoff(10), Duration::from_secs(4));
    }

    #[test]
    fn position_entry_parsing() {
        let entry = json!({
            "symbol": "BTCUSDT",
            "positionAmt": "-0.250",
            "entryPrice": "37000.0",
            "markPrice": "36900.00",
            "unRealizedProfit": "25.00",
            "leverage": "10",
            "marginType": "isolated"
        });
        let pos = parse_position_entry(&entry).unwrap();
        assert_eq!(pos.symbol, "BTCUSDT");
        assert_eq!(pos.side, crate::types::PositionSide::Short);
        assert!((pos.quantity - 0.25).abs() < 1e-9);
        assert_eq!(pos.leverage, 10);
        assert_eq!(pos.margin_type, MarginType::Isolated);
    }

    #[test]
    fn order_response_parsing() {
        let body = json!({
            "orderId": 283194212u64,
            "symbol": "BTCUSDT",
            "side": "SELL",
            "type": "STOP_MARKET",
            "status": "NEW",
            "stopPrice": "36000.50",
            "price": "0",
            "origQty": "0",
            "executedQty": "0",
            "reduceOnly": true,
            "closePosition": true,
            "updateTime": 1700000000000i64
        });
        let order = parse_order(&body).unwrap();
        assert_eq!(order.order_id, 283_194_212);
        assert_eq!(order.order_type, OrderType::StopMarket);
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.stop_price, Some(36000.5));
        assert!(order.close_position);
        assert_eq!(order.price, None);
    }

    #[test]
    fn kline_array_parsing_marks_live_period_open() {
        let now = now_ms();
        let body = json!([
            [now - 600_000, "100.0", "101.0", "99.0", "100.5", "12.0", now - 300_001],
            [now - 300_000, "100.5", "102.0", "100.0", "101.5", "8.0", now + 299_999]
        ]);
        let candles = parse_klines("BTCUSDT", "5m", &body).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].is_closed);
        assert!(!candles[1].is_closed);
        assert_eq!(candles[0].interval, "5m");
    }

    #[test]
    fn usdt_balance_parsing() {
        let body = json!([
            { "asset": "BTC", "availableBalance": "0.1" },
            { "asset": "USDT", "availableBalance": "2500.75" }
        ]);
        assert!((parse_usdt_balance(&body).unwrap() - 2500.75).abs() < 1e-9);

        let none = json!([{ "asset": "BTC", "availableBalance": "0.1" }]);
        assert_eq!(parse_usdt_balance(&none).unwrap(), 0.0);
    }
}
