// =============================================================================
// Shared types used across the Vela trading engine
// =============================================================================
//
// Domain vocabulary for USDT-margined perpetual futures: order sides, signal
// kinds, exit reasons, and the Signal record that travels from the strategy
// layer through risk validation into the order gateway.
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sides
// ---------------------------------------------------------------------------

/// Order side as the venue understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side (used when flattening a position).
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Venue wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of an open position. `Flat` means no exposure (quantity zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl PositionSide {
    /// +1.0 for longs, -1.0 for shorts, 0.0 when flat.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
            Self::Flat => 0.0,
        }
    }

    /// The order side that would close this position.
    pub fn closing_side(self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Sell),
            Self::Short => Some(Side::Buy),
            Self::Flat => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal kinds & exit reasons
// ---------------------------------------------------------------------------

/// What a strategy is asking the coordinator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    EntryLong,
    EntryShort,
    ExitLong,
    ExitShort,
}

impl SignalKind {
    pub fn is_entry(self) -> bool {
        matches!(self, Self::EntryLong | Self::EntryShort)
    }

    pub fn is_exit(self) -> bool {
        !self.is_entry()
    }

    /// The position side this signal refers to.
    pub fn position_side(self) -> PositionSide {
        match self {
            Self::EntryLong | Self::ExitLong => PositionSide::Long,
            Self::EntryShort | Self::ExitShort => PositionSide::Short,
        }
    }

    /// The order side that realises this signal on the venue.
    pub fn order_side(self) -> Side {
        match self {
            Self::EntryLong | Self::ExitShort => Side::Buy,
            Self::EntryShort | Self::ExitLong => Side::Sell,
        }
    }

    /// +1.0 for long-directed signals, -1.0 for short-directed.
    pub fn side_sign(self) -> f64 {
        self.position_side().sign()
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntryLong => write!(f, "entry_long"),
            Self::EntryShort => write!(f, "entry_short"),
            Self::ExitLong => write!(f, "exit_long"),
            Self::ExitShort => write!(f, "exit_short"),
        }
    }
}

/// Why an exit determiner wants a position closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TrailingStop,
    Breakeven,
    TimeLimit,
    IndicatorReversal,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrailingStop => write!(f, "trailing_stop"),
            Self::Breakeven => write!(f, "breakeven"),
            Self::TimeLimit => write!(f, "time_limit"),
            Self::IndicatorReversal => write!(f, "indicator_reversal"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// An immutable trade instruction produced by a strategy.
///
/// For entry kinds, `stop_loss` and `take_profit` must sit on the protective
/// and profit sides of `entry_price` respectively; [`Signal::entry`] enforces
/// the geometry at construction and computes `risk_reward`. `quantity` stays
/// `None` until the coordinator sizes the trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub symbol: String,
    /// Creation time, epoch milliseconds.
    pub timestamp_ms: i64,
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// Set by the coordinator after risk sizing; never by a strategy.
    #[serde(default)]
    pub quantity: Option<f64>,
    pub strategy: String,
    #[serde(default)]
    pub risk_reward: Option<f64>,
    /// Populated only for exit kinds.
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
}

/// Error raised when an entry signal's SL/TP geometry is inconsistent with
/// its direction.
#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} geometry for {symbol}: entry={entry} sl={sl} tp={tp}")]
pub struct SignalGeometryError {
    pub kind: SignalKind,
    pub symbol: String,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
}

impl Signal {
    /// Build a fully-populated entry signal, validating that SL and TP lie on
    /// the correct side of the entry price (LONG: SL < entry < TP; SHORT:
    /// TP < entry < SL).
    pub fn entry(
        kind: SignalKind,
        symbol: impl Into<String>,
        timestamp_ms: i64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        strategy: impl Into<String>,
    ) -> Result<Self, SignalGeometryError> {
        let symbol = symbol.into();
        debug_assert!(kind.is_entry());

        let sign = kind.side_sign();
        let sl_ok = (entry_price - stop_loss) * sign > 0.0;
        let tp_ok = (take_profit - entry_price) * sign > 0.0;
        if !sl_ok || !tp_ok {
            return Err(SignalGeometryError {
                kind,
                symbol,
                entry: entry_price,
                sl: stop_loss,
                tp: take_profit,
            });
        }

        let risk = (entry_price - stop_loss).abs();
        let reward = (take_profit - entry_price).abs();
        let rr = if risk > 0.0 { reward / risk } else { 0.0 };

        Ok(Self {
            kind,
            symbol,
            timestamp_ms,
            entry_price,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            quantity: None,
            strategy: strategy.into(),
            risk_reward: Some(rr),
            exit_reason: None,
        })
    }

    /// Build an exit signal for a currently open position.
    pub fn exit(
        kind: SignalKind,
        symbol: impl Into<String>,
        timestamp_ms: i64,
        price: f64,
        strategy: impl Into<String>,
        reason: ExitReason,
    ) -> Self {
        debug_assert!(kind.is_exit());
        Self {
            kind,
            symbol: symbol.into(),
            timestamp_ms,
            entry_price: price,
            stop_loss: None,
            take_profit: None,
            quantity: None,
            strategy: strategy.into(),
            risk_reward: None,
            exit_reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order types the engine places. Protective orders are always stop-style
/// market orders so fills do not depend on resting book liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Venue-observed status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse the venue's status string; unknown strings return `None` so the
    /// caller decides how to handle them.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal statuses are pruned from live tracking maps.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Mutable record of an order as observed on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    pub quantity: f64,
    #[serde(default)]
    pub filled_quantity: f64,
    pub status: OrderStatus,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    pub created_ms: i64,
    #[serde(default)]
    pub updated_ms: i64,
}

/// Order state change pushed over the user data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Quantity filled by the triggering execution.
    #[serde(default)]
    pub last_filled_quantity: f64,
    /// Cumulative filled quantity for the order.
    #[serde(default)]
    pub filled_quantity: f64,
    /// Average fill price so far (0.0 until the first fill).
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub reduce_only: bool,
    pub timestamp_ms: i64,
}

/// Position change pushed over the user data stream. `quantity` is signed:
/// positive = long, negative = short, zero = flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub timestamp_ms: i64,
}

/// Margin mode applied per symbol on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginType {
    Isolated,
    Cross,
}

impl Default for MarginType {
    fn default() -> Self {
        Self::Isolated
    }
}

impl MarginType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "ISOLATED",
            Self::Cross => "CROSSED",
        }
    }
}

impl std::fmt::Display for MarginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_kind_order_sides() {
        assert_eq!(SignalKind::EntryLong.order_side(), Side::Buy);
        assert_eq!(SignalKind::EntryShort.order_side(), Side::Sell);
        assert_eq!(SignalKind::ExitLong.order_side(), Side::Sell);
        assert_eq!(SignalKind::ExitShort.order_side(), Side::Buy);
    }

    #[test]
    fn entry_signal_geometry_long_ok() {
        let s = Signal::entry(
            SignalKind::EntryLong,
            "BTCUSDT",
            0,
            100.0,
            99.0,
            102.0,
            "test",
        )
        .expect("valid long geometry");
        assert!((s.risk_reward.unwrap() - 2.0).abs() < 1e-9);
        // Both protective distances point in the profitable direction.
        let sign = s.kind.side_sign();
        assert!((s.take_profit.unwrap() - s.entry_price) * sign > 0.0);
        assert!((s.entry_price - s.stop_loss.unwrap()) * sign > 0.0);
    }

    #[test]
    fn entry_signal_geometry_long_sl_above_entry_rejected() {
        let err = Signal::entry(
            SignalKind::EntryLong,
            "BTCUSDT",
            0,
            100.0,
            102.0,
            105.0,
            "test",
        )
        .unwrap_err();
        assert_eq!(err.kind, SignalKind::EntryLong);
    }

    #[test]
    fn entry_signal_geometry_short_ok() {
        let s = Signal::entry(
            SignalKind::EntryShort,
            "ETHUSDT",
            0,
            100.0,
            101.0,
            97.0,
            "test",
        )
        .expect("valid short geometry");
        assert!((s.risk_reward.unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn entry_signal_geometry_short_tp_above_entry_rejected() {
        assert!(Signal::entry(
            SignalKind::EntryShort,
            "ETHUSDT",
            0,
            100.0,
            101.0,
            103.0,
            "test",
        )
        .is_err());
    }

    #[test]
    fn exit_signal_carries_reason() {
        let s = Signal::exit(
            SignalKind::ExitLong,
            "BTCUSDT",
            0,
            100.0,
            "test",
            ExitReason::TrailingStop,
        );
        assert_eq!(s.exit_reason, Some(ExitReason::TrailingStop));
        assert!(s.quantity.is_none());
    }

    #[test]
    fn order_status_parse_and_terminal() {
        assert_eq!(OrderStatus::parse("FILLED"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::parse("NEW"), Some(OrderStatus::New));
        assert_eq!(OrderStatus::parse("???"), None);
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn position_side_signs() {
        assert_eq!(PositionSide::Long.sign(), 1.0);
        assert_eq!(PositionSide::Short.sign(), -1.0);
        assert_eq!(PositionSide::Flat.sign(), 0.0);
        assert_eq!(PositionSide::Long.closing_side(), Some(Side::Sell));
        assert_eq!(PositionSide::Flat.closing_side(), None);
    }
}
