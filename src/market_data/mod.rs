// =============================================================================
// Market Data Module
// =============================================================================
//
// Candle model and kline parsing, the per-symbol market WebSocket, and the
// user-data stream (listen key lifecycle, order/position updates).

pub mod candle;
pub mod stream;
pub mod user_stream;

// Re-export the core types for convenient access
// (e.g. `use crate::market_data::Candle`).
pub use candle::{parse_kline_message, Candle, CandleKey};
