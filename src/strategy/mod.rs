// =============================================================================
// Strategy Framework Module
// =============================================================================
//
// Per-symbol strategies assembled from pluggable determiners:
// - Bounded per-interval candle buffers (dedup on close_time)
// - The four-determiner contract (entry / stop-loss / take-profit / exit)
// - The composite strategy orchestrating analyze / should_exit
// - The registry mapping config names to determiner factories

pub mod buffer;
pub mod composite;
pub mod module;
pub mod registry;

pub use buffer::{SeriesBuffer, StrategyBuffers};
pub use composite::CompositeStrategy;
pub use module::{
    EntryDecision, EntryDeterminer, ExitDeterminer, ModuleConfig, PriceContext,
    StopLossDeterminer, TakeProfitDeterminer,
};
pub use registry::ModuleRegistry;
