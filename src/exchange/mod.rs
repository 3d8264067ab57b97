// =============================================================================
// Exchange Module — venue REST access, rate limiting, precision filters
// =============================================================================

pub mod client;
pub mod filters;
pub mod rate_limit;

pub use client::{ExchangeClient, OrderRequest, VenueError, VenueResult};
pub use filters::SymbolFilters;
pub use rate_limit::RateLimiter;
