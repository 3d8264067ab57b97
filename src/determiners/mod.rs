// =============================================================================
// Determiners Module
// =============================================================================
//
// Pluggable strategy building blocks.  Each submodule hosts one determiner
// kind; the ICT-flavoured set (fair value gaps, order blocks, displacement,
// kill zones) is the reference implementation, with percentage / RR-multiple
// pricing fallbacks that keep every pairing workable.

pub mod entry;
pub mod exit;
pub mod stop_loss;
pub mod take_profit;

pub use entry::IctEntry;
pub use exit::TrailingExit;
pub use stop_loss::{PercentStop, ZoneStop};
pub use take_profit::{DisplacementTarget, RrTarget};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Parse a determiner's free-form params block. `null` (absent in config)
/// yields the parameter struct's defaults.
pub(crate) fn parse_params<T>(params: &serde_json::Value, name: &str) -> Result<T>
where
    T: Default + DeserializeOwned,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone())
        .with_context(|| format!("invalid params for determiner '{name}'"))
}
