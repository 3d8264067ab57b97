// =============================================================================
// Symbol Filters — exact tick/step quantization at the order boundary
// =============================================================================
//
// Indicator math runs on binary floats, but everything transmitted to the
// venue must be an exact multiple of the symbol's tick size (prices) or step
// size (quantities).  Quantization happens in `rust_decimal` so no binary
// representation error survives into the wire format.
//
// Prices round to the nearest tick; quantities round DOWN to the step so a
// sized order can never exceed the risk budget that produced it.
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-symbol precision constraints from the venue's exchange info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    /// Price must be a multiple of this.
    pub tick_size: Decimal,
    /// Quantity must be a multiple of this.
    pub step_size: Decimal,
    /// Smallest order quantity the venue accepts.
    pub min_qty: Decimal,
}

impl SymbolFilters {
    /// Parse the filters from one symbol entry of the exchange-info response.
    ///
    /// Expected shape:
    /// ```json
    /// { "symbol": "BTCUSDT", "filters": [
    ///     { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
    ///     { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001" }
    /// ] }
    /// ```
    pub fn from_exchange_info(entry: &serde_json::Value) -> Result<Self> {
        let symbol = entry["symbol"]
            .as_str()
            .context("exchange info entry missing 'symbol'")?
            .to_string();

        let filters = entry["filters"]
            .as_array()
            .context("exchange info entry missing 'filters'")?;

        let mut tick_size = None;
        let mut step_size = None;
        let mut min_qty = None;

        for filter in filters {
            match filter["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    tick_size = Some(parse_decimal(&filter["tickSize"], "tickSize")?);
                }
                Some("LOT_SIZE") => {
                    step_size = Some(parse_decimal(&filter["stepSize"], "stepSize")?);
                    min_qty = Some(parse_decimal(&filter["minQty"], "minQty")?);
                }
                _ => {}
            }
        }

        Ok(Self {
            symbol,
            tick_size: tick_size.context("PRICE_FILTER missing from exchange info")?,
            step_size: step_size.context("LOT_SIZE missing from exchange info")?,
            min_qty: min_qty.context("LOT_SIZE minQty missing from exchange info")?,
        })
    }

    /// Round a price to the nearest tick.
    pub fn quantize_price(&self, price: f64) -> Result<Decimal> {
        let d = Decimal::from_f64(price)
            .with_context(|| format!("price {price} is not representable"))?;
        if self.tick_size.is_zero() {
            anyhow::bail!("tick size is zero for {}", self.symbol);
        }
        Ok(((d / self.tick_size).round() * self.tick_size).normalize())
    }

    /// Round a quantity down to the step. Returns zero when the input is
    /// below one step; callers must check [`Self::min_qty`] before sending.
    pub fn quantize_qty(&self, qty: f64) -> Result<Decimal> {
        let d = Decimal::from_f64(qty)
            .with_context(|| format!("quantity {qty} is not representable"))?;
        if self.step_size.is_zero() {
            anyhow::bail!("step size is zero for {}", self.symbol);
        }
        Ok(((d / self.step_size).floor() * self.step_size).normalize())
    }

    /// True when a quantized quantity is large enough to transmit.
    pub fn meets_min_qty(&self, qty: Decimal) -> bool {
        qty >= self.min_qty && !qty.is_zero()
    }
}

fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal> {
    let s = val
        .as_str()
        .with_context(|| format!("filter field {name} is not a string"))?;
    s.parse::<Decimal>()
        .with_context(|| format!("failed to parse {name} '{s}' as decimal"))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            symbol: "BTCUSDT".into(),
            tick_size: dec!(0.10),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
        }
    }

    #[test]
    fn parses_exchange_info_entry() {
        let entry = json!({
            "symbol": "BTCUSDT",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000" },
                { "filterType": "MARKET_LOT_SIZE", "stepSize": "0.001" }
            ]
        });
        let f = SymbolFilters::from_exchange_info(&entry).unwrap();
        assert_eq!(f.symbol, "BTCUSDT");
        assert_eq!(f.tick_size, dec!(0.10));
        assert_eq!(f.step_size, dec!(0.001));
        assert_eq!(f.min_qty, dec!(0.001));
    }

    #[test]
    fn missing_filters_rejected() {
        let entry = json!({ "symbol": "BTCUSDT", "filters": [] });
        assert!(SymbolFilters::from_exchange_info(&entry).is_err());
    }

    #[test]
    fn price_rounds_to_nearest_tick() {
        let f = filters();
        assert_eq!(f.quantize_price(37012.26).unwrap(), dec!(37012.3));
        assert_eq!(f.quantize_price(37012.24).unwrap(), dec!(37012.2));
        // Binary-float artifacts do not leak into the result.
        assert_eq!(f.quantize_price(0.1 + 0.2).unwrap(), dec!(0.3));
    }

    #[test]
    fn quantity_rounds_down_to_step() {
        let f = filters();
        assert_eq!(f.quantize_qty(0.12399).unwrap(), dec!(0.123));
        assert_eq!(f.quantize_qty(0.0009).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn min_qty_gate() {
        let f = filters();
        assert!(f.meets_min_qty(dec!(0.001)));
        assert!(!f.meets_min_qty(dec!(0.0005)));
        assert!(!f.meets_min_qty(Decimal::ZERO));
    }
}
