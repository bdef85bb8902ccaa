//! Exchange-style symbol filters applied to simulated orders.
//!
//! All values are handled at 8 decimal digits. Rounding always goes upward,
//! first to the 8th digit and then to the filter's step or tick size, which
//! makes it idempotent.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const VALUE_SCALE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    #[serde(rename = "LOT_SIZE")]
    LotSize,
    #[serde(rename = "MARKET_LOT_SIZE")]
    MarketLotSize,
    #[serde(rename = "PRICE_FILTER")]
    Price,
    #[serde(rename = "NOTIONAL")]
    Notional,
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional,
}

impl FilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::LotSize => "LOT_SIZE",
            FilterKind::MarketLotSize => "MARKET_LOT_SIZE",
            FilterKind::Price => "PRICE_FILTER",
            FilterKind::Notional => "NOTIONAL",
            FilterKind::MinNotional => "MIN_NOTIONAL",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bound {
    Min,
    Max,
}

impl Bound {
    fn relation(&self) -> &'static str {
        match self {
            Bound::Min => "below",
            Bound::Max => "above",
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Min => f.write_str("min"),
            Bound::Max => f.write_str("max"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{filter} {bound} bound violated: {value} is {} {limit}", .bound.relation())]
pub struct FilterViolationError {
    pub filter: FilterKind,
    pub bound: Bound,
    pub value: Decimal,
    pub limit: Decimal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterConfigError {
    #[error("{filter}: max {max} must be greater than min {min}")]
    EmptyRange {
        filter: FilterKind,
        min: Decimal,
        max: Decimal,
    },
    #[error("{filter}: {field} must not be negative")]
    Negative {
        filter: FilterKind,
        field: &'static str,
    },
}

/// Rounds `value` upward to 8 decimal digits, then upward to a multiple of
/// `step`. A zero step only applies the 8-digit rounding.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    let scaled = round_scale(value);
    if step <= Decimal::ZERO {
        return scaled;
    }
    scaled
        .checked_div(step)
        .and_then(|steps| steps.ceil().checked_mul(step))
        .map(round_scale)
        .unwrap_or(scaled)
}

pub fn round_scale(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(VALUE_SCALE, RoundingStrategy::ToPositiveInfinity)
}

fn check_range(
    filter: FilterKind,
    value: Decimal,
    min: Decimal,
    max: Decimal,
) -> Result<(), FilterViolationError> {
    if value < min {
        return Err(FilterViolationError {
            filter,
            bound: Bound::Min,
            value,
            limit: min,
        });
    }
    if value > max {
        return Err(FilterViolationError {
            filter,
            bound: Bound::Max,
            value,
            limit: max,
        });
    }
    Ok(())
}

fn check_bounds_config(
    filter: FilterKind,
    min: Decimal,
    max: Decimal,
    step: Decimal,
) -> Result<(), FilterConfigError> {
    if min < Decimal::ZERO {
        return Err(FilterConfigError::Negative { filter, field: "min" });
    }
    if step < Decimal::ZERO {
        return Err(FilterConfigError::Negative {
            filter,
            field: "step",
        });
    }
    if max <= min {
        return Err(FilterConfigError::EmptyRange { filter, min, max });
    }
    Ok(())
}

/// Quantity bounds. Used for both `LOT_SIZE` and `MARKET_LOT_SIZE`.
#[derive(Debug, Clone, PartialEq)]
pub struct LotSizeFilter {
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
}

impl LotSizeFilter {
    pub fn new(min_qty: Decimal, max_qty: Decimal, step_size: Decimal) -> Result<Self, FilterConfigError> {
        check_bounds_config(FilterKind::LotSize, min_qty, max_qty, step_size)?;
        Ok(Self {
            min_qty,
            max_qty,
            step_size: round_scale(step_size),
        })
    }

    pub fn round(&self, quantity: Decimal) -> Decimal {
        round_to_step(quantity, self.step_size)
    }

    fn apply(&self, kind: FilterKind, quantity: Decimal) -> Result<Decimal, FilterViolationError> {
        let rounded = self.round(quantity);
        check_range(kind, rounded, self.min_qty, self.max_qty)?;
        Ok(rounded)
    }
}

pub type MarketLotSizeFilter = LotSizeFilter;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceFilter {
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub tick_size: Decimal,
}

impl PriceFilter {
    pub fn new(min_price: Decimal, max_price: Decimal, tick_size: Decimal) -> Result<Self, FilterConfigError> {
        check_bounds_config(FilterKind::Price, min_price, max_price, tick_size)?;
        Ok(Self {
            min_price,
            max_price,
            tick_size: round_scale(tick_size),
        })
    }

    pub fn round(&self, price: Decimal) -> Decimal {
        round_to_step(price, self.tick_size)
    }

    fn apply(&self, price: Decimal) -> Result<Decimal, FilterViolationError> {
        let rounded = self.round(price);
        check_range(FilterKind::Price, rounded, self.min_price, self.max_price)?;
        Ok(rounded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotionalFilter {
    pub min_notional: Decimal,
    pub apply_min_to_market: bool,
    pub max_notional: Decimal,
    pub apply_max_to_market: bool,
    pub avg_price_mins: u32,
}

impl NotionalFilter {
    pub fn new(
        min_notional: Decimal,
        apply_min_to_market: bool,
        max_notional: Decimal,
        apply_max_to_market: bool,
        avg_price_mins: u32,
    ) -> Result<Self, FilterConfigError> {
        check_bounds_config(FilterKind::Notional, min_notional, max_notional, Decimal::ZERO)?;
        Ok(Self {
            min_notional,
            apply_min_to_market,
            max_notional,
            apply_max_to_market,
            avg_price_mins,
        })
    }

    fn apply(&self, kind: OrderKind, notional: Decimal) -> Result<(), FilterViolationError> {
        let is_market = kind == OrderKind::Market;
        if (!is_market || self.apply_min_to_market) && notional < self.min_notional {
            return Err(FilterViolationError {
                filter: FilterKind::Notional,
                bound: Bound::Min,
                value: notional,
                limit: self.min_notional,
            });
        }
        if (!is_market || self.apply_max_to_market) && notional > self.max_notional {
            return Err(FilterViolationError {
                filter: FilterKind::Notional,
                bound: Bound::Max,
                value: notional,
                limit: self.max_notional,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinNotionalFilter {
    pub min_notional: Decimal,
    pub apply_to_market: bool,
    pub avg_price_mins: u32,
}

impl MinNotionalFilter {
    pub fn new(min_notional: Decimal, apply_to_market: bool, avg_price_mins: u32) -> Result<Self, FilterConfigError> {
        if min_notional < Decimal::ZERO {
            return Err(FilterConfigError::Negative {
                filter: FilterKind::MinNotional,
                field: "minNotional",
            });
        }
        Ok(Self {
            min_notional,
            apply_to_market,
            avg_price_mins,
        })
    }

    fn apply(&self, kind: OrderKind, notional: Decimal) -> Result<(), FilterViolationError> {
        if kind == OrderKind::Market && !self.apply_to_market {
            return Ok(());
        }
        if notional < self.min_notional {
            return Err(FilterViolationError {
                filter: FilterKind::MinNotional,
                bound: Bound::Min,
                value: notional,
                limit: self.min_notional,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// An order after rounding; every applicable filter accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOrder {
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Decimal,
    pub notional: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolFilters {
    pub lot_size: Option<LotSizeFilter>,
    pub market_lot_size: Option<MarketLotSizeFilter>,
    pub price: Option<PriceFilter>,
    pub notional: Option<NotionalFilter>,
    pub min_notional: Option<MinNotionalFilter>,
}

impl SymbolFilters {
    pub fn validate(&self, order: &OrderRequest) -> Result<ValidatedOrder, FilterViolationError> {
        let mut quantity = round_scale(order.quantity);
        if let Some(lot_size) = &self.lot_size {
            quantity = lot_size.apply(FilterKind::LotSize, quantity)?;
        }
        if order.kind == OrderKind::Market {
            if let Some(market_lot_size) = &self.market_lot_size {
                quantity = market_lot_size.apply(FilterKind::MarketLotSize, quantity)?;
            }
        }

        let price = match (&self.price, order.kind) {
            (Some(price_filter), OrderKind::Limit) => price_filter.apply(order.price)?,
            _ => round_scale(order.price),
        };

        let notional = round_scale(price.checked_mul(quantity).unwrap_or(Decimal::MAX));
        if let Some(min_notional) = &self.min_notional {
            min_notional.apply(order.kind, notional)?;
        }
        if let Some(notional_filter) = &self.notional {
            notional_filter.apply(order.kind, notional)?;
        }

        Ok(ValidatedOrder {
            kind: order.kind,
            quantity,
            price,
            notional,
        })
    }
}

/// Filter entries as published by the exchange's symbol metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum ExchangeFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        min_qty: Decimal,
        max_qty: Decimal,
        step_size: Decimal,
    },
    #[serde(rename = "MARKET_LOT_SIZE", rename_all = "camelCase")]
    MarketLotSize {
        min_qty: Decimal,
        max_qty: Decimal,
        step_size: Decimal,
    },
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        min_price: Decimal,
        max_price: Decimal,
        tick_size: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional {
        min_notional: Decimal,
        #[serde(default)]
        apply_min_to_market: bool,
        max_notional: Decimal,
        #[serde(default)]
        apply_max_to_market: bool,
        #[serde(default)]
        avg_price_mins: u32,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        min_notional: Decimal,
        #[serde(default)]
        apply_to_market: bool,
        #[serde(default)]
        avg_price_mins: u32,
    },
    #[serde(other)]
    Unsupported,
}

impl SymbolFilters {
    pub fn from_exchange_filters(filters: Vec<ExchangeFilter>) -> Result<Self, FilterConfigError> {
        let mut result = SymbolFilters::default();
        for filter in filters {
            match filter {
                ExchangeFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => result.lot_size = Some(LotSizeFilter::new(min_qty, max_qty, step_size)?),
                ExchangeFilter::MarketLotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    check_bounds_config(FilterKind::MarketLotSize, min_qty, max_qty, step_size)?;
                    result.market_lot_size = Some(LotSizeFilter {
                        min_qty,
                        max_qty,
                        step_size: round_scale(step_size),
                    });
                }
                ExchangeFilter::Price {
                    min_price,
                    max_price,
                    tick_size,
                } => result.price = Some(PriceFilter::new(min_price, max_price, tick_size)?),
                ExchangeFilter::Notional {
                    min_notional,
                    apply_min_to_market,
                    max_notional,
                    apply_max_to_market,
                    avg_price_mins,
                } => {
                    result.notional = Some(NotionalFilter::new(
                        min_notional,
                        apply_min_to_market,
                        max_notional,
                        apply_max_to_market,
                        avg_price_mins,
                    )?)
                }
                ExchangeFilter::MinNotional {
                    min_notional,
                    apply_to_market,
                    avg_price_mins,
                } => {
                    result.min_notional = Some(MinNotionalFilter::new(
                        min_notional,
                        apply_to_market,
                        avg_price_mins,
                    )?)
                }
                ExchangeFilter::Unsupported => {}
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbolModel {
    symbol: String,
    #[serde(default)]
    base_asset: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    filters: Vec<ExchangeFilter>,
}

/// Read from the exchange's symbol metadata; never written back.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawSymbolModel")]
pub struct SymbolModel {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub filters: SymbolFilters,
}

impl TryFrom<RawSymbolModel> for SymbolModel {
    type Error = FilterConfigError;

    fn try_from(raw: RawSymbolModel) -> Result<Self, Self::Error> {
        Ok(SymbolModel {
            symbol: raw.symbol,
            base_asset: raw.base_asset,
            quote_asset: raw.quote_asset,
            filters: SymbolFilters::from_exchange_filters(raw.filters)?,
        })
    }
}

impl SymbolModel {
    /// A symbol with no trading constraints, used when the data source has
    /// no metadata for the strategy's market.
    pub fn unrestricted(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            base_asset: String::new(),
            quote_asset: String::new(),
            filters: SymbolFilters::default(),
        }
    }
}
