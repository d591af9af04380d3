//! Typed parameter sets for every broker method a worker exposes

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::registry::{MethodParams, MethodRegistry};
use crate::error::WorkerResult;

/// Most symbols accepted by a single quote request
pub const MAX_SYMBOLS_PER_REQUEST: usize = 50;

/// Most records returned by a single listing request
pub const MAX_LIST_LIMIT: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MKT")]
    Market,
    #[serde(rename = "LMT")]
    Limit,
    #[serde(rename = "STP")]
    Stop,
    #[serde(rename = "STP_LMT")]
    StopLimit,
}

impl OrderType {
    fn needs_limit_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }

    fn needs_stop_price(&self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    Us,
    Hk,
    Cn,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarPeriod {
    Day,
    Week,
    Month,
    #[serde(rename = "1min")]
    OneMinute,
    #[serde(rename = "5min")]
    FiveMinutes,
    #[serde(rename = "15min")]
    FifteenMinutes,
    #[serde(rename = "30min")]
    ThirtyMinutes,
    #[serde(rename = "60min")]
    SixtyMinutes,
}

/// Methods without parameters
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

impl MethodParams for NoParams {
    const POSITIONAL: &'static [&'static str] = &[];
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionsParams {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub sec_type: Option<String>,
    #[serde(default)]
    pub market: Option<Market>,
}

impl MethodParams for PositionsParams {
    const POSITIONAL: &'static [&'static str] = &["symbol", "sec_type", "market"];
}

/// Orders and transactions listings share one filter shape
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListingParams {
    #[serde(default)]
    pub symbol: Option<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl MethodParams for ListingParams {
    const POSITIONAL: &'static [&'static str] = &["symbol", "start_time", "end_time", "limit"];

    fn validate(&self) -> Result<(), String> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(format!("start_time {start} is after end_time {end}"));
            }
        }
        match self.limit {
            Some(0) => Err("limit must be positive".to_string()),
            Some(limit) if limit > MAX_LIST_LIMIT => {
                Err(format!("limit {limit} exceeds maximum of {MAX_LIST_LIMIT}"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderIdParams {
    pub id: u64,
}

impl MethodParams for OrderIdParams {
    const POSITIONAL: &'static [&'static str] = &["id"];
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaceOrderParams {
    pub symbol: String,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub quantity: u64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl MethodParams for PlaceOrderParams {
    const POSITIONAL: &'static [&'static str] =
        &["symbol", "action", "order_type", "quantity", "limit_price", "stop_price"];

    fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        if self.quantity == 0 {
            return Err("quantity must be positive".to_string());
        }
        if self.order_type.needs_limit_price() {
            match self.limit_price {
                Some(price) if price > 0.0 => {}
                _ => return Err(format!("{:?} order requires a positive limit_price", self.order_type)),
            }
        }
        if self.order_type.needs_stop_price() {
            match self.stop_price {
                Some(price) if price > 0.0 => {}
                _ => return Err(format!("{:?} order requires a positive stop_price", self.order_type)),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModifyOrderParams {
    pub id: u64,
    #[serde(default)]
    pub quantity: Option<u64>,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
}

impl MethodParams for ModifyOrderParams {
    const POSITIONAL: &'static [&'static str] = &["id", "quantity", "limit_price", "stop_price"];

    fn validate(&self) -> Result<(), String> {
        if self.quantity.is_none() && self.limit_price.is_none() && self.stop_price.is_none() {
            return Err("nothing to modify".to_string());
        }
        if self.quantity == Some(0) {
            return Err("quantity must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketStatusParams {
    #[serde(default)]
    pub market: Option<Market>,
}

impl MethodParams for MarketStatusParams {
    const POSITIONAL: &'static [&'static str] = &["market"];
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymbolsParams {
    pub symbols: Vec<String>,
}

fn check_symbols(symbols: &[String]) -> Result<(), String> {
    if symbols.is_empty() {
        return Err("at least one symbol is required".to_string());
    }
    if symbols.len() > MAX_SYMBOLS_PER_REQUEST {
        return Err(format!(
            "{} symbols requested, maximum is {MAX_SYMBOLS_PER_REQUEST}",
            symbols.len()
        ));
    }
    Ok(())
}

impl MethodParams for SymbolsParams {
    const POSITIONAL: &'static [&'static str] = &["symbols"];

    fn validate(&self) -> Result<(), String> {
        check_symbols(&self.symbols)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BarsParams {
    pub symbols: Vec<String>,
    #[serde(default = "default_bar_period")]
    pub period: BarPeriod,
    #[serde(default)]
    pub limit: Option<u32>,
}

fn default_bar_period() -> BarPeriod {
    BarPeriod::Day
}

impl MethodParams for BarsParams {
    const POSITIONAL: &'static [&'static str] = &["symbols", "period", "limit"];

    fn validate(&self) -> Result<(), String> {
        check_symbols(&self.symbols)?;
        match self.limit {
            Some(0) => Err("limit must be positive".to_string()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionChainParams {
    pub symbol: String,
    pub expiry: NaiveDate,
}

impl MethodParams for OptionChainParams {
    const POSITIONAL: &'static [&'static str] = &["symbol", "expiry"];

    fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        Ok(())
    }
}

/// Build the registry of every method a worker serves
pub fn standard_registry() -> WorkerResult<MethodRegistry> {
    let mut registry = MethodRegistry::new();

    registry.register_broker::<NoParams>("trade.get_account")?;
    registry.register_broker::<NoParams>("trade.get_assets")?;
    registry.register_broker::<PositionsParams>("trade.get_positions")?;
    registry.register_broker::<ListingParams>("trade.get_orders")?;
    registry.register_broker::<OrderIdParams>("trade.get_order")?;
    registry.register_broker::<ListingParams>("trade.get_transactions")?;
    registry.register_broker::<PlaceOrderParams>("trade.place_order")?;
    registry.register_broker::<ModifyOrderParams>("trade.modify_order")?;
    registry.register_broker::<OrderIdParams>("trade.cancel_order")?;

    registry.register_broker::<MarketStatusParams>("quote.get_market_status")?;
    registry.register_broker::<SymbolsParams>("quote.get_stock_briefs")?;
    registry.register_broker::<BarsParams>("quote.get_bars")?;
    registry.register_broker::<SymbolsParams>("quote.get_timeline")?;
    registry.register_broker::<SymbolsParams>("quote.get_option_expirations")?;
    registry.register_broker::<OptionChainParams>("quote.get_option_chain")?;

    Ok(registry)
}
