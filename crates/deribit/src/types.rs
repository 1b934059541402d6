//! Order domain types shared by the dispatcher's public operations.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(Error::InvalidArgument(format!(
                "Invalid side '{}'. Must be 'buy' or 'sell'",
                other
            ))),
        }
    }
}

/// Order kind on the exchange's wire format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Limit,
    Market,
    StopLimit,
    StopMarket,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Limit => "limit",
            OrderKind::Market => "market",
            OrderKind::StopLimit => "stop_limit",
            OrderKind::StopMarket => "stop_market",
        }
    }

    /// Kinds that carry a `price` field.
    pub fn is_priced(&self) -> bool {
        matches!(self, OrderKind::Limit | OrderKind::StopLimit)
    }

    /// Kinds that carry `trigger` and `trigger_price` fields.
    pub fn is_triggered(&self) -> bool {
        matches!(self, OrderKind::StopMarket | OrderKind::StopLimit)
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(OrderKind::Limit),
            "market" => Ok(OrderKind::Market),
            "stop_limit" => Ok(OrderKind::StopLimit),
            "stop_market" => Ok(OrderKind::StopMarket),
            other => Err(Error::InvalidArgument(format!(
                "Invalid order type '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parses_wire_strings() {
        assert_eq!("buy".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!("sell".parse::<OrderSide>().unwrap(), OrderSide::Sell);
        assert!(matches!(
            "hold".parse::<OrderSide>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn kind_field_rules() {
        assert!(OrderKind::Limit.is_priced());
        assert!(OrderKind::StopLimit.is_priced());
        assert!(!OrderKind::Market.is_priced());
        assert!(!OrderKind::StopMarket.is_priced());

        assert!(OrderKind::StopLimit.is_triggered());
        assert!(OrderKind::StopMarket.is_triggered());
        assert!(!OrderKind::Limit.is_triggered());
        assert!(!OrderKind::Market.is_triggered());
    }

    #[test]
    fn kind_round_trips_wire_names() {
        for kind in ["limit", "market", "stop_limit", "stop_market"] {
            assert_eq!(kind.parse::<OrderKind>().unwrap().as_str(), kind);
        }
        assert!("trailing_stop".parse::<OrderKind>().is_err());
    }
}
