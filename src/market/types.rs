//! Matching engine types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::guard::Guarded;

/// Order side. On a trade this denotes the taker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Execution kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Execution {
    Limit,
    Market,
}

impl std::fmt::Display for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Execution::Limit => write!(f, "LIMIT"),
            Execution::Market => write!(f, "MARKET"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Cancelled,
}

/// A live order, shared between the global registry and the book it rests
/// in. `size` is the remaining book size, mutated while matching; `left` is
/// the unfilled portion decremented as trades are applied; `price` uses the
/// market sentinels +inf (buy) and 0 (sell) for market orders.
#[derive(Debug)]
pub struct Order {
    pub id: u64,
    pub execution: Execution,
    pub side: Side,
    pub ticker: String,
    pub issuer: String,
    pub size: i64,
    pub left: i64,
    pub price: f64,
    pub fill_cost: f64,
    pub status: OrderStatus,
}

pub type OrderRef = Arc<Guarded<Order>>;

impl Order {
    pub fn limit(id: u64, side: Side, ticker: &str, issuer: &str, size: i64, price: f64) -> Self {
        Self {
            id,
            execution: Execution::Limit,
            side,
            ticker: ticker.to_string(),
            issuer: issuer.to_string(),
            size,
            left: size,
            price,
            fill_cost: 0.0,
            status: OrderStatus::Open,
        }
    }

    pub fn market(id: u64, side: Side, ticker: &str, issuer: &str, size: i64) -> Self {
        let price = match side {
            Side::Buy => f64::INFINITY,
            Side::Sell => 0.0,
        };
        Self {
            id,
            execution: Execution::Market,
            side,
            ticker: ticker.to_string(),
            issuer: issuer.to_string(),
            size,
            left: size,
            price,
            fill_cost: 0.0,
            status: OrderStatus::Open,
        }
    }
}

/// A single execution produced by the matching layer. `side` is the taker
/// side; `price` starts as the resting order's price and is resolved during
/// trade application.
#[derive(Debug, Clone, Copy)]
pub struct Trade {
    pub side: Side,
    pub incoming_order_id: u64,
    pub book_order_id: u64,
    pub price: f64,
    pub size: i64,
}

/// Outcome of a successfully accepted order, reported back to the client.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub order_id: u64,
    pub filled: i64,
    /// Average fill price over the filled portion, 0 when nothing filled.
    pub fill_price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_price_sentinels() {
        let buy = Order::market(1, Side::Buy, "XYZ", "a", 5);
        let sell = Order::market(2, Side::Sell, "XYZ", "a", 5);
        assert!(buy.price.is_infinite());
        assert_eq!(sell.price, 0.0);
    }

    #[test]
    fn test_side_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        let side: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn test_limit_left_initialized() {
        let order = Order::limit(1, Side::Buy, "XYZ", "a", 10, 100.0);
        assert_eq!(order.left, 10);
        assert_eq!(order.size, 10);
    }
}
