//! Shared handler plumbing: order placement with validation, balance
//! mutation and chart assembly from the history store and live quotes.

use serde_json::{json, Value};

use crate::market::types::{Execution, Side};
use crate::net::message::{ChartSeries, Message};
use crate::utils::{self, round2, round3};
use crate::AppState;

pub fn no_such_ticker(ticker: &str) -> Message {
    Message::bad(format!("No such ticker '{}'", ticker))
}

pub fn no_such_user(username: &str) -> Message {
    Message::bad(format!("No such user '{}'", username))
}

/// Validate and place an order, replying with the fill summary.
pub async fn place_order(
    state: &AppState,
    ticker: &str,
    issuer: &str,
    execution: Execution,
    side: Side,
    size: &str,
    price: &str,
) -> Message {
    if state.tree().asset(ticker).is_none() {
        return no_such_ticker(ticker);
    }

    let real_price: f64 = match price.parse() {
        Ok(p) if f64::is_finite(p) && (execution == Execution::Market || p > 0.0) => p,
        _ => {
            return Message::bad(format!("Invalid value '{}' for order price", price));
        }
    };

    let real_size: i64 = match size.parse() {
        Ok(s) if s > 0 => s,
        _ => {
            return Message::bad(format!("Invalid value '{}' for order size", size));
        }
    };

    let placement = match execution {
        Execution::Limit => state
            .market
            .add_limit_order(ticker, side, real_price, real_size, issuer),
        Execution::Market => state.market.add_market_order(ticker, side, real_size, issuer),
    };

    match placement {
        Some(placement) => Message::done_with(
            json!({
                "filled": placement.filled,
                "price": placement.fill_price,
                "id": placement.order_id,
            }),
            format!(
                "Order placed with ID={}. {} already filled at price '{}'",
                placement.order_id, placement.filled, placement.fill_price
            ),
        ),
        None => Message::deny(format!("Market closed for '{}'", ticker)),
    }
}

/// Shared by `setbal` and `addbal`.
pub fn change_balance(state: &AppState, username: &str, amount: &str, replace: bool) -> Message {
    let Some(user) = state.tree().user(username) else {
        return no_such_user(username);
    };
    let real_amount: f64 = match amount.parse() {
        Ok(a) if f64::is_finite(a) => round3(a),
        _ => return Message::bad(format!("Invalid value '{}'", amount)),
    };

    let balance = user.with(|u| {
        if replace {
            u.settled.balance = real_amount;
        } else {
            u.settled.balance = round3(u.settled.balance + real_amount);
        }
        u.settled.balance
    });
    Message::done(format!(
        "Settled balance of user '{}' set to {}",
        username, balance
    ))
}

/// Wrap a series into a chart reply; fewer than two points is refused.
pub fn chart_reply(
    ticker: &str,
    xformat: Option<&str>,
    x: Vec<Value>,
    y: Vec<Value>,
) -> Message {
    if x.len() != y.len() || x.len() < 2 {
        return Message::deny("Insufficient data");
    }
    Message::chart(
        ticker,
        xformat,
        "Time",
        "Value",
        vec![ChartSeries {
            name: ticker.to_string(),
            x,
            y,
        }],
    )
}

/// Spread in basis points over the mid, rounded to two digits.
pub fn spread_bp(bid: Option<f64>, ask: Option<f64>) -> Option<f64> {
    let (bid, ask) = (bid?, ask?);
    let mid = round3((ask + bid) / 2.0);
    if mid == 0.0 {
        return None;
    }
    Some(round2((ask - bid) / mid * 10000.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartProperty {
    Mid,
    Spread,
}

/// Today's intraday series plus the live quote, closed by a null point at
/// the next midnight so the axis spans the whole session.
pub async fn today_chart(
    state: &AppState,
    ticker: &str,
    property: ChartProperty,
) -> anyhow::Result<Message> {
    let Some(asset) = state.tree().asset(ticker) else {
        return Ok(no_such_ticker(ticker));
    };

    let rows = state
        .history
        .asset_intraday_of(ticker, &utils::today())
        .await?;

    let mut x: Vec<Value> = Vec::new();
    let mut y: Vec<Value> = Vec::new();
    for row in &rows {
        x.push(json!(format!("{} {}", row.day, row.time)));
        y.push(match property {
            ChartProperty::Mid => utils::value_fmt(row.mid),
            ChartProperty::Spread => utils::value_fmt(spread_bp(row.bid, row.ask)),
        });
    }

    let (bid, ask, mid) = asset.with(|a| (a.immediate.bid, a.immediate.ask, a.immediate.mid));
    x.push(json!(utils::now()));
    y.push(match property {
        ChartProperty::Mid => utils::value_fmt(mid),
        ChartProperty::Spread => utils::value_fmt(spread_bp(bid, ask)),
    });
    x.push(json!(format!("{} 00:00:00", utils::tomorrow())));
    y.push(Value::Null);

    Ok(chart_reply(ticker, Some("d/m/Y H:M"), x, y))
}

/// Historical intraday series for one past day.
pub async fn intraday_chart(
    state: &AppState,
    ticker: &str,
    day: &str,
    property: ChartProperty,
) -> anyhow::Result<Message> {
    if state.tree().asset(ticker).is_none() {
        return Ok(no_such_ticker(ticker));
    }
    let rows = state.history.asset_intraday_of(ticker, day).await?;

    let mut x: Vec<Value> = Vec::new();
    let mut y: Vec<Value> = Vec::new();
    for row in &rows {
        x.push(json!(format!("{} {}", row.day, row.time)));
        y.push(match property {
            ChartProperty::Mid => utils::value_fmt(row.mid),
            ChartProperty::Spread => utils::value_fmt(spread_bp(row.bid, row.ask)),
        });
    }
    Ok(chart_reply(ticker, Some("d/m/Y H:M"), x, y))
}

/// Daily close series plus the live mid.
pub async fn daily_chart(state: &AppState, ticker: &str) -> anyhow::Result<Message> {
    let Some(asset) = state.tree().asset(ticker) else {
        return Ok(no_such_ticker(ticker));
    };
    let rows = state.history.asset_daily_all(ticker).await?;

    let mut x: Vec<Value> = Vec::new();
    let mut y: Vec<Value> = Vec::new();
    for row in &rows {
        x.push(json!(row.day));
        y.push(utils::value_fmt(row.close));
    }
    x.push(json!(utils::now()));
    y.push(utils::value_fmt(asset.with(|a| a.immediate.mid)));
    x.push(json!(format!("{} 00:00:00", utils::tomorrow())));
    y.push(Value::Null);

    Ok(chart_reply(ticker, Some("d/m/Y H:M"), x, y))
}

/// Cumulative depth ladder from the live depth-by-price maps: bid liquidity
/// decays toward the touch, offer liquidity accumulates away from it.
pub fn depth_chart(state: &AppState, ticker: &str) -> Message {
    let Some(asset) = state.tree().asset(ticker) else {
        return no_such_ticker(ticker);
    };

    let (bids, offers) = asset.with(|a| {
        let parse = |levels: &std::collections::BTreeMap<String, i64>| {
            let mut parsed: Vec<(f64, i64)> = levels
                .iter()
                .filter_map(|(price, size)| price.parse::<f64>().ok().map(|p| (p, *size)))
                .collect();
            parsed.sort_by(|a, b| a.0.total_cmp(&b.0));
            parsed
        };
        (parse(&a.immediate.depth.bids), parse(&a.immediate.depth.offers))
    });

    let mut x: Vec<Value> = Vec::new();
    let mut y: Vec<Value> = Vec::new();

    let mut bid_quantity: i64 = bids.iter().map(|(_, size)| size).sum();
    for (price, size) in &bids {
        x.push(json!(price));
        y.push(json!(bid_quantity));
        bid_quantity -= size;
    }
    let mut offer_quantity: i64 = 0;
    for (price, size) in &offers {
        offer_quantity += size;
        x.push(json!(price));
        y.push(json!(offer_quantity));
    }

    chart_reply(ticker, None, x, y)
}
