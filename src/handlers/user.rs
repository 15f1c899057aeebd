//! Ordinary (unprivileged) session commands.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::command::ServerCommand;
use crate::handlers::backend::{self, ChartProperty};
use crate::market::types::{Execution, Side};
use crate::net::message::Message;
use crate::utils::{self, round3};
use crate::AppState;

pub async fn whoami(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let _ = state;
    Ok(Message::value("User", json!(cmd.issuer)))
}

pub async fn balance(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let Some(user) = state.tree().user(&cmd.issuer) else {
        return Ok(backend::no_such_user(&cmd.issuer));
    };
    let (settled, current) = user.with(|u| (u.settled.balance, u.current.balance));
    Ok(Message::multi(vec![
        Message::value("Unsettled Profit & Loss", json!(current)),
        Message::value("Settled Balance", json!(settled)),
    ]))
}

pub async fn market(state: Arc<AppState>, _cmd: ServerCommand) -> anyhow::Result<Message> {
    let columns = vec!["TICKER", "BID", "ASK", "MID", "BID V", "ASK V", "CHANGE"];
    let mut tables = Vec::new();

    for (class, tickers) in state.tree().classes_sorted() {
        let mut rows = Vec::new();
        for ticker in tickers {
            let Some(asset) = state.tree().asset(&ticker) else {
                continue;
            };
            rows.push(asset.with(|a| {
                let change = match (a.immediate.mid, a.session_data.previous_close) {
                    (Some(mid), Some(previous)) if previous != 0.0 => {
                        json!(format!("{:+.2}%", (mid - previous) / previous * 100.0))
                    }
                    _ => utils::value_fmt(None),
                };
                vec![
                    json!(ticker),
                    utils::value_fmt(a.immediate.bid),
                    utils::value_fmt(a.immediate.ask),
                    utils::value_fmt(a.immediate.mid),
                    utils::value_fmt_int(a.immediate.bid_volume),
                    utils::value_fmt_int(a.immediate.ask_volume),
                    change,
                ]
            }));
        }
        tables.push(Message::table(
            format!("CLASS {} MARKET", class),
            columns.clone(),
            rows,
        ));
    }

    Ok(Message::multi(tables))
}

pub async fn today(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    backend::today_chart(&state, &cmd.args[0].to_uppercase(), ChartProperty::Mid).await
}

pub async fn today_spread(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    backend::today_chart(&state, &cmd.args[0].to_uppercase(), ChartProperty::Spread).await
}

pub async fn intraday(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let day = format!("{}-{}-{}", cmd.args[3], cmd.args[2], cmd.args[1]);
    backend::intraday_chart(&state, &cmd.args[0].to_uppercase(), &day, ChartProperty::Mid).await
}

pub async fn intraday_spread(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let day = format!("{}-{}-{}", cmd.args[3], cmd.args[2], cmd.args[1]);
    backend::intraday_chart(&state, &cmd.args[0].to_uppercase(), &day, ChartProperty::Spread).await
}

pub async fn daily(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    backend::daily_chart(&state, &cmd.args[0].to_uppercase()).await
}

pub async fn depth(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    Ok(backend::depth_chart(&state, &cmd.args[0].to_uppercase()))
}

pub async fn sell_limit(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    Ok(backend::place_order(
        &state,
        &cmd.args[0].to_uppercase(),
        &cmd.issuer,
        Execution::Limit,
        Side::Sell,
        &cmd.args[1],
        &cmd.args[2],
    )
    .await)
}

pub async fn sell_market(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    Ok(backend::place_order(
        &state,
        &cmd.args[0].to_uppercase(),
        &cmd.issuer,
        Execution::Market,
        Side::Sell,
        &cmd.args[1],
        "0",
    )
    .await)
}

pub async fn buy_limit(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    Ok(backend::place_order(
        &state,
        &cmd.args[0].to_uppercase(),
        &cmd.issuer,
        Execution::Limit,
        Side::Buy,
        &cmd.args[1],
        &cmd.args[2],
    )
    .await)
}

pub async fn buy_market(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    Ok(backend::place_order(
        &state,
        &cmd.args[0].to_uppercase(),
        &cmd.issuer,
        Execution::Market,
        Side::Buy,
        &cmd.args[1],
        "0",
    )
    .await)
}

pub async fn pending_orders(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let Some(user) = state.tree().user(&cmd.issuer) else {
        return Ok(backend::no_such_user(&cmd.issuer));
    };
    let order_ids = user.with(|u| u.orders.clone());

    let mut rows = Vec::new();
    for order_id in order_ids {
        let Some(order) = state.tree().order(order_id) else {
            continue;
        };
        rows.push(order.with(|o| {
            vec![
                json!(o.ticker),
                json!(order_id),
                json!(o.execution.to_string()),
                json!(o.side.to_string()),
                json!(o.size),
                utils::value_fmt(Some(o.price).filter(|p| p.is_finite())),
            ]
        }));
    }

    Ok(Message::table(
        "PENDING ORDERS",
        vec!["TICKER", "ORDER", "EXEC", "SIDE", "SIZE", "PRICE"],
        rows,
    ))
}

pub async fn delete_order(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let Ok(order_id) = cmd.args[0].parse::<u64>() else {
        return Ok(Message::bad(format!(
            "Invalid value '{}' for order ID",
            cmd.args[0]
        )));
    };

    Ok(match state.market.cancel_order(order_id, &cmd.issuer) {
        Ok(()) => Message::done_with(json!({ "errno": Value::Null }), "Order deleted"),
        Err(e) => Message::deny_with(
            json!({ "errno": e.errno() }),
            match e.errno() {
                -1 => format!("No such order ID '{}'", order_id),
                _ => "Permission denied".to_string(),
            },
        ),
    })
}

pub async fn clear_orders(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let ticker = cmd.args[0].to_uppercase();
    if state.tree().asset(&ticker).is_none() {
        return Ok(backend::no_such_ticker(&ticker));
    }

    let order_ids = state.market.open_orders(&ticker, Some(&cmd.issuer));
    let total = order_ids.len();
    let mut successful = 0;
    for order_id in order_ids {
        if state.market.cancel_order(order_id, &cmd.issuer).is_ok() {
            successful += 1;
        }
    }

    Ok(Message::done_with(
        json!({
            "total": total,
            "successful": successful,
            "failed": total - successful,
        }),
        format!(
            "{} orders processed, {} successful, {} failed",
            total,
            successful,
            total - successful
        ),
    ))
}

pub async fn positions(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let Some(user) = state.tree().user(&cmd.issuer) else {
        return Ok(backend::no_such_user(&cmd.issuer));
    };
    let (settled, current) = user.with(|u| (u.settled.assets.clone(), u.current.assets.clone()));

    let tickers: BTreeSet<String> = settled.keys().chain(current.keys()).cloned().collect();
    let mut rows = Vec::new();
    for ticker in tickers {
        let settled_units = settled.get(&ticker).copied().unwrap_or(0);
        let current_units = current.get(&ticker).copied().unwrap_or(0);
        let mark = state
            .tree()
            .asset(&ticker)
            .and_then(|a| a.with(|a| a.immediate.mid.or(a.session_data.previous_close)))
            .unwrap_or(0.0);
        rows.push(vec![
            json!(ticker),
            json!(settled_units),
            json!(current_units),
            json!(round3((settled_units + current_units) as f64 * mark)),
        ]);
    }

    Ok(Message::table(
        "POSITIONS",
        vec!["TICKER", "SETTLED", "UNSETTLED", "VALUE"],
        rows,
    ))
}

pub async fn market_position(state: Arc<AppState>, _cmd: ServerCommand) -> anyhow::Result<Message> {
    let columns = vec![
        "TICKER", "L BID", "L ASK", "BUY V", "SELL V", "TRADED", "SPREAD", "SHORT",
    ];
    let usernames = state.tree().usernames();
    let mut tables = Vec::new();

    for (class, tickers) in state.tree().classes_sorted() {
        let mut rows = Vec::new();
        for ticker in tickers {
            let Some(asset) = state.tree().asset(&ticker) else {
                continue;
            };
            let issuer = asset.with(|a| a.info.issuer.clone());

            // Aggregate short exposure across non-issuer holders: settled
            // units plus any negative session delta.
            let mut short_units: i64 = 0;
            for username in &usernames {
                if issuer == "*" || *username == issuer {
                    continue;
                }
                let Some(user) = state.tree().user(username) else {
                    continue;
                };
                let exposure = user.with(|u| {
                    let mut units = u.settled.assets.get(&ticker).copied().unwrap_or(0);
                    let session = u.current.assets.get(&ticker).copied().unwrap_or(0);
                    if session < 0 {
                        units += session;
                    }
                    units
                });
                if exposure < 0 {
                    short_units += exposure.abs();
                }
            }

            rows.push(asset.with(|a| {
                vec![
                    json!(ticker),
                    utils::value_fmt(a.immediate.last_bid),
                    utils::value_fmt(a.immediate.last_ask),
                    json!(a.session_data.buy_volume),
                    json!(a.session_data.sell_volume),
                    json!(a.session_data.traded_value),
                    utils::value_fmt(backend::spread_bp(a.immediate.bid, a.immediate.ask)),
                    json!(short_units),
                ]
            }));
        }
        tables.push(Message::table(
            format!("CLASS {} MARKET", class),
            columns.clone(),
            rows,
        ));
    }

    Ok(Message::multi(tables))
}

pub async fn pay(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let who = &cmd.args[0];
    if state.tree().user(who).is_none() {
        return Ok(backend::no_such_user(who));
    }

    let amount: f64 = match cmd.args[1].parse() {
        Ok(a) if f64::is_finite(a) && a >= 0.0 => round3(a),
        _ => {
            return Ok(Message::bad(format!(
                "Invalid value '{}' for transaction size",
                cmd.args[1]
            )));
        }
    };

    // Central-bank senders mint: no debit.
    if !state.accounts.has_role(&cmd.issuer, "centralbank").await? {
        let Some(sender) = state.tree().user(&cmd.issuer) else {
            return Ok(backend::no_such_user(&cmd.issuer));
        };
        let debited = sender.with(|u| {
            if u.settled.balance + u.current.balance < amount {
                return false;
            }
            if u.settled.balance < amount {
                u.current.balance = round3(u.current.balance - amount);
            } else {
                u.settled.balance = round3(u.settled.balance - amount);
            }
            true
        });
        if !debited {
            return Ok(Message::deny("Insufficient capital"));
        }
    }

    // Central-bank receivers burn: no credit.
    if !state.accounts.has_role(who, "centralbank").await? {
        if let Some(receiver) = state.tree().user(who) {
            receiver.with(|u| u.settled.balance = round3(u.settled.balance + amount));
        }
    }

    state
        .history
        .add_payment(&cmd.issuer, who, amount, "payment", "XUD")
        .await?;

    Ok(Message::done(format!("Transferred {} to '{}'", amount, who)))
}

pub async fn transfer(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let ticker = cmd.args[0].to_uppercase();
    let Some(asset) = state.tree().asset(&ticker) else {
        return Ok(backend::no_such_ticker(&ticker));
    };

    let quantity: i64 = match cmd.args[1].parse() {
        Ok(q) if q > 0 => q,
        _ => {
            return Ok(Message::bad(format!(
                "Invalid value '{}' for quantity",
                cmd.args[1]
            )));
        }
    };

    let who = &cmd.args[2];
    if state.tree().user(who).is_none() {
        return Ok(backend::no_such_user(who));
    }

    let sender_is_issuer =
        asset.with(|a| state.tree().user_is_issuer(&cmd.issuer, a));
    let Some(sender) = state.tree().user(&cmd.issuer) else {
        return Ok(backend::no_such_user(&cmd.issuer));
    };

    let debited = sender.with(|u| {
        let held = u.settled.assets.get(&ticker).copied().unwrap_or(0);
        if !sender_is_issuer && held < quantity {
            return false;
        }
        let units = u.settled.assets.entry(ticker.clone()).or_insert(0);
        *units -= quantity;
        if *units == 0 {
            u.settled.assets.remove(&ticker);
        }
        true
    });
    if !debited {
        return Ok(Message::deny(format!(
            "The specified amount of {} units is higher than your settled portfolio allows",
            quantity
        )));
    }

    if let Some(receiver) = state.tree().user(who) {
        receiver.with(|u| {
            let units = u.settled.assets.entry(ticker.clone()).or_insert(0);
            *units += quantity;
            if *units == 0 {
                u.settled.assets.remove(&ticker);
            }
        });
    }

    Ok(Message::done(format!(
        "Transferred {} units of '{}' to '{}'",
        quantity, ticker, who
    )))
}

pub async fn change_password(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let stored = state.accounts.get_password(&cmd.issuer).await?;
    if stored.as_deref() != Some(cmd.args[0].as_str()) {
        return Ok(Message::deny("Wrong password"));
    }
    state.accounts.set_password(&cmd.issuer, &cmd.args[1]).await?;
    Ok(Message::done("Password updated"))
}

pub async fn email_address(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    state.accounts.set_email(&cmd.issuer, &cmd.args[0]).await?;
    Ok(Message::done("E-Mail address updated"))
}

pub async fn change_name(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let new_name = &cmd.args[0];
    if new_name.is_empty() || !new_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Ok(Message::bad("Username contains invalid characters"));
    }
    if !state.accounts.rename_user(&cmd.issuer, new_name).await? {
        return Ok(Message::deny(format!("Username '{}' is taken", new_name)));
    }
    state.tree().rename_user(&cmd.issuer, new_name);
    state.market.rename_issuer(&cmd.issuer, new_name);
    state.credit.update_names(&cmd.issuer, new_name).await?;
    Ok(Message::done(format!(
        "Username changed to '{}', log in again",
        new_name
    )))
}

pub async fn json_path(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let path = cmd.args.first().map(String::as_str).unwrap_or("");
    let steps: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut target = state.tree().to_value();
    for step in &steps {
        let next = match &target {
            Value::Object(map) => map.get(*step).cloned(),
            Value::Array(items) => step
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned()),
            _ => None,
        };
        match next {
            Some(value) => target = value,
            None => return Ok(Message::bad(format!("Unknown key '{}'", step))),
        }
    }

    let name = steps.last().copied().unwrap_or("db");
    Ok(Message::value(name, target))
}

pub async fn query(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let kind = cmd.args[0].as_str();
    let args = &cmd.args[1..];
    match (kind, args.len()) {
        ("intraday", 2) => {
            let rows = state
                .history
                .asset_intraday_of(&args[0].to_uppercase(), &args[1])
                .await?;
            Ok(Message::table(
                format!("{} INTRADAY {}", args[0].to_uppercase(), args[1]),
                vec!["TIME", "BID", "ASK", "MID"],
                rows.iter()
                    .map(|r| {
                        vec![
                            json!(r.time),
                            utils::value_fmt(r.bid),
                            utils::value_fmt(r.ask),
                            utils::value_fmt(r.mid),
                        ]
                    })
                    .collect(),
            ))
        }
        ("daily", 3) => {
            let rows = state
                .history
                .asset_daily_between(&args[0].to_uppercase(), &args[1], &args[2])
                .await?;
            Ok(Message::table(
                format!("{} DAILY", args[0].to_uppercase()),
                vec!["DAY", "BUY V", "SELL V", "TRADED", "OPEN", "CLOSE"],
                rows.iter()
                    .map(|r| {
                        vec![
                            json!(r.day),
                            json!(r.buy_volume),
                            json!(r.sell_volume),
                            json!(r.traded_value),
                            utils::value_fmt(r.open),
                            utils::value_fmt(r.close),
                        ]
                    })
                    .collect(),
            ))
        }
        ("user", 1) => {
            let rows = state.history.user_on(&cmd.issuer, &args[0]).await?;
            Ok(Message::table(
                format!("{} ON {}", cmd.issuer, args[0]),
                vec!["DAY", "BALANCE", "ASSETS"],
                rows.iter()
                    .map(|r| vec![json!(r.day), json!(r.balance), json!(r.assets)])
                    .collect(),
            ))
        }
        ("user", 2) => {
            let rows = state
                .history
                .user_between(&cmd.issuer, &args[0], &args[1])
                .await?;
            Ok(Message::table(
                format!("{} BETWEEN {} AND {}", cmd.issuer, args[0], args[1]),
                vec!["DAY", "BALANCE", "ASSETS"],
                rows.iter()
                    .map(|r| vec![json!(r.day), json!(r.balance), json!(r.assets)])
                    .collect(),
            ))
        }
        ("payments", 2) => {
            let rows = state
                .history
                .payments_between(&cmd.issuer, &args[0], &args[1])
                .await?;
            Ok(Message::table(
                "PAYMENTS",
                vec!["DAY", "TIME", "SENDER", "RECEIVER", "AMOUNT", "CURRENCY", "CATEGORY"],
                rows.iter()
                    .map(|r| {
                        vec![
                            json!(r.day),
                            json!(r.time),
                            json!(r.sender),
                            json!(r.receiver),
                            json!(r.amount),
                            json!(r.currency),
                            json!(r.category.clone().unwrap_or_default()),
                        ]
                    })
                    .collect(),
            ))
        }
        _ => Ok(Message::bad(format!("Unknown query '{}'", cmd.raw))),
    }
}

pub async fn credits(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let rows = state.credit.list_credits(&cmd.issuer).await?;
    Ok(Message::table(
        "OPEN CREDITS",
        vec![
            "ID", "CREDITOR", "DEBTOR", "AMOUNT", "DUE", "START", "MATURED", "DURATION",
            "FREQ", "SPREAD", "COLLATERAL", "BENCH", "NOTE",
        ],
        rows.iter()
            .map(|r| {
                vec![
                    json!(r.credit.id_credit),
                    json!(r.credit.creditor),
                    json!(r.credit.debtor),
                    json!(r.credit.amount),
                    json!(r.credit.amount_due),
                    json!(r.credit.start_date),
                    json!(r.credit.matured),
                    json!(r.credit.duration),
                    json!(r.credit.frequency),
                    json!(r.credit.spread),
                    json!(r.credit.collateral),
                    json!(r.benchmark_value),
                    json!(r.credit.note),
                ]
            })
            .collect(),
    ))
}

pub async fn benchmarks(state: Arc<AppState>, _cmd: ServerCommand) -> anyhow::Result<Message> {
    let rows = state.credit.list_benchmarks().await?;
    Ok(Message::table(
        "BENCHMARKS",
        vec!["NAME", "ISSUER", "VALUE"],
        rows.iter()
            .map(|r| vec![json!(r.name), json!(r.issuer), json!(r.value)])
            .collect(),
    ))
}
