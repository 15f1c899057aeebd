//! Privileged (sigil) session commands.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::command::ServerCommand;
use crate::handlers::backend;
use crate::net::message::Message;
use crate::services::settlement;
use crate::store::records::AssetRecord;
use crate::utils::round3;
use crate::AppState;

pub async fn stop(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    info!(issuer = %cmd.issuer, "server stop requested");
    state.market.close_markets();
    state.shutdown.notify_waiters();
    Ok(Message::done("Server stopping"))
}

pub async fn set_balance(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    Ok(backend::change_balance(&state, &cmd.args[0], &cmd.args[1], true))
}

pub async fn add_balance(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    Ok(backend::change_balance(&state, &cmd.args[0], &cmd.args[1], false))
}

pub async fn add_ticker(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let ticker = cmd.args[0].to_uppercase();
    let class = &cmd.args[1];
    if !state.tree().add_asset(&ticker, class, "admin") {
        return Ok(Message::bad(format!("Ticker '{}' already exists", ticker)));
    }
    state.market.create_market(&ticker);
    Ok(Message::done(format!("Added '{}={}'", ticker, class)))
}

pub async fn set_ticker(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let ticker = cmd.args[0].to_uppercase();
    let (section, attribute, raw_value, value_type) =
        (&cmd.args[1], &cmd.args[2], &cmd.args[3], &cmd.args[4]);

    let Some(asset) = state.tree().asset(&ticker) else {
        return Ok(backend::no_such_ticker(&ticker));
    };

    let typed: Value = match value_type.as_str() {
        "int" => match raw_value.parse::<i64>() {
            Ok(v) => json!(v),
            Err(_) => return Ok(Message::bad(format!("Invalid int '{}'", raw_value))),
        },
        "float" => match raw_value.parse::<f64>() {
            Ok(v) => json!(v),
            Err(_) => return Ok(Message::bad(format!("Invalid float '{}'", raw_value))),
        },
        "bool" => match raw_value.parse::<bool>() {
            Ok(v) => json!(v),
            Err(_) => return Ok(Message::bad(format!("Invalid bool '{}'", raw_value))),
        },
        "str" => json!(raw_value),
        "null" => Value::Null,
        other => return Ok(Message::bad(format!("Unknown value type '{}'", other))),
    };

    let outcome = asset.with(|a| {
        let mut doc = serde_json::to_value(&*a).expect("asset record serializes");
        let Some(section_map) = doc.get_mut(section.as_str()) else {
            return Err(format!("Unknown section '{}' for asset '{}'", section, ticker));
        };
        let Some(slot) = section_map.get_mut(attribute.as_str()) else {
            return Err(format!(
                "Unknown attribute '{}' for asset '{}/{}'",
                attribute, ticker, section
            ));
        };
        *slot = typed;
        match serde_json::from_value::<AssetRecord>(doc) {
            Ok(updated) => {
                *a = updated;
                Ok(())
            }
            Err(_) => Err(format!(
                "Value '{}' of type '{}' does not fit '{}/{}'",
                raw_value, value_type, section, attribute
            )),
        }
    });

    Ok(match outcome {
        Ok(()) => Message::done(format!(
            "{}/{}/{} set to '{}' of type '{}'",
            ticker, section, attribute, raw_value, value_type
        )),
        Err(message) => Message::bad(message),
    })
}

pub async fn remove_ticker(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let ticker = cmd.args[0].to_uppercase();
    let Some(asset) = state.tree().asset(&ticker) else {
        return Ok(backend::no_such_ticker(&ticker));
    };
    let issuer = asset.with(|a| a.info.issuer.clone());

    state.market.remove_market(&ticker, Path::new("."));

    // Liquidate holdings into a per-user refund map; issuer-held settled
    // units are dropped without refund.
    let mut refunds: BTreeMap<String, i64> = BTreeMap::new();
    for username in state.tree().usernames() {
        let Some(user) = state.tree().user(&username) else {
            continue;
        };
        let user_is_issuer = issuer == "*" || username == issuer;
        user.with(|u| {
            if let Some(units) = u.current.assets.remove(&ticker) {
                *refunds.entry(username.clone()).or_insert(0) += units;
            }
            if let Some(units) = u.settled.assets.remove(&ticker) {
                if !user_is_issuer {
                    *refunds.entry(username.clone()).or_insert(0) += units;
                }
            }
        });
    }

    let mut messages = vec![Message::done("Ticker deleted")];
    for (username, units) in refunds {
        messages.push(Message::value(username, json!(units)));
    }
    Ok(Message::multi(messages))
}

pub async fn change_ticker(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let old_ticker = cmd.args[0].to_uppercase();
    let new_ticker = cmd.args[1].to_uppercase();
    if state.tree().asset(&old_ticker).is_none() {
        return Ok(backend::no_such_ticker(&old_ticker));
    }
    if !state.market.rename_market(&old_ticker, &new_ticker) {
        return Ok(Message::bad(format!(
            "Ticker '{}' already exists",
            new_ticker
        )));
    }

    // Holdings and history rows follow the rename.
    for username in state.tree().usernames() {
        if let Some(user) = state.tree().user(&username) {
            user.with(|u| {
                if let Some(units) = u.current.assets.remove(&old_ticker) {
                    u.current.assets.insert(new_ticker.clone(), units);
                }
                if let Some(units) = u.settled.assets.remove(&old_ticker) {
                    u.settled.assets.insert(new_ticker.clone(), units);
                }
            });
        }
    }
    state.history.update_ticker(&old_ticker, &new_ticker).await?;

    Ok(Message::done(format!(
        "Ticker '{}' renamed to '{}'",
        old_ticker, new_ticker
    )))
}

pub async fn new_session(state: Arc<AppState>, _cmd: ServerCommand) -> anyhow::Result<Message> {
    settlement::settle(&state).await?;
    Ok(Message::done("Session reset"))
}

pub async fn add_role(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    state.accounts.add_role(&cmd.args[0], &cmd.args[1]).await?;
    Ok(Message::done(format!(
        "Added role '{}' to user '{}'",
        cmd.args[1], cmd.args[0]
    )))
}

pub async fn remove_role(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    state
        .accounts
        .remove_role(&cmd.args[0], &cmd.args[1])
        .await?;
    Ok(Message::done(format!(
        "Removed role '{}' from user '{}'",
        cmd.args[1], cmd.args[0]
    )))
}

pub async fn news_update(state: Arc<AppState>, _cmd: ServerCommand) -> anyhow::Result<Message> {
    state.digest.send(state.tree());
    Ok(Message::done("News sent"))
}

pub async fn new_credit(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let (creditor, debtor) = (&cmd.args[0], &cmd.args[1]);
    for party in [creditor, debtor] {
        if state.tree().user(party).is_none() {
            return Ok(backend::no_such_user(party));
        }
    }

    let amount: f64 = match cmd.args[2].parse() {
        Ok(v) if f64::is_finite(v) => round3(v),
        _ => return Ok(Message::bad(format!("Invalid value '{}'", cmd.args[2]))),
    };
    let amount_due: f64 = match cmd.args[3].parse() {
        Ok(v) if f64::is_finite(v) => round3(v),
        _ => return Ok(Message::bad(format!("Invalid value '{}'", cmd.args[3]))),
    };
    let duration: i64 = match cmd.args[4].parse() {
        Ok(v) if v > 0 => v,
        _ => return Ok(Message::bad(format!("Invalid duration '{}'", cmd.args[4]))),
    };
    let frequency: i64 = match cmd.args[5].parse() {
        Ok(v) if v > 0 => v,
        _ => return Ok(Message::bad(format!("Invalid frequency '{}'", cmd.args[5]))),
    };
    let collateral: f64 = match cmd.args[6].parse() {
        Ok(v) if f64::is_finite(v) && v >= 0.0 => round3(v),
        _ => return Ok(Message::bad(format!("Invalid collateral '{}'", cmd.args[6]))),
    };
    let spread: i64 = match cmd.args[7].parse() {
        Ok(v) => v,
        Err(_) => return Ok(Message::bad(format!("Invalid spread '{}'", cmd.args[7]))),
    };
    let Some(benchmark) = state.credit.benchmark_by_name(&cmd.args[8]).await? else {
        return Ok(Message::bad(format!("No such benchmark '{}'", cmd.args[8])));
    };

    state
        .credit
        .add_credit(
            creditor,
            debtor,
            amount,
            amount_due,
            duration,
            frequency,
            collateral,
            spread,
            benchmark.id_benchmark,
            &cmd.args[9],
        )
        .await?;
    Ok(Message::done(format!(
        "Credit of {} from '{}' to '{}' registered",
        amount, creditor, debtor
    )))
}

pub async fn new_benchmark(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let value: i64 = match cmd.args[2].parse() {
        Ok(v) => v,
        Err(_) => return Ok(Message::bad(format!("Invalid value '{}'", cmd.args[2]))),
    };
    if state.credit.benchmark_by_name(&cmd.args[0]).await?.is_some() {
        return Ok(Message::bad(format!(
            "Benchmark '{}' already exists",
            cmd.args[0]
        )));
    }
    state
        .credit
        .add_benchmark(&cmd.args[0], &cmd.args[1], value)
        .await?;
    Ok(Message::done(format!(
        "Benchmark '{}' registered at {}",
        cmd.args[0], value
    )))
}

pub async fn set_benchmark(state: Arc<AppState>, cmd: ServerCommand) -> anyhow::Result<Message> {
    let value: i64 = match cmd.args[1].parse() {
        Ok(v) => v,
        Err(_) => return Ok(Message::bad(format!("Invalid value '{}'", cmd.args[1]))),
    };
    if !state.credit.set_benchmark(&cmd.args[0], value).await? {
        return Ok(Message::bad(format!(
            "No such benchmark '{}'",
            cmd.args[0]
        )));
    }
    Ok(Message::done(format!(
        "Benchmark '{}' set to {}",
        cmd.args[0], value
    )))
}
