//! Command tables.
//!
//! Handlers are plain async functions registered in static tables with a
//! canonical name, aliases and an arity descriptor. The session dispatcher
//! picks the table from the command sigil and the issuer's roles.

pub mod admin;
pub mod backend;
pub mod user;

use crate::command::{Arity, CommandSpec, CommandTable};

macro_rules! command {
    ($name:literal, $aliases:expr, $arity:expr, $handler:path) => {
        CommandSpec {
            name: $name,
            aliases: $aliases,
            arity: $arity,
            handler: |state, cmd| Box::pin($handler(state, cmd)),
        }
    };
}

pub fn user_table() -> CommandTable {
    CommandTable::new(vec![
        command!("whoami", &[], Arity::Exact(0), user::whoami),
        command!("balance", &["bal"], Arity::Exact(0), user::balance),
        command!("market", &["mm"], Arity::Exact(0), user::market),
        command!("today", &["tt"], Arity::Exact(1), user::today),
        command!("todayspread", &["tsp"], Arity::Exact(1), user::today_spread),
        command!("intraday", &["ii"], Arity::Exact(4), user::intraday),
        command!(
            "intradayspread",
            &["isp"],
            Arity::Exact(4),
            user::intraday_spread
        ),
        command!("daily", &["dd"], Arity::Exact(1), user::daily),
        command!("depth", &["dp"], Arity::Exact(1), user::depth),
        command!("selllimit", &["sl"], Arity::Exact(3), user::sell_limit),
        command!("sellmarket", &["sm"], Arity::Exact(2), user::sell_market),
        command!("buylimit", &["bl"], Arity::Exact(3), user::buy_limit),
        command!("buymarket", &["bm"], Arity::Exact(2), user::buy_market),
        command!("orders", &["op"], Arity::Exact(0), user::pending_orders),
        command!("deleteorder", &["do"], Arity::Exact(1), user::delete_order),
        command!("clearorders", &["co"], Arity::Exact(1), user::clear_orders),
        command!("positions", &["ps"], Arity::Exact(0), user::positions),
        command!(
            "marketposition",
            &["mp"],
            Arity::Exact(0),
            user::market_position
        ),
        command!("pay", &["pp"], Arity::Exact(2), user::pay),
        command!("transfer", &["tr"], Arity::Exact(3), user::transfer),
        command!("passwd", &["changepassword"], Arity::Exact(2), user::change_password),
        command!("emaddr", &[], Arity::Exact(1), user::email_address),
        command!("chname", &[], Arity::Exact(1), user::change_name),
        command!("json", &[], Arity::AtLeast(0), user::json_path),
        command!("query", &[], Arity::AtLeast(1), user::query),
        command!("credits", &["cr"], Arity::Exact(0), user::credits),
        command!("benchmarks", &["bb"], Arity::Exact(0), user::benchmarks),
    ])
}

pub fn admin_table() -> CommandTable {
    CommandTable::new(vec![
        command!("stop", &[], Arity::Exact(0), admin::stop),
        command!("setbal", &[], Arity::Exact(2), admin::set_balance),
        command!("addbal", &[], Arity::Exact(2), admin::add_balance),
        command!("addticker", &[], Arity::Exact(2), admin::add_ticker),
        command!("setticker", &[], Arity::Exact(5), admin::set_ticker),
        command!("rmticker", &[], Arity::Exact(1), admin::remove_ticker),
        command!("chticker", &[], Arity::Exact(2), admin::change_ticker),
        command!("newsession", &[], Arity::Exact(0), admin::new_session),
        command!("addrole", &[], Arity::Exact(2), admin::add_role),
        command!("rmrole", &[], Arity::Exact(2), admin::remove_role),
        command!("newsupdate", &[], Arity::Exact(0), admin::news_update),
        command!("newcredit", &[], Arity::Exact(10), admin::new_credit),
        command!("newbenchmark", &[], Arity::Exact(3), admin::new_benchmark),
        command!("setbenchmark", &[], Arity::Exact(2), admin::set_benchmark),
    ])
}
