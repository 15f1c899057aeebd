//! End-of-session settlement.
//!
//! Five phases, strictly in order: fold intra-session P&L into the settled
//! ledgers (with margin-call auto-buyback of short non-issuer positions),
//! roll every instrument's daily bar, advance the open date, assess credit
//! coupons, and settle matured credits.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::db::credit::{CreditRow, CreditState, CreditWithBenchmark};
use crate::market::types::Side;
use crate::utils::{self, round3};
use crate::AppState;

pub async fn settle(state: &AppState) -> anyhow::Result<()> {
    let open_date = state.tree().open_date();
    info!(%open_date, "running end-of-session settlement");

    fold_positions(state, &open_date).await?;
    roll_assets(state, &open_date).await?;
    state.tree().set_open_date(&utils::today());
    assess_coupons(state).await?;
    settle_maturities(state).await?;

    info!("settlement complete");
    Ok(())
}

/// Phase 1: per user, fold session deltas into the settled ledger, roll the
/// balance, clear the session side, buy back uncovered shorts and append the
/// user-daily history row.
async fn fold_positions(state: &AppState, open_date: &str) -> anyhow::Result<()> {
    // Issuer index taken up front so no asset guard is needed while a user
    // guard is held.
    let issuers: HashMap<String, String> = state
        .tree()
        .tickers()
        .into_iter()
        .filter_map(|ticker| {
            let issuer = state
                .tree()
                .asset(&ticker)
                .map(|a| a.with(|a| a.info.issuer.clone()))?;
            Some((ticker, issuer))
        })
        .collect();

    for username in state.tree().usernames() {
        let Some(user) = state.tree().user(&username) else {
            continue;
        };

        let (balance, assets, margin_calls) = user.with(|u| {
            let deltas = std::mem::take(&mut u.current.assets);
            for (ticker, delta) in deltas {
                let units = u.settled.assets.entry(ticker).or_insert(0);
                *units += delta;
            }
            u.settled.assets.retain(|_, units| *units != 0);

            u.settled.balance = round3(u.settled.balance + u.current.balance);
            u.current.balance = 0.0;

            let margin_calls: Vec<(String, i64)> = u
                .settled
                .assets
                .iter()
                .filter(|(ticker, units)| {
                    **units < 0
                        && issuers
                            .get(*ticker)
                            .map_or(false, |issuer| issuer != "*" && *issuer != username)
                })
                .map(|(ticker, units)| (ticker.clone(), units.abs()))
                .collect();

            (
                u.settled.balance,
                serde_json::to_value(&u.settled.assets).unwrap_or_default(),
                margin_calls,
            )
        });

        for (ticker, quantity) in margin_calls {
            margin_call(state, &ticker, &username, quantity, &issuers);
        }

        state
            .history
            .add_user_daily(&username, open_date, balance, &assets)
            .await?;
    }
    Ok(())
}

/// Forced buyback of a short settled position. The holder's market buy takes
/// whatever asks exist; the unfilled remainder is crossed against a market
/// sell issued on the instrument issuer's behalf, so the buyback always
/// executes through the market-vs-market price fallbacks. The resulting
/// session deltas settle at the next rollover.
fn margin_call(
    state: &AppState,
    ticker: &str,
    username: &str,
    quantity: i64,
    issuers: &HashMap<String, String>,
) {
    let Some(issuer) = issuers.get(ticker) else {
        return;
    };
    state.tree().add_user(issuer, 0.0);

    info!(ticker, user = username, quantity, "margin call");
    let Some(placement) = state
        .market
        .add_market_order(ticker, Side::Buy, quantity, username)
    else {
        warn!(ticker, user = username, "margin call rejected, market closed");
        return;
    };
    let residual = quantity - placement.filled;
    if residual > 0
        && state
            .market
            .add_market_order(ticker, Side::Sell, residual, issuer)
            .is_none()
    {
        warn!(ticker, "margin call cover leg rejected, market closed");
    }
}

/// Phase 2: close out every instrument's session, append the daily bar and
/// prime the next session.
async fn roll_assets(state: &AppState, open_date: &str) -> anyhow::Result<()> {
    for ticker in state.tree().tickers() {
        let Some(asset) = state.tree().asset(&ticker) else {
            continue;
        };
        let bar = asset.with(|a| {
            a.session_data.close = a.immediate.mid;
            let bar = (
                a.session_data.buy_volume,
                a.session_data.sell_volume,
                a.session_data.traded_value,
                a.session_data.open,
                a.session_data.close,
            );

            a.session_data.buy_volume = 0;
            a.session_data.sell_volume = 0;
            a.session_data.traded_value = 0.0;
            a.session_data.open = a.immediate.mid;
            a.session_data.previous_close = a.session_data.close;
            a.session_data.close = None;
            bar
        });

        state
            .history
            .add_asset_daily(&ticker, open_date, bar.0, bar.1, bar.2, bar.3, bar.4)
            .await?;
    }
    Ok(())
}

fn debit_settled(state: &AppState, username: &str, amount: f64) -> bool {
    let Some(user) = state.tree().user(username) else {
        return false;
    };
    user.with(|u| {
        if u.settled.balance < amount {
            return false;
        }
        u.settled.balance = round3(u.settled.balance - amount);
        true
    })
}

fn credit_settled(state: &AppState, username: &str, amount: f64) {
    state.tree().add_user(username, 0.0);
    if let Some(user) = state.tree().user(username) {
        user.with(|u| u.settled.balance = round3(u.settled.balance + amount));
    }
}

/// Phase 4: advance every open credit by one day and assess the coupons that
/// landed on a frequency boundary. Cash first, collateral second, default
/// (with a rollback so the coupon is retried) last.
async fn assess_coupons(state: &AppState) -> anyhow::Result<()> {
    state.credit.advance_matured().await?;

    for row in state.credit.interest_due().await? {
        let CreditWithBenchmark {
            credit,
            benchmark_value,
        } = row;
        let rate_due =
            (benchmark_value + credit.spread) as f64 / 7.0 * credit.frequency as f64 / 10000.0;
        let amount_due = round3(credit.amount * rate_due);

        if amount_due >= 0.0 {
            if debit_settled(state, &credit.debtor, amount_due) {
                credit_settled(state, &credit.creditor, amount_due);
                state
                    .credit
                    .add_history_instance(credit.id_credit, amount_due, CreditState::PaidCash)
                    .await?;
                state
                    .history
                    .add_payment(&credit.debtor, &credit.creditor, amount_due, "credit", "XUD")
                    .await?;
            } else if state
                .credit
                .collateral_call(credit.id_credit, amount_due)
                .await?
            {
                credit_settled(state, &credit.creditor, amount_due);
                state
                    .credit
                    .add_history_instance(
                        credit.id_credit,
                        amount_due,
                        CreditState::PaidCollateral,
                    )
                    .await?;
                state
                    .history
                    .add_payment(&credit.debtor, &credit.creditor, amount_due, "credit", "XUD")
                    .await?;
            } else {
                warn!(credit = credit.id_credit, debtor = %credit.debtor, "coupon default");
                state
                    .credit
                    .add_history_instance(credit.id_credit, amount_due, CreditState::Default)
                    .await?;
                state.credit.rollback_advancement(credit.id_credit).await?;
            }
        } else {
            // Negative coupon: the creditor pays the debtor.
            let amount = -amount_due;
            if debit_settled(state, &credit.creditor, amount) {
                credit_settled(state, &credit.debtor, amount);
                state
                    .credit
                    .add_history_instance(credit.id_credit, amount_due, CreditState::PaidCash)
                    .await?;
                state
                    .history
                    .add_payment(&credit.creditor, &credit.debtor, amount, "credit", "XUD")
                    .await?;
            } else {
                warn!(credit = credit.id_credit, creditor = %credit.creditor, "coupon default");
                state
                    .credit
                    .add_history_instance(credit.id_credit, amount_due, CreditState::Default)
                    .await?;
                state.credit.rollback_advancement(credit.id_credit).await?;
            }
        }
    }
    Ok(())
}

/// Phase 5: settle credits that reached their full duration: debit the final
/// amount due, refund the collateral to the debtor and pay the creditor; a
/// shortfall defaults and rolls the counter back for a retry.
async fn settle_maturities(state: &AppState) -> anyhow::Result<()> {
    for credit in state.credit.mature().await? {
        let CreditRow {
            id_credit,
            creditor,
            debtor,
            amount_due,
            collateral,
            ..
        } = credit;

        if debit_settled(state, &debtor, amount_due) {
            credit_settled(state, &debtor, collateral);
            credit_settled(state, &creditor, amount_due);
            state
                .credit
                .add_history_instance(id_credit, amount_due, CreditState::PaidCash)
                .await?;
            state
                .history
                .add_payment(&debtor, &creditor, amount_due, "credit", "XUD")
                .await?;
            info!(credit = id_credit, "credit matured and settled");
        } else {
            warn!(credit = id_credit, debtor = %debtor, "maturity default");
            state
                .credit
                .add_history_instance(id_credit, amount_due, CreditState::Default)
                .await?;
            state.credit.rollback_advancement(id_credit).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::AppState;

    async fn state_with_market() -> Arc<AppState> {
        let state = crate::test_support::state().await;
        state.tree().add_asset("XYZ", "EQ", "admin");
        state.market.create_market("XYZ");
        state.tree().add_user("A", 1000.0);
        state.tree().add_user("B", 1000.0);
        state
    }

    #[tokio::test]
    async fn test_fold_rolls_current_into_settled() {
        let state = state_with_market().await;
        let open_date = state.tree().open_date();

        let a = state.tree().user("A").unwrap();
        a.with(|u| {
            u.current.balance = -400.0;
            u.current.assets.insert("XYZ".into(), 4);
        });

        settle(&state).await.unwrap();

        a.with(|u| {
            assert_eq!(u.settled.balance, 600.0);
            assert_eq!(u.current.balance, 0.0);
            assert_eq!(u.settled.assets.get("XYZ"), Some(&4));
            assert!(u.current.assets.is_empty());
        });

        let rows = state.history.user_on("A", &open_date).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance, 600.0);
        let assets: serde_json::Value = serde_json::from_str(&rows[0].assets).unwrap();
        assert_eq!(assets["XYZ"], 4);
    }

    #[tokio::test]
    async fn test_fold_drops_zeroed_positions() {
        let state = state_with_market().await;
        let a = state.tree().user("A").unwrap();
        a.with(|u| {
            u.settled.assets.insert("XYZ".into(), 3);
            u.current.assets.insert("XYZ".into(), -3);
        });

        settle(&state).await.unwrap();
        a.with(|u| assert!(u.settled.assets.is_empty()));
    }

    #[tokio::test]
    async fn test_margin_call_buys_back_short() {
        let state = state_with_market().await;
        let b = state.tree().user("B").unwrap();
        b.with(|u| {
            u.current.assets.insert("XYZ".into(), -5);
        });

        settle(&state).await.unwrap();

        // The short folded to settled, then the buyback crossed against the
        // issuer market-vs-market; with no quotes and no previous close the
        // trade prices at zero.
        b.with(|u| {
            assert_eq!(u.settled.assets.get("XYZ"), Some(&-5));
            assert_eq!(u.current.assets.get("XYZ"), Some(&5));
            assert_eq!(u.current.balance, 0.0);
        });
        // Whether the issuer's ledger was folded before or after the call
        // depends on iteration order; the net issuer position is -5 either
        // way.
        let admin = state.tree().user("admin").unwrap();
        admin.with(|u| {
            let net = u.current.assets.get("XYZ").copied().unwrap_or(0)
                + u.settled.assets.get("XYZ").copied().unwrap_or(0);
            assert_eq!(net, -5);
        });
    }

    #[tokio::test]
    async fn test_issuer_short_is_not_margin_called() {
        let state = state_with_market().await;
        let admin = state.tree().user("admin").unwrap();
        admin.with(|u| {
            u.current.assets.insert("XYZ".into(), -7);
        });

        settle(&state).await.unwrap();
        admin.with(|u| {
            assert_eq!(u.settled.assets.get("XYZ"), Some(&-7));
            assert!(u.current.assets.is_empty());
        });
    }

    #[tokio::test]
    async fn test_asset_rollover_writes_daily_bar() {
        let state = state_with_market().await;
        let open_date = state.tree().open_date();
        let asset = state.tree().asset("XYZ").unwrap();
        asset.with(|a| {
            a.immediate.mid = Some(50.0);
            a.session_data.open = Some(48.0);
            a.session_data.buy_volume = 12;
            a.session_data.sell_volume = 9;
            a.session_data.traded_value = 600.0;
        });

        settle(&state).await.unwrap();

        asset.with(|a| {
            assert_eq!(a.session_data.previous_close, Some(50.0));
            assert_eq!(a.session_data.open, Some(50.0));
            assert_eq!(a.session_data.close, None);
            assert_eq!(a.session_data.buy_volume, 0);
            assert_eq!(a.session_data.sell_volume, 0);
            assert_eq!(a.session_data.traded_value, 0.0);
        });

        let bars = state
            .history
            .asset_daily_between("XYZ", &open_date, &open_date)
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, Some(48.0));
        assert_eq!(bars[0].close, Some(50.0));
        assert_eq!(bars[0].buy_volume, 12);
        assert_eq!(bars[0].traded_value, 600.0);
    }

    #[tokio::test]
    async fn test_settlement_advances_open_date() {
        let state = state_with_market().await;
        state.tree().set_open_date("2001-01-01");
        settle(&state).await.unwrap();
        assert_eq!(state.tree().open_date(), utils::today());
    }

    #[tokio::test]
    async fn test_coupons_and_maturity_cash_flow() {
        let state = state_with_market().await;
        state.tree().add_user("bank", 0.0);
        state.credit.add_benchmark("BASE", "admin", 700).await.unwrap();
        let bench = state
            .credit
            .benchmark_by_name("BASE")
            .await
            .unwrap()
            .unwrap()
            .id_benchmark;
        // rate_due per day = (700 + 0) / 7 * 1 / 10000 = 1% of principal.
        state
            .credit
            .add_credit("bank", "A", 100.0, 110.0, 3, 1, 20.0, 0, bench, "loan")
            .await
            .unwrap();

        let a = state.tree().user("A").unwrap();
        let bank = state.tree().user("bank").unwrap();

        settle(&state).await.unwrap();
        assert_eq!(a.with(|u| u.settled.balance), 999.0);
        assert_eq!(bank.with(|u| u.settled.balance), 1.0);

        settle(&state).await.unwrap();
        assert_eq!(a.with(|u| u.settled.balance), 998.0);

        // Third day: final coupon plus maturity (debit 110, refund 20
        // collateral).
        settle(&state).await.unwrap();
        assert_eq!(a.with(|u| u.settled.balance), 997.0 - 110.0 + 20.0);
        assert_eq!(bank.with(|u| u.settled.balance), 3.0 + 110.0);
        assert!(state.credit.mature().await.unwrap().len() == 1);

        // The settled credit drops off the open list on the next advance.
        settle(&state).await.unwrap();
        assert!(state.credit.list_credits("A").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_coupon_falls_back_to_collateral_then_defaults() {
        let state = state_with_market().await;
        state.tree().add_user("bank", 0.0);
        state.tree().add_user("poor", 0.0);
        state.accounts.add_user("poor", None, "pw").await.unwrap();
        state.credit.add_benchmark("BASE", "admin", 700).await.unwrap();
        let bench = state
            .credit
            .benchmark_by_name("BASE")
            .await
            .unwrap()
            .unwrap()
            .id_benchmark;
        state
            .credit
            .add_credit("bank", "poor", 100.0, 110.0, 5, 1, 1.5, 0, bench, "risky")
            .await
            .unwrap();

        let bank = state.tree().user("bank").unwrap();

        // Day 1: no cash, 1.0 taken from collateral.
        settle(&state).await.unwrap();
        assert_eq!(bank.with(|u| u.settled.balance), 1.0);

        // Day 2: collateral exhausted below the coupon, default + rollback.
        settle(&state).await.unwrap();
        assert_eq!(bank.with(|u| u.settled.balance), 1.0);
        let rows = state.credit.list_credits("poor").await.unwrap();
        assert_eq!(rows[0].credit.matured, 1);
        assert_eq!(rows[0].credit.collateral, 0.5);
    }
}

