//! Wall-clock scheduler (Europe/Rome).
//!
//! Quote snapshots every ten minutes, settlement at midnight, the outbound
//! digest at noon. A missed settlement is caught up at startup by comparing
//! the persisted open date with today. Tick failures are logged and retried
//! on the next boundary, never fatal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use chrono_tz::Europe::Rome;
use tracing::{error, info};

use crate::services::settlement;
use crate::utils;
use crate::AppState;

pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if state.tree().open_date() != utils::today() {
            info!("open date is stale, settling before arming timers");
            if let Err(e) = settlement::settle(&state).await {
                error!("startup settlement failed: {}", e);
            }
        }

        let mut last_minute = String::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(20));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().with_timezone(&Rome);
            let minute_key = now.format("%Y-%m-%d %H:%M").to_string();
            if minute_key == last_minute {
                continue;
            }
            last_minute = minute_key;

            if now.minute() % 10 == 0 {
                if let Err(e) = intraday_snapshot(&state).await {
                    error!("intraday snapshot failed: {}", e);
                }
            }
            if now.hour() == 0 && now.minute() == 0 {
                if let Err(e) = settlement::settle(&state).await {
                    error!("scheduled settlement failed: {}", e);
                }
            }
            if now.hour() == 12 && now.minute() == 0 {
                state.digest.send(state.tree());
            }
        }
    })
}

/// Record every instrument's immediate quote into the intraday table.
async fn intraday_snapshot(state: &AppState) -> anyhow::Result<()> {
    let day = utils::today();
    let time = utils::nowtime();
    for ticker in state.tree().tickers() {
        let Some(asset) = state.tree().asset(&ticker) else {
            continue;
        };
        let (bid, ask, mid) =
            asset.with(|a| (a.immediate.bid, a.immediate.ask, a.immediate.mid));
        state
            .history
            .add_asset_intraday(&ticker, &day, &time, bid, ask, mid)
            .await?;
    }
    Ok(())
}
