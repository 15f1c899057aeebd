use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod command;
mod config;
mod db;
mod handlers;
mod market;
mod net;
mod services;
mod store;
mod utils;

use crate::command::CommandTable;
use crate::config::AppConfig;
use crate::db::{AccountStore, CreditStore, HistoryStore};
use crate::market::GlobalMarket;
use crate::services::digest::DailyDigest;
use crate::store::records::ExchangeTree;
use crate::store::SnapshotStore;

pub struct AppState {
    pub config: AppConfig,
    pub snapshot: Arc<SnapshotStore>,
    pub accounts: AccountStore,
    pub history: HistoryStore,
    pub credit: CreditStore,
    pub market: Arc<GlobalMarket>,
    pub digest: DailyDigest,
    pub user_commands: CommandTable,
    pub admin_commands: CommandTable,
    pub shutdown: Notify,
}

impl AppState {
    pub async fn build(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let snapshot = Arc::new(SnapshotStore::open(&config.snapshot_path));
        let accounts = AccountStore::open(&config.accounts_db_path).await?;
        let history = HistoryStore::open(&config.history_db_path).await?;
        let credit = CreditStore::open(&config.credit_db_path).await?;

        // The admin ledger always exists: issuer of default instruments and
        // counterparty of administrative flows.
        snapshot.tree.add_user("admin", 0.0);

        let market = GlobalMarket::new(Arc::clone(&snapshot.tree));
        market.bootstrap();

        let digest = DailyDigest::new(&config);

        Ok(Arc::new(Self {
            config,
            snapshot,
            accounts,
            history,
            credit,
            market,
            digest,
            user_commands: handlers::user_table(),
            admin_commands: handlers::admin_table(),
            shutdown: Notify::new(),
        }))
    }

    pub fn tree(&self) -> &Arc<ExchangeTree> {
        self.market.tree()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bourse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting bourse v{}", env!("CARGO_PKG_VERSION"));

    let state = AppState::build(config.clone()).await?;
    tracing::info!(
        users = state.tree().users.len(),
        assets = state.tree().assets.len(),
        "exchange state loaded"
    );

    let autosave = state.snapshot.spawn_autosave(config.snapshot_interval_secs);
    let scheduler = services::scheduler::spawn(Arc::clone(&state));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "listening for sessions");
    let acceptor = tokio::spawn(net::session::serve(listener, Arc::clone(&state)));

    state.shutdown.notified().await;
    tracing::info!("shutting down");

    // Grace period so in-flight replies drain before the sockets die.
    tokio::time::sleep(Duration::from_millis(500)).await;
    acceptor.abort();
    scheduler.abort();
    autosave.abort();

    state.snapshot.save()?;
    tracing::info!("final snapshot saved");
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// An app state over throwaway storage: in-memory SQLite files and a
    /// snapshot path inside a leaked temp directory.
    pub async fn state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            port: 0,
            snapshot_path: dir
                .path()
                .join("exchange.json")
                .to_string_lossy()
                .into_owned(),
            accounts_db_path: ":memory:".into(),
            history_db_path: ":memory:".into(),
            credit_db_path: ":memory:".into(),
            snapshot_interval_secs: 15,
            digest_sender: None,
            digest_password: None,
        };
        std::mem::forget(dir);
        AppState::build(config).await.unwrap()
    }
}
