//! SQLite-backed stores.
//!
//! Each store owns a pool capped at a single connection, so every read and
//! write to its file goes through one serialized queue and callers simply
//! await completion.

pub mod accounts;
pub mod credit;
pub mod history;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub use accounts::AccountStore;
pub use credit::CreditStore;
pub use history::HistoryStore;

pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}
