//! Append-only history tables: intraday ticks, daily bars, user daily rows
//! and payments.

use sqlx::{FromRow, SqlitePool};

use crate::utils;

#[derive(Debug, Clone, FromRow)]
pub struct IntradayRow {
    #[allow(dead_code)]
    pub ticker: String,
    pub day: String,
    pub time: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub mid: Option<f64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DailyRow {
    #[allow(dead_code)]
    pub ticker: String,
    pub day: String,
    pub buy_volume: i64,
    pub sell_volume: i64,
    pub traded_value: f64,
    pub open: Option<f64>,
    pub close: Option<f64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserDailyRow {
    #[allow(dead_code)]
    pub username: String,
    pub day: String,
    pub balance: f64,
    pub assets: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentRow {
    #[allow(dead_code)]
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub currency: String,
    pub day: String,
    pub time: String,
    pub category: Option<String>,
}

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let pool = super::connect(path).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS AssetDaily (
                ticker VARCHAR(32) NOT NULL,
                day TEXT NOT NULL,
                buy_volume INT NOT NULL DEFAULT 0,
                sell_volume INT NOT NULL DEFAULT 0,
                traded_value REAL NOT NULL DEFAULT 0,
                open REAL,
                close REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS AssetIntraday (
                ticker VARCHAR(32) NOT NULL,
                day TEXT NOT NULL,
                time TEXT NOT NULL,
                bid REAL,
                ask REAL,
                mid REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS UserDaily (
                username TEXT NOT NULL,
                day TEXT NOT NULL,
                balance REAL NOT NULL,
                assets TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS Payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                amount REAL NOT NULL,
                currency VARCHAR(32) NOT NULL,
                day TEXT NOT NULL,
                time TEXT NOT NULL,
                category TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_asset_intraday(
        &self,
        ticker: &str,
        day: &str,
        time: &str,
        bid: Option<f64>,
        ask: Option<f64>,
        mid: Option<f64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO AssetIntraday VALUES (?, ?, ?, ?, ?, ?)")
            .bind(ticker)
            .bind(day)
            .bind(time)
            .bind(bid)
            .bind(ask)
            .bind(mid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_asset_daily(
        &self,
        ticker: &str,
        day: &str,
        buy_volume: i64,
        sell_volume: i64,
        traded_value: f64,
        open: Option<f64>,
        close: Option<f64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO AssetDaily VALUES (?, ?, ?, ?, ?, ?, ?)")
            .bind(ticker)
            .bind(day)
            .bind(buy_volume)
            .bind(sell_volume)
            .bind(traded_value)
            .bind(open)
            .bind(close)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_user_daily(
        &self,
        username: &str,
        day: &str,
        balance: f64,
        assets: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO UserDaily VALUES (?, ?, ?, ?)")
            .bind(username)
            .bind(day)
            .bind(balance)
            .bind(assets.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_payment(
        &self,
        sender: &str,
        receiver: &str,
        amount: f64,
        category: &str,
        currency: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO Payments (sender, receiver, amount, currency, day, time, category)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sender)
        .bind(receiver)
        .bind(amount)
        .bind(currency)
        .bind(utils::today())
        .bind(utils::nowtime())
        .bind(category)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn asset_intraday_of(
        &self,
        ticker: &str,
        day: &str,
    ) -> Result<Vec<IntradayRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM AssetIntraday
            WHERE ticker = ? AND day = ?
            ORDER BY time ASC
            "#,
        )
        .bind(ticker)
        .bind(day)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn asset_daily_between(
        &self,
        ticker: &str,
        start_day: &str,
        end_day: &str,
    ) -> Result<Vec<DailyRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM AssetDaily
            WHERE ticker = ? AND date(day) BETWEEN ? AND ?
            ORDER BY day ASC
            "#,
        )
        .bind(ticker)
        .bind(start_day)
        .bind(end_day)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn asset_daily_all(&self, ticker: &str) -> Result<Vec<DailyRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM AssetDaily WHERE ticker = ? ORDER BY day ASC")
            .bind(ticker)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn user_on(
        &self,
        username: &str,
        day: &str,
    ) -> Result<Vec<UserDailyRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM UserDaily WHERE username = ? AND day = ?")
            .bind(username)
            .bind(day)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn user_between(
        &self,
        username: &str,
        start_day: &str,
        end_day: &str,
    ) -> Result<Vec<UserDailyRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM UserDaily
            WHERE username = ? AND date(day) BETWEEN ? AND ?
            ORDER BY day ASC
            "#,
        )
        .bind(username)
        .bind(start_day)
        .bind(end_day)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn payments_between(
        &self,
        username: &str,
        start_day: &str,
        end_day: &str,
    ) -> Result<Vec<PaymentRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM Payments
            WHERE (sender = ? OR receiver = ?) AND date(day) BETWEEN ? AND ?
            ORDER BY day ASC, time ASC
            "#,
        )
        .bind(username)
        .bind(username)
        .bind(start_day)
        .bind(end_day)
        .fetch_all(&self.pool)
        .await
    }

    /// Rewrite a renamed ticker across the bar tables and the encoded asset
    /// maps of the user rows.
    pub async fn update_ticker(
        &self,
        old_ticker: &str,
        new_ticker: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE AssetIntraday SET ticker = ? WHERE ticker = ?")
            .bind(new_ticker)
            .bind(old_ticker)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE AssetDaily SET ticker = ? WHERE ticker = ?")
            .bind(new_ticker)
            .bind(old_ticker)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE UserDaily SET assets = REPLACE(assets, ?, ?) WHERE assets LIKE ?")
            .bind(format!("\"{}\"", old_ticker))
            .bind(format!("\"{}\"", new_ticker))
            .bind(format!("%\"{}\":%", old_ticker))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> HistoryStore {
        HistoryStore::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_intraday_rows_ordered_by_time() {
        let history = store().await;
        history
            .add_asset_intraday("XYZ", "2026-08-01", "10:10:00", Some(99.0), Some(101.0), Some(100.0))
            .await
            .unwrap();
        history
            .add_asset_intraday("XYZ", "2026-08-01", "10:00:00", Some(98.0), Some(100.0), Some(99.0))
            .await
            .unwrap();

        let rows = history.asset_intraday_of("XYZ", "2026-08-01").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time, "10:00:00");
        assert_eq!(rows[1].mid, Some(100.0));
    }

    #[tokio::test]
    async fn test_daily_range_query() {
        let history = store().await;
        for day in ["2026-07-30", "2026-07-31", "2026-08-01"] {
            history
                .add_asset_daily("XYZ", day, 10, 5, 1500.0, Some(99.0), Some(101.0))
                .await
                .unwrap();
        }
        let rows = history
            .asset_daily_between("XYZ", "2026-07-31", "2026-08-01")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].day, "2026-07-31");
    }

    #[tokio::test]
    async fn test_user_daily_roundtrip() {
        let history = store().await;
        let assets = serde_json::json!({"XYZ": 4});
        history
            .add_user_daily("alice", "2026-08-01", 600.0, &assets)
            .await
            .unwrap();
        let rows = history.user_on("alice", "2026-08-01").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance, 600.0);
        let decoded: serde_json::Value = serde_json::from_str(&rows[0].assets).unwrap();
        assert_eq!(decoded["XYZ"], 4);
    }

    #[tokio::test]
    async fn test_payments_query_matches_either_party() {
        let history = store().await;
        history
            .add_payment("alice", "bob", 25.0, "payment", "XUD")
            .await
            .unwrap();
        let today = utils::today();
        let for_bob = history
            .payments_between("bob", &today, &today)
            .await
            .unwrap();
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].sender, "alice");
        assert_eq!(for_bob[0].category.as_deref(), Some("payment"));
    }

    #[tokio::test]
    async fn test_update_ticker_rewrites_user_assets() {
        let history = store().await;
        history
            .add_asset_daily("OLD", "2026-08-01", 1, 1, 10.0, None, None)
            .await
            .unwrap();
        history
            .add_user_daily("alice", "2026-08-01", 5.0, &serde_json::json!({"OLD": 2}))
            .await
            .unwrap();

        history.update_ticker("OLD", "NEW").await.unwrap();
        assert_eq!(history.asset_daily_all("NEW").await.unwrap().len(), 1);
        let rows = history.user_on("alice", "2026-08-01").await.unwrap();
        assert!(rows[0].assets.contains("\"NEW\""));
    }
}
