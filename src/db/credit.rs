//! Credits, benchmarks and per-coupon history.

use sqlx::{FromRow, SqlitePool};

use crate::utils;

/// Outcome of one coupon period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditState {
    PaidCash,
    PaidCollateral,
    Default,
}

impl CreditState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditState::PaidCash => "CASH",
            CreditState::PaidCollateral => "COLLATERAL",
            CreditState::Default => "DEFAULT",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CreditRow {
    pub id_credit: i64,
    pub creditor: String,
    pub debtor: String,
    pub amount: f64,
    pub amount_due: f64,
    pub start_date: String,
    pub duration: i64,
    pub matured: i64,
    pub frequency: i64,
    pub spread: i64,
    pub collateral: f64,
    pub note: String,
    #[allow(dead_code)]
    pub id_benchmark: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct CreditWithBenchmark {
    #[sqlx(flatten)]
    pub credit: CreditRow,
    pub benchmark_value: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct BenchmarkRow {
    pub id_benchmark: i64,
    pub name: String,
    pub issuer: String,
    pub value: i64,
}

#[derive(Clone)]
pub struct CreditStore {
    pool: SqlitePool,
}

impl CreditStore {
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let pool = super::connect(path).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS Benchmarks (
                id_benchmark INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(16) NOT NULL UNIQUE,
                issuer TEXT NOT NULL,
                value INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS Credits (
                id_credit INTEGER PRIMARY KEY AUTOINCREMENT,
                creditor TEXT NOT NULL,
                debtor TEXT NOT NULL,
                amount REAL NOT NULL,
                amount_due REAL NOT NULL,
                start_date TEXT NOT NULL,
                duration INTEGER NOT NULL,
                matured INTEGER NOT NULL DEFAULT 0,
                frequency INTEGER NOT NULL DEFAULT 7,
                spread INTEGER NOT NULL DEFAULT 1,
                collateral REAL NOT NULL,
                note VARCHAR(255) NOT NULL,
                id_benchmark INTEGER NOT NULL,

                FOREIGN KEY (id_benchmark) REFERENCES Benchmarks(id_benchmark)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS CreditHistory (
                id_instance INTEGER PRIMARY KEY AUTOINCREMENT,
                id_credit INTEGER NOT NULL,
                amount_due REAL NOT NULL,
                state VARCHAR(12) NOT NULL,
                day TEXT NOT NULL,

                FOREIGN KEY (id_credit) REFERENCES Credits(id_credit)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_credit(
        &self,
        creditor: &str,
        debtor: &str,
        amount: f64,
        amount_due: f64,
        duration: i64,
        frequency: i64,
        collateral: f64,
        spread: i64,
        id_benchmark: i64,
        note: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO Credits
                (creditor, debtor, amount, amount_due, start_date, duration,
                 frequency, spread, collateral, id_benchmark, note)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(creditor)
        .bind(debtor)
        .bind(amount)
        .bind(amount_due)
        .bind(utils::today())
        .bind(duration)
        .bind(frequency)
        .bind(spread)
        .bind(collateral)
        .bind(id_benchmark)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_benchmark(
        &self,
        name: &str,
        issuer: &str,
        value: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO Benchmarks (name, issuer, value) VALUES (?, ?, ?)")
            .bind(name)
            .bind(issuer)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn benchmark_by_name(
        &self,
        name: &str,
    ) -> Result<Option<BenchmarkRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM Benchmarks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn set_benchmark(&self, name: &str, value: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE Benchmarks SET value = ? WHERE name = ?")
            .bind(value)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_benchmarks(&self) -> Result<Vec<BenchmarkRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM Benchmarks ORDER BY value ASC")
            .fetch_all(&self.pool)
            .await
    }

    /// Open credits where the given user is a party, newest debtor first.
    pub async fn list_credits(
        &self,
        username: &str,
    ) -> Result<Vec<CreditWithBenchmark>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT a.*, b.value AS benchmark_value
            FROM Credits a
            INNER JOIN Benchmarks b ON a.id_benchmark = b.id_benchmark
            WHERE (creditor = ? OR debtor = ?) AND matured <= duration
            ORDER BY debtor
            "#,
        )
        .bind(username)
        .bind(username)
        .fetch_all(&self.pool)
        .await
    }

    /// Advance the matured-day counter of every open credit by one.
    pub async fn advance_matured(&self) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE Credits SET matured = matured + 1 WHERE matured <= duration")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Credits whose matured counter landed on a coupon boundary.
    pub async fn interest_due(&self) -> Result<Vec<CreditWithBenchmark>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT a.*, b.value AS benchmark_value
            FROM Credits a
            INNER JOIN Benchmarks b ON a.id_benchmark = b.id_benchmark
            WHERE (matured % frequency) = 0 AND matured <= duration
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Credits that reached their full duration.
    pub async fn mature(&self) -> Result<Vec<CreditRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM Credits WHERE matured = duration")
            .fetch_all(&self.pool)
            .await
    }

    /// Take a coupon out of the posted collateral. Returns false when the
    /// collateral cannot cover it.
    pub async fn collateral_call(
        &self,
        id_credit: i64,
        amount_due: f64,
    ) -> Result<bool, sqlx::Error> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT collateral FROM Credits WHERE id_credit = ?")
                .bind(id_credit)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((collateral,)) if collateral >= amount_due => {
                sqlx::query("UPDATE Credits SET collateral = collateral - ? WHERE id_credit = ?")
                    .bind(amount_due)
                    .bind(id_credit)
                    .execute(&self.pool)
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn add_history_instance(
        &self,
        id_credit: i64,
        amount_due: f64,
        state: CreditState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO CreditHistory (id_credit, amount_due, state, day) VALUES (?, ?, ?, ?)",
        )
        .bind(id_credit)
        .bind(amount_due)
        .bind(state.as_str())
        .bind(utils::today())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Undo one day of advancement after a default, so the flow is retried.
    pub async fn rollback_advancement(&self, id_credit: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE Credits SET matured = matured - 1 WHERE id_credit = ?")
            .bind(id_credit)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_names(&self, old_name: &str, new_name: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE Credits SET creditor = ? WHERE creditor = ?")
            .bind(new_name)
            .bind(old_name)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE Credits SET debtor = ? WHERE debtor = ?")
            .bind(new_name)
            .bind(old_name)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE Benchmarks SET issuer = ? WHERE issuer = ?")
            .bind(new_name)
            .bind(old_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
