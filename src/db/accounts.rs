//! Credentials and roles.
//!
//! The dispatcher consumes this store for authentication and role checks;
//! the `passwd`/`emaddr`/`chname`/`addrole`/`rmrole` commands mutate it. A
//! seeded `admin` account (roles `user` + `admin`) exists on first start.

use sqlx::SqlitePool;
use tracing::info;

#[derive(Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let pool = super::connect(path).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_credentials (
                username TEXT NOT NULL UNIQUE,
                email TEXT,
                password TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_roles (
                username TEXT NOT NULL,
                role TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        if !self.exists("admin").await? {
            self.add_user("admin", None, "admin").await?;
            self.add_role("admin", "admin").await?;
            info!("seeded default admin account");
        }
        Ok(())
    }

    /// Create an account with the `user` role. Returns false when the name
    /// is taken.
    pub async fn add_user(
        &self,
        name: &str,
        email: Option<&str>,
        password: &str,
    ) -> Result<bool, sqlx::Error> {
        if self.exists(name).await? {
            return Ok(false);
        }
        sqlx::query("INSERT INTO user_credentials (username, email, password) VALUES (?, ?, ?)")
            .bind(name)
            .bind(email)
            .bind(password)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO user_roles (username, role) VALUES (?, 'user')")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    pub async fn exists(&self, name: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT username FROM user_credentials WHERE username = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn verify(&self, name: &str, password: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT password FROM user_credentials WHERE username = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(row, Some((stored,)) if stored == password))
    }

    pub async fn add_role(&self, name: &str, role: &str) -> Result<(), sqlx::Error> {
        if self.has_role(name, role).await? {
            return Ok(());
        }
        sqlx::query("INSERT INTO user_roles (username, role) VALUES (?, ?)")
            .bind(name)
            .bind(role)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_role(&self, name: &str, role: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM user_roles WHERE username = ? AND role = ?")
            .bind(name)
            .bind(role)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn has_role(&self, name: &str, role: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT role FROM user_roles WHERE username = ? AND role = ?")
                .bind(name)
                .bind(role)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn get_password(&self, name: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT password FROM user_credentials WHERE username = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(p,)| p))
    }

    pub async fn set_password(&self, name: &str, password: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user_credentials SET password = ? WHERE username = ?")
            .bind(password)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_email(&self, name: &str, email: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user_credentials SET email = ? WHERE username = ?")
            .bind(email)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rename_user(&self, old_name: &str, new_name: &str) -> Result<bool, sqlx::Error> {
        if self.exists(new_name).await? {
            return Ok(false);
        }
        sqlx::query("UPDATE user_credentials SET username = ? WHERE username = ?")
            .bind(new_name)
            .bind(old_name)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE user_roles SET username = ? WHERE username = ?")
            .bind(new_name)
            .bind(old_name)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }
}
