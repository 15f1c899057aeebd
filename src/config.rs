//! Application configuration.
//!
//! Loaded from an optional `bourse.toml` file with `BOURSE_*` environment
//! overrides on top of built-in defaults.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// TCP listen port for the framed session protocol.
    pub port: u16,
    /// Base path of the exchange snapshot triplet (`<path>.new` / `<path>` / `<path>.old`).
    pub snapshot_path: String,
    /// SQLite file holding credentials and roles.
    pub accounts_db_path: String,
    /// SQLite file holding intraday/daily bars, user history and payments.
    pub history_db_path: String,
    /// SQLite file holding credits, benchmarks and coupon history.
    pub credit_db_path: String,
    /// Snapshot autosave period in seconds.
    pub snapshot_interval_secs: u64,
    /// Sender identity for the outbound daily digest, if configured.
    pub digest_sender: Option<String>,
    /// Credential for the digest sender.
    pub digest_password: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("port", 19055)?
            .set_default("snapshot_path", "exchange.json")?
            .set_default("accounts_db_path", "accounts.db")?
            .set_default("history_db_path", "history.db")?
            .set_default("credit_db_path", "credit.db")?
            .set_default("snapshot_interval_secs", 15)?
            .add_source(File::with_name("bourse").required(false))
            .add_source(Environment::with_prefix("BOURSE"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::load().expect("defaults must load");
        assert_eq!(config.port, 19055);
        assert_eq!(config.snapshot_interval_secs, 15);
        assert!(config.digest_sender.is_none());
    }
}
