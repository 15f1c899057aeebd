//! Durable snapshot of the exchange tree.
//!
//! The tree is persisted as pretty-printed JSON through a rotating triplet
//! `<path>.new` / `<path>` / `<path>.old` so that a crash at any point leaves
//! at least one parseable, consistent file. Loading tries the three names in
//! that order and accepts the first that parses.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::store::records::{ExchangeTree, TreeDoc};

pub struct SnapshotStore {
    path: PathBuf,
    pub tree: Arc<ExchangeTree>,
}

impl SnapshotStore {
    /// Load from disk, falling back to an empty tree when no file parses.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tree = match Self::load_tree(&path) {
            Some(tree) => tree,
            None => {
                warn!("empty exchange snapshot, starting fresh");
                ExchangeTree::default()
            }
        };
        Self {
            path,
            tree: Arc::new(tree),
        }
    }

    fn load_tree(path: &Path) -> Option<ExchangeTree> {
        for extension in [".new", "", ".old"] {
            let candidate = PathBuf::from(format!("{}{}", path.display(), extension));
            match fs::read_to_string(&candidate) {
                Ok(raw) => match serde_json::from_str::<TreeDoc>(&raw) {
                    Ok(doc) => {
                        info!(file = %candidate.display(), "loaded exchange snapshot");
                        return Some(ExchangeTree::from_doc(doc));
                    }
                    Err(e) => {
                        warn!(file = %candidate.display(), "unreadable snapshot: {}", e);
                    }
                },
                Err(_) => continue,
            }
        }
        None
    }

    /// Write the full tree atomically: `.new` first, current copied to
    /// `.old`, then the base file overwritten and `.new` removed. Guards are
    /// taken one sub-tree at a time while serializing, so a save may run
    /// concurrently with session mutation.
    pub fn save(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.tree.to_doc())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let new_path = PathBuf::from(format!("{}.new", self.path.display()));
        let old_path = PathBuf::from(format!("{}.old", self.path.display()));

        if !self.path.exists() {
            fs::write(&self.path, &json)?;
            return Ok(());
        }

        fs::write(&new_path, &json)?;
        let previous = fs::read_to_string(&self.path)?;
        fs::write(&old_path, previous)?;
        fs::write(&self.path, &json)?;
        fs::remove_file(&new_path)?;
        Ok(())
    }

    /// Background autosave timer.
    pub fn spawn_autosave(self: &Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.save() {
                    error!("snapshot save failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{Execution, Side};

    fn snapshot_in(dir: &tempfile::TempDir) -> SnapshotStore {
        SnapshotStore::open(dir.path().join("exchange.json"))
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = snapshot_in(&dir);
        store.tree.add_user("alice", 250.0);
        store.tree.add_asset("XYZ", "EQ", "alice");
        store
            .tree
            .add_order(9, Execution::Limit, "alice", Side::Buy, "XYZ", 3, 12.5);
        store.save().unwrap();

        let reloaded = snapshot_in(&dir);
        assert_eq!(
            reloaded.tree.user("alice").unwrap().with(|u| u.settled.balance),
            250.0
        );
        assert_eq!(reloaded.tree.order(9).unwrap().with(|o| o.size), 3);
    }

    #[test]
    fn test_rotation_keeps_old_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = snapshot_in(&dir);
        store.tree.add_user("alice", 1.0);
        store.save().unwrap();
        store.tree.add_user("bob", 2.0);
        store.save().unwrap();

        let old = fs::read_to_string(dir.path().join("exchange.json.old")).unwrap();
        assert!(old.contains("alice"));
        assert!(!old.contains("bob"));
        assert!(!dir.path().join("exchange.json.new").exists());
    }

    #[test]
    fn test_crash_recovery_prefers_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("exchange.json");
        let store = SnapshotStore::open(&base);
        store.tree.add_user("alice", 42.0);

        // Simulate a crash mid-rotation: a complete .new beside a truncated
        // base file.
        let json = serde_json::to_string(&store.tree.to_doc()).unwrap();
        fs::write(format!("{}.new", base.display()), &json).unwrap();
        fs::write(&base, &json[..json.len() / 2]).unwrap();

        let recovered = SnapshotStore::open(&base);
        assert_eq!(
            recovered.tree.user("alice").unwrap().with(|u| u.settled.balance),
            42.0
        );
    }

    #[test]
    fn test_falls_back_to_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("exchange.json");
        let store = SnapshotStore::open(&base);
        store.tree.add_user("carol", 5.0);
        let json = serde_json::to_string(&store.tree.to_doc()).unwrap();
        fs::write(format!("{}.old", base.display()), &json).unwrap();
        fs::write(&base, "{ not json").unwrap();

        let recovered = SnapshotStore::open(&base);
        assert!(recovered.tree.user("carol").is_some());
    }
}
