//! The live exchange tree.
//!
//! Users by name, assets by ticker, the inverted class index, order rows by
//! ID and the session open date. Entity leaves are [`Guarded`] cells shared
//! behind `Arc`, the name maps are concurrent, and the whole tree serializes
//! to the snapshot JSON document (guard sentinels included).

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::market::types::{Execution, Side};
use crate::store::guard::Guarded;
use crate::utils;

// ============================================================================
// Records
// ============================================================================

/// One side of a user ledger: a cash balance plus per-ticker unit counts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerSide {
    pub balance: f64,
    pub assets: BTreeMap<String, i64>,
}

/// A user ledger. `settled` survives sessions; `current` is the intra-session
/// P&L folded into `settled` at settlement. `orders` lists the user's open
/// order IDs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserRecord {
    pub settled: LedgerSide,
    pub current: LedgerSide,
    pub orders: Vec<u64>,
}

impl UserRecord {
    pub fn with_balance(balance: f64) -> Self {
        Self {
            settled: LedgerSide {
                balance,
                assets: BTreeMap::new(),
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssetInfo {
    pub class: String,
    pub issuer: String,
}

/// Aggregate resting size per price level, per side.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DepthMap {
    pub bids: BTreeMap<String, i64>,
    pub offers: BTreeMap<String, i64>,
}

impl DepthMap {
    pub fn side_mut(&mut self, side: Side) -> &mut BTreeMap<String, i64> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.offers,
        }
    }

    pub fn add(&mut self, side: Side, price: f64, size: i64) {
        *self.side_mut(side).entry(utils::price_key(price)).or_insert(0) += size;
    }

    pub fn subtract(&mut self, side: Side, price: f64, size: i64) {
        let key = utils::price_key(price);
        let levels = self.side_mut(side);
        if let Some(level) = levels.get_mut(&key) {
            *level -= size;
            if *level <= 0 {
                levels.remove(&key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.offers.clear();
    }
}

/// Live quote state for an instrument.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuoteState {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub mid: Option<f64>,
    pub last_bid: Option<f64>,
    pub last_ask: Option<f64>,
    pub bid_volume: Option<i64>,
    pub ask_volume: Option<i64>,
    pub depth: DepthMap,
}

/// Per-session accumulators, rolled into a daily bar at settlement.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub buy_volume: i64,
    pub sell_volume: i64,
    pub traded_value: f64,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub previous_close: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub info: AssetInfo,
    pub immediate: QuoteState,
    pub session_data: SessionData,
}

impl AssetRecord {
    pub fn new(class: &str, issuer: &str) -> Self {
        Self {
            info: AssetInfo {
                class: class.to_string(),
                issuer: issuer.to_string(),
            },
            ..Default::default()
        }
    }
}

/// The persisted order row. The live [`crate::market::types::Order`] carries
/// the matching state; this row is the durable ground truth replayed on
/// startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub execution: Execution,
    pub ticker: String,
    pub issuer: String,
    pub side: Side,
    pub size: i64,
    /// Market-buy rows carry the +inf sentinel, which JSON cannot encode;
    /// it round-trips through null.
    #[serde(with = "nullable_price")]
    pub price: f64,
}

mod nullable_price {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(price: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if price.is_finite() {
            serializer.serialize_some(price)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

// ============================================================================
// Tree
// ============================================================================

pub struct ExchangeTree {
    pub users: DashMap<String, Arc<Guarded<UserRecord>>>,
    pub assets: DashMap<String, Arc<Guarded<AssetRecord>>>,
    pub classes: DashMap<String, Vec<String>>,
    pub orders: DashMap<u64, Arc<Guarded<OrderRecord>>>,
    open_date: RwLock<String>,
}

/// Serialized shape of the tree, matching the snapshot JSON layout.
#[derive(Serialize, Deserialize)]
pub struct TreeDoc {
    #[serde(rename = "usersByName")]
    pub users: BTreeMap<String, Arc<Guarded<UserRecord>>>,
    #[serde(rename = "assetsByTicker")]
    pub assets: BTreeMap<String, Arc<Guarded<AssetRecord>>>,
    #[serde(rename = "assetsByClass")]
    pub classes: BTreeMap<String, Vec<String>>,
    #[serde(rename = "ordersById")]
    pub orders: BTreeMap<u64, Arc<Guarded<OrderRecord>>>,
    #[serde(rename = "openDate")]
    pub open_date: String,
}

impl Default for ExchangeTree {
    fn default() -> Self {
        Self {
            users: DashMap::new(),
            assets: DashMap::new(),
            classes: DashMap::new(),
            orders: DashMap::new(),
            open_date: RwLock::new(utils::today()),
        }
    }
}

impl ExchangeTree {
    pub fn from_doc(doc: TreeDoc) -> Self {
        let tree = Self {
            users: doc.users.into_iter().collect(),
            assets: doc.assets.into_iter().collect(),
            classes: doc.classes.into_iter().collect(),
            orders: doc.orders.into_iter().collect(),
            open_date: RwLock::new(doc.open_date),
        };
        if tree.open_date.read().is_empty() {
            *tree.open_date.write() = utils::today();
        }
        tree
    }

    /// Snapshot view for serialization. Cloning the `Arc`s is cheap; each
    /// guard is taken only while its own sub-tree is serialized.
    pub fn to_doc(&self) -> TreeDoc {
        TreeDoc {
            users: self
                .users
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            assets: self
                .assets
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            classes: self
                .classes
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            orders: self
                .orders
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            open_date: self.open_date.read().clone(),
        }
    }

    /// Full-tree JSON projection, used by the `json` command. Guards are
    /// taken one at a time by the serializer.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self.to_doc()).unwrap_or(serde_json::Value::Null)
    }

    pub fn open_date(&self) -> String {
        self.open_date.read().clone()
    }

    pub fn set_open_date(&self, date: &str) {
        *self.open_date.write() = date.to_string();
    }

    /// Create a user ledger if absent. Returns false when the name is taken.
    pub fn add_user(&self, username: &str, balance: f64) -> bool {
        if self.users.contains_key(username) {
            return false;
        }
        self.users.insert(
            username.to_string(),
            Arc::new(Guarded::new(UserRecord::with_balance(balance))),
        );
        true
    }

    pub fn user(&self, username: &str) -> Option<Arc<Guarded<UserRecord>>> {
        self.users.get(username).map(|e| e.value().clone())
    }

    /// Create an instrument and index it under its class. Returns false when
    /// the ticker is taken.
    pub fn add_asset(&self, ticker: &str, class: &str, issuer: &str) -> bool {
        if self.assets.contains_key(ticker) {
            return false;
        }
        self.assets.insert(
            ticker.to_string(),
            Arc::new(Guarded::new(AssetRecord::new(class, issuer))),
        );
        self.classes
            .entry(class.to_string())
            .or_default()
            .push(ticker.to_string());
        true
    }

    pub fn asset(&self, ticker: &str) -> Option<Arc<Guarded<AssetRecord>>> {
        self.assets.get(ticker).map(|e| e.value().clone())
    }

    /// Drop an instrument from both indices, returning its record.
    pub fn remove_asset(&self, ticker: &str) -> Option<Arc<Guarded<AssetRecord>>> {
        let (_, asset) = self.assets.remove(ticker)?;
        let class = asset.with(|a| a.info.class.clone());
        if let Some(mut tickers) = self.classes.get_mut(&class) {
            tickers.retain(|t| t != ticker);
            let emptied = tickers.is_empty();
            drop(tickers);
            if emptied {
                self.classes.remove(&class);
            }
        }
        Some(asset)
    }

    pub fn add_order(
        &self,
        order_id: u64,
        execution: Execution,
        issuer: &str,
        side: Side,
        ticker: &str,
        size: i64,
        price: f64,
    ) -> bool {
        if self.orders.contains_key(&order_id) {
            return false;
        }
        self.orders.insert(
            order_id,
            Arc::new(Guarded::new(OrderRecord {
                execution,
                ticker: ticker.to_string(),
                issuer: issuer.to_string(),
                side,
                size,
                price,
            })),
        );
        true
    }

    pub fn order(&self, order_id: u64) -> Option<Arc<Guarded<OrderRecord>>> {
        self.orders.get(&order_id).map(|e| e.value().clone())
    }

    pub fn update_order(&self, order_id: u64, size: i64) {
        if let Some(order) = self.order(order_id) {
            order.with(|o| o.size = size);
        }
    }

    pub fn remove_order(&self, order_id: u64) {
        self.orders.remove(&order_id);
    }

    /// Issuer test; the special issuer `*` means any holder counts as issuer.
    pub fn user_is_issuer(&self, username: &str, asset: &AssetRecord) -> bool {
        asset.info.issuer == username || asset.info.issuer == "*"
    }

    pub fn usernames(&self) -> Vec<String> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    pub fn tickers(&self) -> Vec<String> {
        self.assets.iter().map(|e| e.key().clone()).collect()
    }

    pub fn classes_sorted(&self) -> Vec<(String, Vec<String>)> {
        let mut classes: Vec<(String, Vec<String>)> = self
            .classes
            .iter()
            .map(|e| {
                let mut tickers = e.value().clone();
                tickers.sort();
                (e.key().clone(), tickers)
            })
            .collect();
        classes.sort_by(|a, b| a.0.cmp(&b.0));
        classes
    }

    /// Move a user to a new name, rewriting order rows issued under the old
    /// one. Returns false when the target name is taken or the source is
    /// missing.
    pub fn rename_user(&self, old_name: &str, new_name: &str) -> bool {
        if self.users.contains_key(new_name) {
            return false;
        }
        let Some((_, record)) = self.users.remove(old_name) else {
            return false;
        };
        self.users.insert(new_name.to_string(), record);
        for order in self.orders.iter() {
            order.value().with(|o| {
                if o.issuer == old_name {
                    o.issuer = new_name.to_string();
                }
            });
        }
        for asset in self.assets.iter() {
            asset.value().with(|a| {
                if a.info.issuer == old_name {
                    a.info.issuer = new_name.to_string();
                }
            });
        }
        true
    }

    /// Move an instrument to a new ticker, rewriting the class index and
    /// order rows. Returns false when the target exists or the source is
    /// missing.
    pub fn rename_asset(&self, old_ticker: &str, new_ticker: &str) -> bool {
        if self.assets.contains_key(new_ticker) {
            return false;
        }
        let Some((_, record)) = self.assets.remove(old_ticker) else {
            return false;
        };
        let class = record.with(|a| a.info.class.clone());
        self.assets.insert(new_ticker.to_string(), record);
        if let Some(mut tickers) = self.classes.get_mut(&class) {
            for ticker in tickers.iter_mut() {
                if ticker == old_ticker {
                    *ticker = new_ticker.to_string();
                }
            }
        }
        for order in self.orders.iter() {
            order.value().with(|o| {
                if o.ticker == old_ticker {
                    o.ticker = new_ticker.to_string();
                }
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_user_once() {
        let tree = ExchangeTree::default();
        assert!(tree.add_user("alice", 100.0));
        assert!(!tree.add_user("alice", 50.0));
        let user = tree.user("alice").unwrap();
        assert_eq!(user.with(|u| u.settled.balance), 100.0);
    }

    #[test]
    fn test_class_index_follows_assets() {
        let tree = ExchangeTree::default();
        assert!(tree.add_asset("XYZ", "EQ", "admin"));
        assert!(tree.add_asset("ABC", "EQ", "admin"));
        let classes = tree.classes_sorted();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].1, vec!["ABC".to_string(), "XYZ".to_string()]);

        tree.remove_asset("ABC");
        assert_eq!(tree.classes_sorted()[0].1, vec!["XYZ".to_string()]);
        tree.remove_asset("XYZ");
        assert!(tree.classes_sorted().is_empty());
    }

    #[test]
    fn test_depth_map_drops_empty_levels() {
        let mut depth = DepthMap::default();
        depth.add(Side::Buy, 100.0, 10);
        depth.subtract(Side::Buy, 100.0, 4);
        assert_eq!(depth.bids.get("100"), Some(&6));
        depth.subtract(Side::Buy, 100.0, 6);
        assert!(depth.bids.is_empty());
    }

    #[test]
    fn test_doc_roundtrip() {
        let tree = ExchangeTree::default();
        tree.add_user("bob", 7.0);
        tree.add_asset("XYZ", "EQ", "bob");
        tree.add_order(3, Execution::Limit, "bob", Side::Buy, "XYZ", 5, 10.0);
        tree.set_open_date("2026-01-02");

        let json = serde_json::to_string(&tree.to_doc()).unwrap();
        let doc: TreeDoc = serde_json::from_str(&json).unwrap();
        let restored = ExchangeTree::from_doc(doc);

        assert_eq!(restored.open_date(), "2026-01-02");
        assert_eq!(
            restored.user("bob").unwrap().with(|u| u.settled.balance),
            7.0
        );
        let order = restored.order(3).unwrap();
        assert_eq!(order.with(|o| o.size), 5);
        assert_eq!(order.with(|o| o.ticker.clone()), "XYZ");
    }

    #[test]
    fn test_rename_asset_rewrites_orders() {
        let tree = ExchangeTree::default();
        tree.add_asset("OLD", "EQ", "admin");
        tree.add_order(1, Execution::Limit, "admin", Side::Sell, "OLD", 2, 5.0);
        assert!(tree.rename_asset("OLD", "NEW"));
        assert!(tree.asset("NEW").is_some());
        assert!(tree.asset("OLD").is_none());
        assert_eq!(tree.order(1).unwrap().with(|o| o.ticker.clone()), "NEW");
        assert_eq!(tree.classes_sorted()[0].1, vec!["NEW".to_string()]);
    }
}
