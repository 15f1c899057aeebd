//! Global order registry.
//!
//! The singleton map of market managers, the live order map, and the
//! monotonic order-ID allocator. On startup the registry rebuilds every book
//! from the persisted order rows: the rows are the durable ground truth, the
//! books are derived state.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::market::manager::MarketManager;
use crate::market::types::{Execution, OrderRef, Placement, Side};
use crate::store::guard::Guarded;
use crate::store::records::{ExchangeTree, OrderRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("no such order")]
    NotFound,
    #[error("permission denied")]
    NotOwner,
}

impl CancelError {
    pub fn errno(&self) -> i64 {
        match self {
            CancelError::NotFound => -1,
            CancelError::NotOwner => -2,
        }
    }
}

#[derive(Default)]
struct OrderIndex {
    index: u64,
}

impl OrderIndex {
    fn next(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn set(&mut self, index: u64) {
        self.index = index;
    }
}

pub struct GlobalMarket {
    markets: DashMap<String, Arc<MarketManager>>,
    orders: DashMap<u64, OrderRef>,
    order_index: Guarded<OrderIndex>,
    ready: AtomicBool,
    tree: Arc<ExchangeTree>,
}

impl GlobalMarket {
    pub fn new(tree: Arc<ExchangeTree>) -> Arc<Self> {
        Arc::new(Self {
            markets: DashMap::new(),
            orders: DashMap::new(),
            order_index: Guarded::new(OrderIndex::default()),
            ready: AtomicBool::new(false),
            tree,
        })
    }

    pub fn tree(&self) -> &Arc<ExchangeTree> {
        &self.tree
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Rebuild books and derived state from the snapshot: reset every
    /// depth map, create the managers, then replay the persisted order rows
    /// in ascending ID order with the allocator pinned so each order keeps
    /// its ID. Ends with the allocator at the highest seen ID.
    pub fn bootstrap(&self) {
        for ticker in self.tree.tickers() {
            if let Some(asset) = self.tree.asset(&ticker) {
                asset.with(|a| a.immediate.depth.clear());
            }
            self.create_market(&ticker);
        }

        let mut rows: Vec<(u64, OrderRecord)> = self
            .tree
            .orders
            .iter()
            .map(|e| (*e.key(), e.value().with(|o| o.clone())))
            .collect();
        rows.sort_by_key(|(id, _)| *id);

        let mut final_id = 0;
        for (order_id, row) in rows {
            final_id = final_id.max(order_id);
            self.order_index.with(|oi| oi.set(order_id.saturating_sub(1)));
            let placement = match row.execution {
                Execution::Limit => self.add_limit_order(
                    &row.ticker,
                    row.side,
                    row.price,
                    row.size,
                    &row.issuer,
                ),
                Execution::Market => {
                    self.add_market_order(&row.ticker, row.side, row.size, &row.issuer)
                }
            };
            if placement.is_none() {
                warn!(order_id, ticker = %row.ticker, "failed to replay order");
            }
        }

        self.order_index.with(|oi| oi.set(final_id));
        self.ready.store(true, Ordering::SeqCst);
        info!(
            orders = self.orders.len(),
            markets = self.markets.len(),
            "order registry ready"
        );
    }

    pub fn next_order_id(&self) -> u64 {
        self.order_index.with(|oi| oi.next())
    }

    pub fn market(&self, ticker: &str) -> Option<Arc<MarketManager>> {
        self.markets.get(ticker).map(|e| e.value().clone())
    }

    pub fn create_market(&self, ticker: &str) -> Arc<MarketManager> {
        self.markets
            .entry(ticker.to_string())
            .or_insert_with(|| Arc::new(MarketManager::new(ticker)))
            .value()
            .clone()
    }

    pub fn order(&self, order_id: u64) -> Option<OrderRef> {
        self.orders.get(&order_id).map(|e| e.value().clone())
    }

    pub fn add_limit_order(
        &self,
        ticker: &str,
        side: Side,
        price: f64,
        size: i64,
        issuer: &str,
    ) -> Option<Placement> {
        self.create_market(ticker)
            .add_limit_order(self, side, size, price, issuer)
    }

    pub fn add_market_order(
        &self,
        ticker: &str,
        side: Side,
        size: i64,
        issuer: &str,
    ) -> Option<Placement> {
        self.create_market(ticker)
            .add_market_order(self, side, size, issuer)
    }

    /// Cancel with ownership check: `NotFound` when the ID is unknown or
    /// already off the book, `NotOwner` when the caller did not place it.
    pub fn cancel_order(&self, order_id: u64, issuer: &str) -> Result<(), CancelError> {
        let order = self.order(order_id).ok_or(CancelError::NotFound)?;
        if order.with(|o| o.issuer.clone()) != issuer {
            return Err(CancelError::NotOwner);
        }
        let ticker = order.with(|o| o.ticker.clone());
        let market = self.market(&ticker).ok_or(CancelError::NotFound)?;
        if !market.cancel(self, &order) {
            return Err(CancelError::NotFound);
        }
        self.remove_order(order_id);
        Ok(())
    }

    /// Install a live order. Once the registry is ready, the order also gets
    /// a durable row and an entry in its issuer's open-order list; during
    /// replay both already exist.
    pub fn register_order(&self, ticker: &str, order_ref: &OrderRef) {
        let (order_id, execution, issuer, side, size, price) = order_ref.with(|o| {
            (
                o.id,
                o.execution,
                o.issuer.clone(),
                o.side,
                o.size,
                o.price,
            )
        });
        self.orders.insert(order_id, order_ref.clone());

        if self.is_ready() {
            self.tree
                .add_order(order_id, execution, &issuer, side, ticker, size, price);
            if let Some(user) = self.tree.user(&issuer) {
                user.with(|u| u.orders.push(order_id));
            }
        }
    }

    /// Drop an order from the live map, the snapshot rows and its issuer's
    /// open-order list.
    pub fn remove_order(&self, order_id: u64) {
        let issuer = self
            .orders
            .remove(&order_id)
            .map(|(_, o)| o.with(|x| x.issuer.clone()));
        self.tree.remove_order(order_id);
        if let Some(issuer) = issuer {
            if let Some(user) = self.tree.user(&issuer) {
                user.with(|u| u.orders.retain(|&id| id != order_id));
            }
        }
    }

    /// Open order IDs on one instrument, optionally restricted to an issuer.
    pub fn open_orders(&self, ticker: &str, issuer: Option<&str>) -> Vec<u64> {
        self.orders
            .iter()
            .filter(|e| {
                e.value().with(|o| {
                    o.ticker == ticker && issuer.map_or(true, |name| o.issuer == name)
                })
            })
            .map(|e| *e.key())
            .collect()
    }

    /// Close every market for shutdown; resting orders stay in the books and
    /// replay on the next start.
    pub fn close_markets(&self) {
        for market in self.markets.iter() {
            market.value().close_trading();
        }
    }

    /// Remove an instrument: cancel all its open orders, dump the asset
    /// record to a side file and drop it from both tree indices.
    pub fn remove_market(&self, ticker: &str, side_file_dir: &Path) {
        if let Some((_, market)) = self.markets.remove(ticker) {
            market.close_trading();
            for order_id in self.open_orders(ticker, None) {
                if let Some(order) = self.order(order_id) {
                    market.cancel(self, &order);
                }
                self.remove_order(order_id);
            }
        }
        if let Some(asset) = self.tree.remove_asset(ticker) {
            let path = side_file_dir.join(format!("{}.json", ticker));
            match serde_json::to_string_pretty(&*asset.lock()) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(&path, json) {
                        warn!(ticker, "could not write asset side file: {}", e);
                    }
                }
                Err(e) => warn!(ticker, "could not serialize asset side file: {}", e),
            }
        }
    }

    /// Rename an instrument across the tree, the live orders and the
    /// manager map. Fails when the target ticker already exists.
    pub fn rename_market(&self, old_ticker: &str, new_ticker: &str) -> bool {
        if self.markets.contains_key(new_ticker) || self.tree.assets.contains_key(new_ticker) {
            return false;
        }
        if !self.tree.rename_asset(old_ticker, new_ticker) {
            return false;
        }
        if let Some((_, market)) = self.markets.remove(old_ticker) {
            market.set_ticker(new_ticker);
            self.markets.insert(new_ticker.to_string(), market);
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

    /// Rename a principal across the live orders.
    pub fn rename_issuer(&self, old_name: &str, new_name: &str) {
        for order in self.orders.iter() {
            order.value().with(|o| {
                if o.issuer == old_name {
                    o.issuer = new_name.to_string();
                }
            });
        }
    }
}
