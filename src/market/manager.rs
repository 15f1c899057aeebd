//! Per-instrument market manager.
//!
//! Owns the guarded matching engine and the tradable flag. A placement holds
//! the engine guard across matching, registration, trade application and the
//! quote/depth update, so a trade's effects on both counterparties are
//! atomic with respect to every other trade on the same instrument.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

use crate::market::book::OrderBook;
use crate::market::registry::GlobalMarket;
use crate::market::types::{Execution, Order, OrderRef, OrderStatus, Placement, Side, Trade};
use crate::store::guard::Guarded;
use crate::utils::{round2, round3};

pub struct MarketManager {
    ticker: RwLock<String>,
    engine: Guarded<OrderBook>,
    tradable: AtomicBool,
}

impl MarketManager {
    pub fn new(ticker: &str) -> Self {
        Self {
            ticker: RwLock::new(ticker.to_string()),
            engine: Guarded::new(OrderBook::new()),
            tradable: AtomicBool::new(true),
        }
    }

    pub fn ticker(&self) -> String {
        self.ticker.read().clone()
    }

    pub fn set_ticker(&self, ticker: &str) {
        *self.ticker.write() = ticker.to_string();
    }

    pub fn is_tradable(&self) -> bool {
        self.tradable.load(Ordering::SeqCst)
    }

    /// Close the market: new orders are silently rejected until reopened.
    pub fn close_trading(&self) {
        let _engine = self.engine.lock();
        self.tradable.store(false, Ordering::SeqCst);
    }

    pub fn open_trading(&self) {
        self.tradable.store(true, Ordering::SeqCst);
    }

    pub fn add_limit_order(
        &self,
        gm: &GlobalMarket,
        side: Side,
        size: i64,
        price: f64,
        issuer: &str,
    ) -> Option<Placement> {
        let ticker = self.ticker();
        self.place(gm, move |id| Order::limit(id, side, &ticker, issuer, size, price))
    }

    pub fn add_market_order(
        &self,
        gm: &GlobalMarket,
        side: Side,
        size: i64,
        issuer: &str,
    ) -> Option<Placement> {
        let ticker = self.ticker();
        self.place(gm, move |id| Order::market(id, side, &ticker, issuer, size))
    }

    fn place(&self, gm: &GlobalMarket, build: impl FnOnce(u64) -> Order) -> Option<Placement> {
        if !self.is_tradable() {
            return None;
        }

        let ticker = self.ticker();
        let mut engine = self.engine.lock();

        let order_id = gm.next_order_id();
        let order = build(order_id);
        let placed_size = order.size;
        let order_ref: OrderRef = Arc::new(Guarded::new(order));

        let mut trades = engine.place(&order_ref);

        // The order must be resolvable from the registry before its own
        // trades are applied.
        gm.register_order(&ticker, &order_ref);
        self.apply_trades(gm, &ticker, &mut trades);

        let volume_delta = if gm.is_ready() { placed_size } else { 0 };
        self.update_quotes(gm, &ticker, &engine, &order_ref, volume_delta);
        drop(engine);

        let (left, fill_cost) = order_ref.with(|o| (o.left, o.fill_cost));
        let filled = placed_size - left;
        let fill_price = if filled > 0 {
            round3(fill_cost / filled as f64)
        } else {
            0.0
        };
        Some(Placement {
            order_id,
            filled,
            fill_price,
        })
    }

    /// Remove a resting order. Returns false when it is not in the book.
    pub fn cancel(&self, gm: &GlobalMarket, order_ref: &OrderRef) -> bool {
        let ticker = self.ticker();
        let mut engine = self.engine.lock();
        if !engine.delete(order_ref) {
            return false;
        }
        order_ref.with(|o| {
            o.status = OrderStatus::Cancelled;
            o.size = 0;
        });
        self.update_quotes(gm, &ticker, &engine, order_ref, 0);
        true
    }

    /// Refresh the instrument's immediate state from the engine's tops and
    /// maintain the depth-by-price entry of the order that just went through
    /// placement or cancellation.
    fn update_quotes(
        &self,
        gm: &GlobalMarket,
        ticker: &str,
        engine: &OrderBook,
        order_ref: &OrderRef,
        volume_delta: i64,
    ) {
        let Some(asset) = gm.tree().asset(ticker) else {
            return;
        };
        let (side, status, execution, size, left, price) = order_ref.with(|o| {
            (o.side, o.status, o.execution, o.size, o.left, o.price)
        });

        asset.with(|a| {
            match side {
                Side::Sell => {
                    a.session_data.sell_volume += volume_delta;
                    if let Some(ask) = a.immediate.ask {
                        if Some(ask) != engine.min_offer() {
                            a.immediate.last_ask = Some(ask);
                        }
                    }
                }
                Side::Buy => {
                    a.session_data.buy_volume += volume_delta;
                    if let Some(bid) = a.immediate.bid {
                        if Some(bid) != engine.max_bid() {
                            a.immediate.last_bid = Some(bid);
                        }
                    }
                }
            }

            // Sentinel-priced tops never surface as quotes.
            let visible_bid = engine.max_bid().filter(|b| *b > 0.0 && b.is_finite());
            let visible_ask = engine.min_offer().filter(|o| *o > 0.0 && o.is_finite());
            a.immediate.bid = visible_bid;
            a.immediate.ask = visible_ask;
            a.immediate.mid = match (visible_bid, visible_ask) {
                (Some(_), Some(_)) => engine.current_price(),
                _ => None,
            };
            a.immediate.bid_volume = visible_bid.map(|_| engine.max_bid_size());
            a.immediate.ask_volume = visible_ask.map(|_| engine.min_offer_size());

            if execution == Execution::Limit {
                match status {
                    OrderStatus::Cancelled => a.immediate.depth.subtract(side, price, left),
                    OrderStatus::Open => {
                        if size > 0 && left == size {
                            a.immediate.depth.add(side, price, size);
                        }
                    }
                }
            }

            if a.session_data.open.is_none() {
                a.session_data.open = a.immediate.mid;
            }
        });
    }

    /// Apply a batch of trades: resolve the execution price of each leg,
    /// move cash and units between the counterparties, mutate the canonical
    /// order rows and drop fully consumed orders everywhere.
    fn apply_trades(&self, gm: &GlobalMarket, ticker: &str, trades: &mut [Trade]) {
        for trade in trades {
            let (buy_id, sell_id) = match trade.side {
                Side::Sell => (trade.book_order_id, trade.incoming_order_id),
                Side::Buy => (trade.incoming_order_id, trade.book_order_id),
            };
            let Some(buy_order) = gm.order(buy_id) else {
                error!(order_id = buy_id, "trade references unknown buy order");
                continue;
            };
            let Some(sell_order) = gm.order(sell_id) else {
                error!(order_id = sell_id, "trade references unknown sell order");
                continue;
            };

            let (buy_exec, buy_limit, buyer) =
                buy_order.with(|o| (o.execution, o.price, o.issuer.clone()));
            let (sell_exec, sell_limit, seller) =
                sell_order.with(|o| (o.execution, o.price, o.issuer.clone()));

            let (mut buy_price, mut sell_price) =
                if buy_exec == Execution::Market && sell_exec == Execution::Market {
                    self.market_cross_prices(gm, ticker)
                } else if buy_exec == Execution::Limit && sell_exec == Execution::Limit {
                    // Both legs settle at the resting order's price.
                    (trade.price, trade.price)
                } else {
                    (buy_limit, sell_limit)
                };

            // Degenerate sentinel corrections.
            if sell_price <= 0.0 {
                sell_price = buy_price;
            }
            if buy_price.is_infinite() {
                buy_price = sell_price;
            }

            let maker_is_limit = match trade.side {
                Side::Buy => sell_exec == Execution::Limit,
                Side::Sell => buy_exec == Execution::Limit,
            };
            if maker_is_limit {
                if let Some(asset) = gm.tree().asset(ticker) {
                    asset.with(|a| {
                        a.immediate
                            .depth
                            .subtract(trade.side.opposite(), trade.price, trade.size)
                    });
                }
            }
            // The recorded trade price is the buyer side.
            trade.price = buy_price;

            let taker = match trade.side {
                Side::Buy => &buy_order,
                Side::Sell => &sell_order,
            };
            taker.with(|o| o.fill_cost += buy_price * trade.size as f64);

            // Ledger legs, buyer first then seller; the guards are taken
            // sequentially, never nested.
            match gm.tree().user(&buyer) {
                Some(user) => user.with(|u| {
                    let units = u.current.assets.entry(ticker.to_string()).or_insert(0);
                    *units += trade.size;
                    if *units == 0 {
                        u.current.assets.remove(ticker);
                    }
                    u.current.balance -= round3(buy_price * trade.size as f64);
                }),
                None => warn!(user = %buyer, "trade for unknown buyer"),
            }
            match gm.tree().user(&seller) {
                Some(user) => user.with(|u| {
                    let units = u.current.assets.entry(ticker.to_string()).or_insert(0);
                    *units -= trade.size;
                    if *units == 0 {
                        u.current.assets.remove(ticker);
                    }
                    u.current.balance += round3(sell_price * trade.size as f64);
                }),
                None => warn!(user = %seller, "trade for unknown seller"),
            }

            gm.tree().update_order(buy_id, buy_order.with(|o| o.size));
            gm.tree().update_order(sell_id, sell_order.with(|o| o.size));

            let buy_left = buy_order.with(|o| {
                o.left -= trade.size;
                o.left
            });
            if buy_left <= 0 {
                gm.remove_order(buy_id);
            }
            let sell_left = sell_order.with(|o| {
                o.left -= trade.size;
                o.left
            });
            if sell_left <= 0 {
                gm.remove_order(sell_id);
            }

            if let Some(asset) = gm.tree().asset(ticker) {
                let value = round2(trade.price * trade.size as f64);
                asset.with(|a| a.session_data.traded_value += value);
            }
        }
    }

    /// Pricing for a market-vs-market cross: the live quotes if any, else
    /// the last observed quotes, else the previous close, else zero. The
    /// seller receives the lower leg, the buyer pays the higher.
    fn market_cross_prices(&self, gm: &GlobalMarket, ticker: &str) -> (f64, f64) {
        let Some(asset) = gm.tree().asset(ticker) else {
            return (0.0, 0.0);
        };
        asset.with(|a| {
            let quotes = match (a.immediate.bid, a.immediate.ask) {
                (Some(bid), Some(ask)) => Some((bid, ask)),
                _ => match (a.immediate.last_bid, a.immediate.last_ask) {
                    (Some(bid), Some(ask)) => Some((bid, ask)),
                    _ => None,
                },
            };
            match quotes {
                Some((bid, ask)) => (bid.max(ask), bid.min(ask)),
                None => match a.session_data.previous_close {
                    Some(close) => (close, close),
                    None => (0.0, 0.0),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::registry::GlobalMarket;
    use crate::store::records::ExchangeTree;

    fn exchange() -> Arc<GlobalMarket> {
        let tree = Arc::new(ExchangeTree::default());
        tree.add_user("alice", 1000.0);
        tree.add_user("bob", 1000.0);
        tree.add_asset("XYZ", "EQ", "admin");
        let gm = GlobalMarket::new(tree);
        gm.bootstrap();
        gm
    }

    #[test]
    fn test_resting_buy_updates_quote_state() {
        let gm = exchange();
        let placement = gm
            .add_limit_order("XYZ", Side::Buy, 100.0, 10, "alice")
            .expect("market open");
        assert_eq!(placement.filled, 0);
        assert_eq!(placement.fill_price, 0.0);

        let asset = gm.tree().asset("XYZ").unwrap();
        asset.with(|a| {
            assert_eq!(a.immediate.bid, Some(100.0));
            assert_eq!(a.immediate.bid_volume, Some(10));
            assert_eq!(a.immediate.ask, None);
            assert_eq!(a.immediate.depth.bids.get("100"), Some(&10));
            assert_eq!(a.session_data.buy_volume, 10);
        });
    }

    #[test]
    fn test_crossing_sell_moves_cash_and_units() {
        let gm = exchange();
        gm.add_limit_order("XYZ", Side::Buy, 100.0, 10, "alice");
        let placement = gm
            .add_limit_order("XYZ", Side::Sell, 99.0, 4, "bob")
            .unwrap();

        assert_eq!(placement.filled, 4);
        assert_eq!(placement.fill_price, 100.0);

        let alice = gm.tree().user("alice").unwrap();
        alice.with(|u| {
            assert_eq!(u.current.assets.get("XYZ"), Some(&4));
            assert_eq!(u.current.balance, -400.0);
        });
        let bob = gm.tree().user("bob").unwrap();
        bob.with(|u| {
            assert_eq!(u.current.assets.get("XYZ"), Some(&-4));
            assert_eq!(u.current.balance, 400.0);
        });

        let asset = gm.tree().asset("XYZ").unwrap();
        asset.with(|a| {
            assert_eq!(a.immediate.bid, Some(100.0));
            assert_eq!(a.immediate.bid_volume, Some(6));
            assert_eq!(a.immediate.depth.bids.get("100"), Some(&6));
            assert_eq!(a.session_data.traded_value, 400.0);
        });
    }

    #[test]
    fn test_fully_filled_orders_leave_every_index() {
        let gm = exchange();
        let bid = gm
            .add_limit_order("XYZ", Side::Buy, 100.0, 4, "alice")
            .unwrap();
        let ask = gm
            .add_limit_order("XYZ", Side::Sell, 100.0, 4, "bob")
            .unwrap();

        assert!(gm.order(bid.order_id).is_none());
        assert!(gm.order(ask.order_id).is_none());
        assert!(gm.tree().order(bid.order_id).is_none());
        assert!(gm.tree().order(ask.order_id).is_none());
        let alice = gm.tree().user("alice").unwrap();
        assert!(alice.with(|u| u.orders.is_empty()));
    }

    #[test]
    fn test_partial_fill_keeps_residual_row() {
        let gm = exchange();
        let bid = gm
            .add_limit_order("XYZ", Side::Buy, 100.0, 10, "alice")
            .unwrap();
        gm.add_limit_order("XYZ", Side::Sell, 100.0, 4, "bob");

        let row = gm.tree().order(bid.order_id).expect("residual row");
        assert_eq!(row.with(|o| o.size), 6);
        let live = gm.order(bid.order_id).expect("live residual");
        assert_eq!(live.with(|o| o.left), 6);
    }

    #[test]
    fn test_market_vs_market_prices_at_zero_without_history() {
        let gm = exchange();
        gm.add_market_order("XYZ", Side::Sell, 5, "bob");
        let placement = gm.add_market_order("XYZ", Side::Buy, 5, "alice").unwrap();

        assert_eq!(placement.filled, 5);
        assert_eq!(placement.fill_price, 0.0);
        let alice = gm.tree().user("alice").unwrap();
        alice.with(|u| {
            assert_eq!(u.current.assets.get("XYZ"), Some(&5));
            assert_eq!(u.current.balance, 0.0);
        });
    }

    #[test]
    fn test_market_vs_market_prices_off_previous_close() {
        let gm = exchange();
        gm.tree()
            .asset("XYZ")
            .unwrap()
            .with(|a| a.session_data.previous_close = Some(50.0));

        gm.add_market_order("XYZ", Side::Sell, 2, "bob");
        let placement = gm.add_market_order("XYZ", Side::Buy, 2, "alice").unwrap();

        assert_eq!(placement.fill_price, 50.0);
        let bob = gm.tree().user("bob").unwrap();
        assert_eq!(bob.with(|u| u.current.balance), 100.0);
    }

    #[test]
    fn test_market_taker_charged_at_resting_price() {
        let gm = exchange();
        gm.add_limit_order("XYZ", Side::Sell, 25.0, 3, "bob");
        let placement = gm.add_market_order("XYZ", Side::Buy, 3, "alice").unwrap();

        assert_eq!(placement.filled, 3);
        assert_eq!(placement.fill_price, 25.0);
        let alice = gm.tree().user("alice").unwrap();
        assert_eq!(alice.with(|u| u.current.balance), -75.0);
    }

    #[test]
    fn test_closed_market_rejects_orders() {
        let gm = exchange();
        gm.market("XYZ").unwrap().close_trading();
        assert!(gm
            .add_limit_order("XYZ", Side::Buy, 100.0, 1, "alice")
            .is_none());
        gm.market("XYZ").unwrap().open_trading();
        assert!(gm
            .add_limit_order("XYZ", Side::Buy, 100.0, 1, "alice")
            .is_some());
    }

    #[test]
    fn test_session_open_set_from_first_mid() {
        let gm = exchange();
        gm.add_limit_order("XYZ", Side::Buy, 99.0, 1, "alice");
        gm.add_limit_order("XYZ", Side::Sell, 101.0, 1, "bob");
        let asset = gm.tree().asset("XYZ").unwrap();
        assert_eq!(asset.with(|a| a.session_data.open), Some(100.0));
    }

    #[test]
    fn test_self_trade_nets_out() {
        let gm = exchange();
        gm.add_limit_order("XYZ", Side::Buy, 10.0, 2, "alice");
        gm.add_limit_order("XYZ", Side::Sell, 10.0, 2, "alice");
        let alice = gm.tree().user("alice").unwrap();
        alice.with(|u| {
            assert!(u.current.assets.is_empty());
            assert_eq!(u.current.balance, 0.0);
        });
    }
}
