//! Per-instrument order book.
//!
//! The unprocessed book is a pair of price-keyed level maps (bids iterated
//! high to low, offers low to high, FIFO within a level). Alongside it the
//! book tracks the top of each side — extreme price, aggregate size and the
//! resting order IDs at that level — which are the authoritative inputs for
//! quote updates. Market orders rest with sentinel prices (+inf buys, 0
//! sells) and are stripped from the visible top by [`OrderBook::sanitize`].

use std::collections::{BTreeMap, VecDeque};

use ordered_float::OrderedFloat;

use crate::market::types::{OrderRef, Side, Trade};
use crate::utils;

#[derive(Default)]
pub struct OrderBook {
    bids: BTreeMap<OrderedFloat<f64>, VecDeque<OrderRef>>,
    offers: BTreeMap<OrderedFloat<f64>, VecDeque<OrderRef>>,

    max_bid: Option<f64>,
    max_bid_size: i64,
    max_bid_ids: Vec<u64>,

    min_offer: Option<f64>,
    min_offer_size: i64,
    min_offer_ids: Vec<u64>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_bid(&self) -> Option<f64> {
        self.max_bid
    }

    pub fn min_offer(&self) -> Option<f64> {
        self.min_offer
    }

    pub fn max_bid_size(&self) -> i64 {
        self.max_bid_size
    }

    pub fn min_offer_size(&self) -> i64 {
        self.min_offer_size
    }

    /// Mid quote: half the sum of the two tops, defined only when both sides
    /// are present.
    pub fn current_price(&self) -> Option<f64> {
        match (self.max_bid, self.min_offer) {
            (Some(bid), Some(offer)) => Some(utils::round3((bid + offer) / 2.0)),
            _ => None,
        }
    }

    /// Accept an order: rest it when nothing crosses, otherwise match it
    /// against the opposite side in price-time order and rest any residual.
    /// Returns the produced trades, priced at the resting orders' prices.
    pub fn place(&mut self, order_ref: &OrderRef) -> Vec<Trade> {
        let (side, size, price) = order_ref.with(|o| {
            o.left = o.size;
            (o.side, o.size, o.price)
        });

        if !self.crossing_exists(side, price) {
            self.rest(order_ref);
            return Vec::new();
        }

        // Debit the opposing top by the incoming size; a non-positive result
        // forces the recompute below to rescan the level maps.
        match side {
            Side::Sell => self.max_bid_size -= size,
            Side::Buy => self.min_offer_size -= size,
        }

        let trades = self.match_incoming(order_ref);

        match side {
            Side::Sell => self.recompute_bids(),
            Side::Buy => self.recompute_offers(),
        }

        if order_ref.with(|o| o.size) > 0 {
            self.rest(order_ref);
        }

        debug_assert!(self.is_uncrossed(), "matching left the book crossed");
        trades
    }

    /// Remove a resting order. When it sat at the prevailing top, its size is
    /// subtracted and the top rescanned if depleted. Returns false when the
    /// order is not in the book.
    pub fn delete(&mut self, order_ref: &OrderRef) -> bool {
        let (side, price, id, size) = order_ref.with(|o| (o.side, o.price, o.id, o.size));
        let key = OrderedFloat(price);

        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.offers,
        };
        let (removed, emptied) = match levels.get_mut(&key) {
            Some(queue) => {
                let before = queue.len();
                queue.retain(|o| o.with(|x| x.id) != id);
                (queue.len() < before, queue.is_empty())
            }
            None => (false, false),
        };
        if emptied {
            levels.remove(&key);
        }
        if !removed {
            return false;
        }

        match side {
            Side::Sell => {
                if let Some(pos) = self.min_offer_ids.iter().position(|&i| i == id) {
                    self.min_offer_ids.remove(pos);
                    self.min_offer_size -= size;
                    self.recompute_offers();
                }
            }
            Side::Buy => {
                if let Some(pos) = self.max_bid_ids.iter().position(|&i| i == id) {
                    self.max_bid_ids.remove(pos);
                    self.max_bid_size -= size;
                    self.recompute_bids();
                }
            }
        }
        true
    }

    fn crossing_exists(&self, side: Side, price: f64) -> bool {
        match side {
            Side::Sell => matches!(self.max_bid, Some(bid) if bid >= price),
            Side::Buy => matches!(self.min_offer, Some(offer) if offer <= price),
        }
    }

    /// Append to the book and fold the order into its own side's top.
    fn rest(&mut self, order_ref: &OrderRef) {
        let (side, size, price, id) = order_ref.with(|o| (o.side, o.size, o.price, o.id));
        match side {
            Side::Sell => {
                self.offers
                    .entry(OrderedFloat(price))
                    .or_default()
                    .push_back(order_ref.clone());
                if self.min_offer == Some(price) {
                    self.min_offer_size += size;
                    self.min_offer_ids.push(id);
                } else if self.min_offer.map_or(true, |offer| price < offer) {
                    self.min_offer = Some(price);
                    self.min_offer_size = size;
                    self.min_offer_ids = vec![id];
                }
            }
            Side::Buy => {
                self.bids
                    .entry(OrderedFloat(price))
                    .or_default()
                    .push_back(order_ref.clone());
                if self.max_bid == Some(price) {
                    self.max_bid_size += size;
                    self.max_bid_ids.push(id);
                } else if self.max_bid.map_or(true, |bid| price > bid) {
                    self.max_bid = Some(price);
                    self.max_bid_size = size;
                    self.max_bid_ids = vec![id];
                }
            }
        }
    }

    /// Consume resting liquidity against the incoming order, best price
    /// first, FIFO within a level. Trades are priced at the resting order's
    /// price; sentinel prices are resolved during trade application.
    fn match_incoming(&mut self, incoming_ref: &OrderRef) -> Vec<Trade> {
        let (taker_side, taker_id, limit_price) =
            incoming_ref.with(|o| (o.side, o.id, o.price));
        let mut trades = Vec::new();

        let levels: Vec<OrderedFloat<f64>> = match taker_side {
            Side::Buy => self.offers.keys().cloned().collect(),
            Side::Sell => self.bids.keys().rev().cloned().collect(),
        };

        for level in levels {
            if incoming_ref.with(|o| o.size) <= 0 {
                break;
            }
            let beyond_limit = match taker_side {
                Side::Buy => level.0 > limit_price,
                Side::Sell => level.0 < limit_price,
            };
            if beyond_limit {
                break;
            }

            let levels_map = match taker_side {
                Side::Buy => &mut self.offers,
                Side::Sell => &mut self.bids,
            };
            let mut emptied = false;
            if let Some(queue) = levels_map.get_mut(&level) {
                loop {
                    let incoming_size = incoming_ref.with(|o| o.size);
                    if incoming_size <= 0 {
                        break;
                    }
                    let Some(maker_ref) = queue.front().cloned() else {
                        break;
                    };
                    let (maker_id, maker_size, maker_price) =
                        maker_ref.with(|o| (o.id, o.size, o.price));

                    let trade_size = incoming_size.min(maker_size);
                    trades.push(Trade {
                        side: taker_side,
                        incoming_order_id: taker_id,
                        book_order_id: maker_id,
                        price: maker_price,
                        size: trade_size,
                    });

                    maker_ref.with(|o| o.size -= trade_size);
                    incoming_ref.with(|o| o.size -= trade_size);

                    if maker_ref.with(|o| o.size) <= 0 {
                        queue.pop_front();
                    }
                }
                emptied = queue.is_empty();
            }
            if emptied {
                levels_map.remove(&level);
            }
        }

        trades
    }

    /// Rescan the bid side when its recorded top size is depleted: pull the
    /// new extreme price, re-sum the level and re-collect its IDs.
    fn recompute_bids(&mut self) {
        if self.max_bid.is_some() && self.max_bid_size > 0 {
            return;
        }
        match self.bids.iter().next_back() {
            Some((price, queue)) => {
                self.max_bid = Some(price.0);
                self.max_bid_size = queue.iter().map(|o| o.with(|x| x.size)).sum();
                self.max_bid_ids = queue.iter().map(|o| o.with(|x| x.id)).collect();
            }
            None => {
                self.max_bid = None;
                self.max_bid_size = 0;
                self.max_bid_ids.clear();
            }
        }
        self.sanitize();
    }

    fn recompute_offers(&mut self) {
        if self.min_offer.is_some() && self.min_offer_size > 0 {
            return;
        }
        match self.offers.iter().next() {
            Some((price, queue)) => {
                self.min_offer = Some(price.0);
                self.min_offer_size = queue.iter().map(|o| o.with(|x| x.size)).sum();
                self.min_offer_ids = queue.iter().map(|o| o.with(|x| x.id)).collect();
            }
            None => {
                self.min_offer = None;
                self.min_offer_size = 0;
                self.min_offer_ids.clear();
            }
        }
        self.sanitize();
    }

    /// Null a top whose size is non-positive or whose price is non-finite
    /// (a resting market order's sentinel must never surface as a quote).
    fn sanitize(&mut self) {
        if let Some(bid) = self.max_bid {
            if !bid.is_finite() || self.max_bid_size <= 0 {
                self.max_bid = None;
            }
        }
        if let Some(offer) = self.min_offer {
            if !offer.is_finite() || self.min_offer_size <= 0 {
                self.min_offer = None;
            }
        }
    }

    fn is_uncrossed(&self) -> bool {
        match (self.max_bid, self.min_offer) {
            (Some(bid), Some(offer)) if bid.is_finite() && offer > 0.0 => bid < offer,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Order;
    use crate::store::guard::Guarded;
    use std::sync::Arc;

    fn limit(id: u64, side: Side, size: i64, price: f64) -> OrderRef {
        Arc::new(Guarded::new(Order::limit(id, side, "XYZ", "trader", size, price)))
    }

    fn market(id: u64, side: Side, size: i64) -> OrderRef {
        Arc::new(Guarded::new(Order::market(id, side, "XYZ", "trader", size)))
    }

    #[test]
    fn test_rest_sets_top_of_book() {
        let mut book = OrderBook::new();
        let trades = book.place(&limit(1, Side::Buy, 10, 100.0));
        assert!(trades.is_empty());
        assert_eq!(book.max_bid(), Some(100.0));
        assert_eq!(book.max_bid_size(), 10);
        assert_eq!(book.max_bid_ids, vec![1]);
        assert_eq!(book.min_offer(), None);
    }

    #[test]
    fn test_crossing_sell_fills_at_resting_price() {
        let mut book = OrderBook::new();
        book.place(&limit(1, Side::Buy, 10, 100.0));
        let trades = book.place(&limit(2, Side::Sell, 4, 99.0));

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, 100.0);
        assert_eq!(trades[0].size, 4);
        assert_eq!(trades[0].side, Side::Sell);
        assert_eq!(trades[0].incoming_order_id, 2);
        assert_eq!(trades[0].book_order_id, 1);

        assert_eq!(book.max_bid(), Some(100.0));
        assert_eq!(book.max_bid_size(), 6);
        assert_eq!(book.min_offer(), None);
    }

    #[test]
    fn test_price_time_priority() {
        let mut book = OrderBook::new();
        book.place(&limit(1, Side::Sell, 1, 101.0));
        book.place(&limit(2, Side::Sell, 1, 100.0));
        book.place(&limit(3, Side::Sell, 1, 100.0));

        let trades = book.place(&limit(4, Side::Buy, 3, 101.0));
        assert_eq!(trades.len(), 3);
        // Best price first, then arrival order within the level.
        assert_eq!(trades[0].book_order_id, 2);
        assert_eq!(trades[1].book_order_id, 3);
        assert_eq!(trades[2].book_order_id, 1);
        assert_eq!(book.min_offer(), None);
        assert_eq!(book.max_bid(), None);
    }

    #[test]
    fn test_partial_fill_rests_residual() {
        let mut book = OrderBook::new();
        book.place(&limit(1, Side::Buy, 5, 100.0));
        let incoming = limit(2, Side::Sell, 8, 99.0);
        let trades = book.place(&incoming);

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].size, 5);
        // Residual rests at its original price on the offer side.
        assert_eq!(incoming.with(|o| o.size), 3);
        assert_eq!(book.min_offer(), Some(99.0));
        assert_eq!(book.min_offer_size(), 3);
        assert_eq!(book.max_bid(), None);
    }

    #[test]
    fn test_limit_stops_at_its_price() {
        let mut book = OrderBook::new();
        book.place(&limit(1, Side::Buy, 5, 100.0));
        book.place(&limit(2, Side::Buy, 5, 98.0));

        let trades = book.place(&limit(3, Side::Sell, 10, 99.0));
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].size, 5);
        // The 98 bid is below the sell limit; the residual rests and the
        // next bid level becomes the top.
        assert_eq!(book.max_bid(), Some(98.0));
        assert_eq!(book.max_bid_size(), 5);
        assert_eq!(book.min_offer(), Some(99.0));
        assert_eq!(book.min_offer_size(), 5);
    }

    #[test]
    fn test_cancel_away_from_top_keeps_top() {
        let mut book = OrderBook::new();
        book.place(&limit(1, Side::Buy, 10, 100.0));
        let away = limit(2, Side::Buy, 5, 95.0);
        book.place(&away);

        assert!(book.delete(&away));
        assert_eq!(book.max_bid(), Some(100.0));
        assert_eq!(book.max_bid_size(), 10);
    }

    #[test]
    fn test_cancel_top_recomputes_next_level() {
        let mut book = OrderBook::new();
        let top = limit(1, Side::Buy, 10, 100.0);
        book.place(&top);
        book.place(&limit(2, Side::Buy, 7, 99.0));

        assert!(book.delete(&top));
        assert_eq!(book.max_bid(), Some(99.0));
        assert_eq!(book.max_bid_size(), 7);
        assert_eq!(book.max_bid_ids, vec![2]);
    }

    #[test]
    fn test_delete_unknown_order() {
        let mut book = OrderBook::new();
        assert!(!book.delete(&limit(9, Side::Buy, 1, 50.0)));
    }

    #[test]
    fn test_market_buy_on_empty_book_rests_invisible() {
        let mut book = OrderBook::new();
        let order = market(1, Side::Buy, 5);
        let trades = book.place(&order);
        assert!(trades.is_empty());
        // The sentinel price becomes the raw top until a recompute strips it.
        assert_eq!(book.max_bid(), Some(f64::INFINITY));
        book.recompute_bids_for_test();
        assert_eq!(book.max_bid(), None);
    }

    #[test]
    fn test_market_sell_sweeps_and_rests_at_zero() {
        let mut book = OrderBook::new();
        book.place(&limit(1, Side::Buy, 4, 100.0));
        book.place(&limit(2, Side::Buy, 4, 99.0));

        let incoming = market(3, Side::Sell, 10);
        let trades = book.place(&incoming);

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].price, 100.0);
        assert_eq!(trades[1].price, 99.0);
        assert_eq!(incoming.with(|o| o.size), 2);
        assert_eq!(book.max_bid(), None);
        assert_eq!(book.min_offer(), Some(0.0));
        assert_eq!(book.min_offer_size(), 2);
    }

    #[test]
    fn test_market_buy_matches_resting_market_sell() {
        let mut book = OrderBook::new();
        book.place(&market(1, Side::Sell, 3));
        let trades = book.place(&market(2, Side::Buy, 3));

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].size, 3);
        // Priced at the resting sentinel; resolved in trade application.
        assert_eq!(trades[0].price, 0.0);
    }

    #[test]
    fn test_current_price_requires_both_sides() {
        let mut book = OrderBook::new();
        book.place(&limit(1, Side::Buy, 1, 99.0));
        assert_eq!(book.current_price(), None);
        book.place(&limit(2, Side::Sell, 1, 100.0));
        assert_eq!(book.current_price(), Some(99.5));
    }

    #[test]
    fn test_left_tracks_placed_size() {
        let mut book = OrderBook::new();
        let order = limit(1, Side::Buy, 10, 100.0);
        book.place(&order);
        assert_eq!(order.with(|o| o.left), 10);
    }

    impl OrderBook {
        fn recompute_bids_for_test(&mut self) {
            self.max_bid_size = 0;
            self.recompute_bids();
        }
    }
}
