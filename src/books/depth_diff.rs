// src/books/depth_diff.rs
//
// Venue-B order book. The feed delivers complete top-5 depth snapshots per
// instrument; this book diffs consecutive snapshots into a normalized
// ADD/MODIFY/CANCEL/TRADE stream so the engine can maintain its own shadow
// book without venue-specific knowledge.

use std::collections::{BTreeMap, HashSet};

use crate::books::synth_order_id;
use crate::types::{
    MarketEvent, MarketEventKind, Price, Qty, Side, TickerId, ORDER_ID_INVALID, PRICE_INVALID,
};

pub const DEPTH_LEVELS: usize = 5;

/// One visible level of a depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthLevel {
    pub price: Price,
    pub qty: Qty,
    pub orders: u16,
}

/// Complete top-of-book view delivered by the venue for one instrument.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthView {
    pub bids: [DepthLevel; DEPTH_LEVELS],
    pub asks: [DepthLevel; DEPTH_LEVELS],
    pub last_price: Price,
    pub last_qty: Qty,
}

#[derive(Debug, Clone, Copy)]
struct StoredLevel {
    qty: Qty,
    orders: u16,
    last_update_ns: u64,
}

/// Cached best bid/offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bbo {
    pub bid_price: Price,
    pub bid_qty: Qty,
    pub ask_price: Price,
    pub ask_qty: Qty,
}

impl Default for Bbo {
    fn default() -> Self {
        Self {
            bid_price: PRICE_INVALID,
            bid_qty: 0,
            ask_price: PRICE_INVALID,
            ask_qty: 0,
        }
    }
}

impl Bbo {
    pub fn is_valid(&self) -> bool {
        self.bid_price != PRICE_INVALID && self.ask_price != PRICE_INVALID
    }

    pub fn mid(&self) -> Option<f64> {
        if self.is_valid() {
            Some((self.bid_price + self.ask_price) as f64 / 2.0)
        } else {
            None
        }
    }
}

pub struct DiffBook {
    ticker_id: TickerId,
    bids: BTreeMap<Price, StoredLevel>,
    asks: BTreeMap<Price, StoredLevel>,
    prev_bid_prices: HashSet<Price>,
    prev_ask_prices: HashSet<Price>,
    bbo: Bbo,
    last_update_ns: u64,
}

impl DiffBook {
    pub fn new(ticker_id: TickerId) -> Self {
        Self {
            ticker_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            prev_bid_prices: HashSet::new(),
            prev_ask_prices: HashSet::new(),
            bbo: Bbo::default(),
            last_update_ns: 0,
        }
    }

    pub fn ticker_id(&self) -> TickerId {
        self.ticker_id
    }

    pub fn bbo(&self) -> Bbo {
        self.bbo
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn last_update_ns(&self) -> u64 {
        self.last_update_ns
    }

    /// Diff one snapshot against the current state.
    ///
    /// Emission order per snapshot: MODIFYs for levels whose size changed,
    /// CANCELs for levels that disappeared, ADDs for new levels, then a
    /// TRADE when the snapshot carries a positive last-traded quantity.
    pub fn apply(&mut self, view: &DepthView, now_ns: u64) -> Vec<MarketEvent> {
        let mut events = Vec::new();
        let mut adds = Vec::new();

        self.prev_bid_prices.clear();
        self.prev_bid_prices.extend(self.bids.keys().copied());
        self.prev_ask_prices.clear();
        self.prev_ask_prices.extend(self.asks.keys().copied());

        diff_side(
            self.ticker_id,
            Side::Buy,
            &view.bids,
            &mut self.bids,
            &mut self.prev_bid_prices,
            now_ns,
            &mut events,
            &mut adds,
        );
        diff_side(
            self.ticker_id,
            Side::Sell,
            &view.asks,
            &mut self.asks,
            &mut self.prev_ask_prices,
            now_ns,
            &mut events,
            &mut adds,
        );

        // Levels present in the previous snapshot but absent now.
        for &price in self.prev_bid_prices.iter() {
            if self.bids.remove(&price).is_some() {
                events.push(level_event(
                    MarketEventKind::Cancel,
                    self.ticker_id,
                    Side::Buy,
                    price,
                    0,
                ));
            }
        }
        for &price in self.prev_ask_prices.iter() {
            if self.asks.remove(&price).is_some() {
                events.push(level_event(
                    MarketEventKind::Cancel,
                    self.ticker_id,
                    Side::Sell,
                    price,
                    0,
                ));
            }
        }

        events.extend(adds);

        if view.last_qty > 0 {
            events.push(MarketEvent {
                kind: MarketEventKind::Trade,
                ticker_id: self.ticker_id,
                order_id: ORDER_ID_INVALID,
                side: Side::Invalid,
                price: view.last_price,
                qty: view.last_qty,
                priority: 1,
            });
        }

        self.refresh_bbo();
        self.last_update_ns = now_ns;
        events
    }

    /// Drop every level, emitting a CANCEL per known level on both sides
    /// followed by a single CLEAR for the ticker.
    pub fn clear(&mut self) -> Vec<MarketEvent> {
        let mut events = Vec::with_capacity(self.bids.len() + self.asks.len() + 1);
        for &price in self.bids.keys() {
            events.push(level_event(
                MarketEventKind::Cancel,
                self.ticker_id,
                Side::Buy,
                price,
                0,
            ));
        }
        for &price in self.asks.keys() {
            events.push(level_event(
                MarketEventKind::Cancel,
                self.ticker_id,
                Side::Sell,
                price,
                0,
            ));
        }
        events.push(MarketEvent::clear(self.ticker_id));

        self.bids.clear();
        self.asks.clear();
        self.prev_bid_prices.clear();
        self.prev_ask_prices.clear();
        self.bbo = Bbo::default();
        events
    }

    fn refresh_bbo(&mut self) {
        self.bbo = Bbo::default();
        if let Some((&price, level)) = self.bids.iter().next_back() {
            self.bbo.bid_price = price;
            self.bbo.bid_qty = level.qty;
        }
        if let Some((&price, level)) = self.asks.iter().next() {
            self.bbo.ask_price = price;
            self.bbo.ask_qty = level.qty;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn diff_side(
    ticker_id: TickerId,
    side: Side,
    levels: &[DepthLevel; DEPTH_LEVELS],
    book_side: &mut BTreeMap<Price, StoredLevel>,
    prev_prices: &mut HashSet<Price>,
    now_ns: u64,
    events: &mut Vec<MarketEvent>,
    adds: &mut Vec<MarketEvent>,
) {
    for level in levels {
        if level.price <= 0 || level.qty == 0 {
            continue;
        }
        match book_side.get_mut(&level.price) {
            None => {
                adds.push(level_event(
                    MarketEventKind::Add,
                    ticker_id,
                    side,
                    level.price,
                    level.qty,
                ));
                book_side.insert(
                    level.price,
                    StoredLevel {
                        qty: level.qty,
                        orders: level.orders,
                        last_update_ns: now_ns,
                    },
                );
            }
            Some(stored) => {
                if stored.qty != level.qty {
                    events.push(level_event(
                        MarketEventKind::Modify,
                        ticker_id,
                        side,
                        level.price,
                        level.qty,
                    ));
                    stored.qty = level.qty;
                    stored.last_update_ns = now_ns;
                }
                stored.orders = level.orders;
            }
        }
        prev_prices.remove(&level.price);
    }
}

fn level_event(
    kind: MarketEventKind,
    ticker_id: TickerId,
    side: Side,
    price: Price,
    qty: Qty,
) -> MarketEvent {
    MarketEvent {
        kind,
        ticker_id,
        order_id: synth_order_id(ticker_id, price, side),
        side,
        price,
        qty,
        priority: 1,
    }
}
