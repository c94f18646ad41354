// src/books/delta.rs
//
// Venue-A order book. The venue streams depth deltas identified by a
// monotonic update-id interval (U, u); the book applies them against a REST
// snapshot and reports gaps so the caller can re-enter the snapshot
// protocol. Every (re)initialization emits a CLEAR followed by ADDs for
// the installed snapshot, so downstream engines rebuild from scratch after
// any resync.

use std::collections::BTreeMap;

use tracing::debug;

use crate::books::synth_order_id;
use crate::types::{
    MarketEvent, MarketEventKind, Price, Qty, Side, TickerId, ORDER_ID_INVALID,
};

/// Outcome of applying one delta.
#[derive(Debug, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Delta applied; the contained events were emitted.
    Applied(Vec<MarketEvent>),
    /// `u <= last_update_id`: already reflected in the snapshot. No events.
    Stale,
    /// `U > last_update_id + 1`: the caller must clear and resync.
    Gap,
}

pub struct DeltaBook {
    ticker_id: TickerId,
    bids: BTreeMap<Price, Qty>,
    asks: BTreeMap<Price, Qty>,
    last_update_id: u64,
    initialized: bool,
}

impl DeltaBook {
    pub fn new(ticker_id: TickerId) -> Self {
        Self {
            ticker_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            initialized: false,
        }
    }

    pub fn ticker_id(&self) -> TickerId {
        self.ticker_id
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn best_bid(&self) -> Option<(Price, Qty)> {
        self.bids.iter().next_back().map(|(&p, &q)| (p, q))
    }

    pub fn best_ask(&self) -> Option<(Price, Qty)> {
        self.asks.iter().next().map(|(&p, &q)| (p, q))
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Install a REST snapshot, emitting CLEAR + an ADD per level.
    pub fn apply_snapshot(
        &mut self,
        last_update_id: u64,
        bids: &[(Price, Qty)],
        asks: &[(Price, Qty)],
    ) -> Vec<MarketEvent> {
        self.bids.clear();
        self.asks.clear();

        let mut events = Vec::with_capacity(1 + bids.len() + asks.len());
        events.push(MarketEvent::clear(self.ticker_id));
        for &(price, qty) in bids {
            if qty == 0 {
                continue;
            }
            self.bids.insert(price, qty);
            events.push(self.level_event(MarketEventKind::Add, Side::Buy, price, qty));
        }
        for &(price, qty) in asks {
            if qty == 0 {
                continue;
            }
            self.asks.insert(price, qty);
            events.push(self.level_event(MarketEventKind::Add, Side::Sell, price, qty));
        }
        self.last_update_id = last_update_id;
        self.initialized = true;
        debug!(
            ticker = self.ticker_id,
            last_update_id,
            bids = self.bids.len(),
            asks = self.asks.len(),
            "delta book installed snapshot"
        );
        events
    }

    /// Apply one delta covering update ids `[first, last]`.
    pub fn apply_delta(
        &mut self,
        first: u64,
        last: u64,
        bids: &[(Price, Qty)],
        asks: &[(Price, Qty)],
    ) -> DeltaOutcome {
        if last <= self.last_update_id {
            return DeltaOutcome::Stale;
        }
        if first > self.last_update_id + 1 {
            return DeltaOutcome::Gap;
        }

        let mut events = Vec::with_capacity(bids.len() + asks.len());
        for &(price, qty) in bids {
            self.apply_level(Side::Buy, price, qty, &mut events);
        }
        for &(price, qty) in asks {
            self.apply_level(Side::Sell, price, qty, &mut events);
        }
        self.last_update_id = last;
        DeltaOutcome::Applied(events)
    }

    /// Forget all state and emit the CLEAR that must precede the re-ADDs of
    /// the next snapshot.
    pub fn clear(&mut self) -> Vec<MarketEvent> {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
        self.initialized = false;
        vec![MarketEvent::clear(self.ticker_id)]
    }

    /// Translate a venue trade print.
    pub fn trade_event(&self, price: Price, qty: Qty, buyer_is_maker: bool) -> MarketEvent {
        MarketEvent {
            kind: MarketEventKind::Trade,
            ticker_id: self.ticker_id,
            order_id: ORDER_ID_INVALID,
            // Buyer was the maker means the aggressor sold.
            side: if buyer_is_maker { Side::Sell } else { Side::Buy },
            price,
            qty,
            priority: 1,
        }
    }

    fn apply_level(&mut self, side: Side, price: Price, qty: Qty, events: &mut Vec<MarketEvent>) {
        let book_side = match side {
            Side::Buy => &mut self.bids,
            _ => &mut self.asks,
        };
        if qty == 0 {
            if book_side.remove(&price).is_some() {
                events.push(level_event_for(
                    self.ticker_id,
                    MarketEventKind::Cancel,
                    side,
                    price,
                    0,
                ));
            }
        } else {
            book_side.insert(price, qty);
            events.push(level_event_for(
                self.ticker_id,
                MarketEventKind::Add,
                side,
                price,
                qty,
            ));
        }
    }

    fn level_event(
        &self,
        kind: MarketEventKind,
        side: Side,
        price: Price,
        qty: Qty,
    ) -> MarketEvent {
        level_event_for(self.ticker_id, kind, side, price, qty)
    }
}

fn level_event_for(
    ticker_id: TickerId,
    kind: MarketEventKind,
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
