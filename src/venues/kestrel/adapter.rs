// src/venues/kestrel/adapter.rs
//
// Kestrel market-data facade. Owns the token manager, the per-instrument
// diff books and the token <-> internal-ticker mapping; the pump task
// drains the decode queue, routes ticks to books and forwards normalized
// events into the engine-bound ring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::books::depth_diff::{Bbo, DiffBook};
use crate::instruments::TokenManager;
use crate::runtime::ShutdownFlag;
use crate::spsc::{Consumer, Producer};
use crate::types::{MarketEvent, Price, TickerId};
use crate::venues::kestrel::wire::{KestrelTick, TickKind};
use crate::venues::kestrel::ws::{KestrelWsHandle, StreamingMode};

const IDLE_SLEEP: Duration = Duration::from_micros(200);
const DRAIN_BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct KestrelAdapterConfig {
    /// How often the pump asks the token manager whether the catalog is
    /// stale.
    pub refresh_check_interval: Duration,
    pub default_mode: StreamingMode,
}

impl Default for KestrelAdapterConfig {
    fn default() -> Self {
        Self {
            refresh_check_interval: Duration::from_secs(60),
            default_mode: StreamingMode::Full,
        }
    }
}

#[derive(Default)]
struct AdapterState {
    books: HashMap<TickerId, DiffBook>,
    token_to_ticker: HashMap<i32, TickerId>,
    ticker_to_token: HashMap<TickerId, i32>,
    last_price: HashMap<TickerId, Price>,
    /// Events produced outside the pump (e.g. the final CLEAR of an
    /// unsubscribe), drained into the engine queue by the pump.
    deferred: Vec<MarketEvent>,
}

pub struct KestrelAdapter {
    cfg: KestrelAdapterConfig,
    tokens: Arc<TokenManager>,
    ws: KestrelWsHandle,
    state: Mutex<AdapterState>,
}

impl KestrelAdapter {
    pub fn new(
        cfg: KestrelAdapterConfig,
        tokens: Arc<TokenManager>,
        ws: KestrelWsHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            tokens,
            ws,
            state: Mutex::new(AdapterState::default()),
        })
    }

    /// Resolve `venue_symbol`, create the book, register the mapping in
    /// both directions and (when connected) send the subscribe control
    /// message. Returns the venue token.
    pub fn subscribe(&self, venue_symbol: &str, ticker_id: TickerId) -> Result<i32> {
        let token = self
            .tokens
            .token_for(venue_symbol)
            .ok_or_else(|| anyhow!("unknown venue symbol {venue_symbol}"))?;
        {
            let mut state = self.state.lock().unwrap();
            state.books.entry(ticker_id).or_insert_with(|| DiffBook::new(ticker_id));
            state.token_to_ticker.insert(token, ticker_id);
            state.ticker_to_token.insert(ticker_id, token);
        }
        self.ws.subscribe(vec![token], self.cfg.default_mode);
        info!(symbol = venue_symbol, token, ticker_id, "subscribed");
        Ok(token)
    }

    /// Inverse of subscribe. Emits a final CLEAR into the engine queue so
    /// the engine drops its shadow book.
    pub fn unsubscribe(&self, ticker_id: TickerId) -> Result<()> {
        let token = {
            let mut state = self.state.lock().unwrap();
            let Some(token) = state.ticker_to_token.remove(&ticker_id) else {
                return Err(anyhow!("ticker {ticker_id} not subscribed"));
            };
            state.token_to_ticker.remove(&token);
            if let Some(mut book) = state.books.remove(&ticker_id) {
                let events = book.clear();
                state.deferred.extend(events);
            } else {
                state.deferred.push(MarketEvent::clear(ticker_id));
            }
            token
        };
        self.ws.unsubscribe(vec![token]);
        info!(token, ticker_id, "unsubscribed");
        Ok(())
    }

    /// Read-only best bid/offer for an internal ticker.
    pub fn bbo(&self, ticker_id: TickerId) -> Option<Bbo> {
        self.state
            .lock()
            .unwrap()
            .books
            .get(&ticker_id)
            .map(|b| b.bbo())
    }

    pub fn last_price(&self, ticker_id: TickerId) -> Option<Price> {
        self.state.lock().unwrap().last_price.get(&ticker_id).copied()
    }

    /// Read-only access to a book under the facade lock.
    pub fn with_book<R>(&self, ticker_id: TickerId, f: impl FnOnce(&DiffBook) -> R) -> Option<R> {
        self.state.lock().unwrap().books.get(&ticker_id).map(f)
    }

    pub fn subscribed_tickers(&self) -> Vec<TickerId> {
        let mut out: Vec<TickerId> = self
            .state
            .lock()
            .unwrap()
            .ticker_to_token
            .keys()
            .copied()
            .collect();
        out.sort_unstable();
        out
    }

    /// Reconnect hook: clear every book and return the CLEAR bursts that
    /// must precede the re-ADDs of the fresh feed.
    fn clear_all_books(&self) -> Vec<MarketEvent> {
        let mut state = self.state.lock().unwrap();
        let mut events = Vec::new();
        for book in state.books.values_mut() {
            events.extend(book.clear());
        }
        events
    }

    /// Market-data pump. Runs until shutdown: consumes decoded ticks,
    /// routes them to books, forwards normalized events and periodically
    /// checks the catalog refresh gate.
    pub async fn run_pump(
        self: Arc<Self>,
        mut ticks: Consumer<KestrelTick>,
        mut events_out: Producer<MarketEvent>,
        mut connected_rx: mpsc::UnboundedReceiver<u64>,
        shutdown: ShutdownFlag,
    ) {
        let mut last_refresh_check = Instant::now();
        let mut dropped: u64 = 0;
        info!("kestrel market-data pump started");

        while !shutdown.is_requested() {
            let mut made_progress = false;

            // Session (re)connect: the feed restarts from scratch, so the
            // engine-side shadow books must too.
            while let Ok(attempt) = connected_rx.try_recv() {
                let events = self.clear_all_books();
                if !events.is_empty() {
                    info!(attempt, cleared = events.len(), "session reconnect, clearing books");
                }
                push_all(&mut events_out, events, &mut dropped);
                made_progress = true;
            }

            let deferred = {
                let mut state = self.state.lock().unwrap();
                std::mem::take(&mut state.deferred)
            };
            if !deferred.is_empty() {
                push_all(&mut events_out, deferred, &mut dropped);
                made_progress = true;
            }

            for _ in 0..DRAIN_BATCH {
                let Some(tick) = ticks.pop() else {
                    break;
                };
                made_progress = true;
                self.route_tick(&tick, &mut events_out, &mut dropped);
            }

            if last_refresh_check.elapsed() >= self.cfg.refresh_check_interval {
                last_refresh_check = Instant::now();
                if self.tokens.refresh_due() {
                    if let Err(err) = self.tokens.refresh().await {
                        warn!(error = %err, "instrument catalog refresh failed");
                    }
                }
            }

            if !made_progress {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
        info!(dropped, "kestrel market-data pump stopped");
    }

    fn route_tick(
        &self,
        tick: &KestrelTick,
        events_out: &mut Producer<MarketEvent>,
        dropped: &mut u64,
    ) {
        let mut state = self.state.lock().unwrap();
        let Some(&ticker_id) = state.token_to_ticker.get(&tick.token) else {
            debug!(token = tick.token, "tick for unmapped token");
            return;
        };
        state.last_price.insert(ticker_id, tick.last_price);

        if tick.kind != TickKind::Full {
            return;
        }
        let Some(book) = state.books.get_mut(&ticker_id) else {
            return;
        };
        let events = book.apply(&tick.depth_view(), tick.recv_ns);
        drop(state);
        push_all(events_out, events, dropped);
    }
}

impl crate::strategy::MarketView for KestrelAdapter {
    fn mid(&self, ticker_id: TickerId) -> Option<f64> {
        self.bbo(ticker_id).and_then(|bbo| bbo.mid())
    }
}

fn push_all(out: &mut Producer<MarketEvent>, events: Vec<MarketEvent>, dropped: &mut u64) {
    for event in events {
        if out.push(event).is_err() {
            *dropped += 1;
            warn!(total_dropped = *dropped, "engine event queue full, dropping event");
        }
    }
}
