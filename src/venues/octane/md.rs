// src/venues/octane/md.rs
//
// Octane market data: one WebSocket stream per (symbol, channel), the
// documented snapshot+delta synchronization protocol, and a single pump
// task that owns the delta books and forwards normalized events into the
// engine ring.
//
// Synchronization per symbol:
//   1. open the depth stream and buffer every arriving delta;
//   2. fetch a REST depth snapshot with lastUpdateId = S;
//   3. if the first buffered delta starts past S the snapshot is stale:
//      refetch;
//   4. install the snapshot, drain the buffer (discard u <= S, apply
//      contiguous, resync on gaps);
//   5. thereafter apply live deltas with the same gap check.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::books::delta::{DeltaBook, DeltaOutcome};
use crate::runtime::ShutdownFlag;
use crate::spsc::Producer;
use crate::types::{MarketEvent, TickerId};
use crate::venues::octane::wire::{
    parse_depth_snapshot, parse_depth_update, parse_trade, DepthSnapshot, DepthUpdate, TradeTick,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SNAPSHOT_RETRY: Duration = Duration::from_secs(1);
const MAX_BUFFERED_DELTAS: usize = 4096;

#[derive(Debug, Clone)]
pub struct OctaneMdConfig {
    /// Base stream endpoint, e.g. `wss://stream.octane.example:9443/ws`.
    pub ws_url: String,
    /// Base REST endpoint, e.g. `https://api.octane.example`.
    pub rest_url: String,
    pub depth_limit: usize,
}

impl OctaneMdConfig {
    pub fn depth_stream_url(&self, symbol: &str) -> String {
        format!("{}/{}@depth", self.ws_url, symbol.to_ascii_lowercase())
    }

    pub fn trade_stream_url(&self, symbol: &str) -> String {
        format!("{}/{}@trade", self.ws_url, symbol.to_ascii_lowercase())
    }

    pub fn snapshot_url(&self, symbol: &str) -> String {
        format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.rest_url, symbol, self.depth_limit
        )
    }
}

/// Messages from the per-stream socket tasks into the pump.
#[derive(Debug)]
pub enum FeedMessage {
    Depth(TickerId, DepthUpdate),
    Trade(TickerId, TradeTick),
    Disconnected(TickerId),
}

/// Outcome of installing a snapshot.
#[derive(Debug, PartialEq)]
pub enum SnapshotOutcome {
    /// Snapshot installed and buffer drained; events carry CLEAR + ADDs
    /// plus whatever the buffered deltas produced.
    Installed(Vec<MarketEvent>),
    /// Snapshot predates the buffered deltas; fetch a newer one.
    Stale,
    /// A gap surfaced while draining the buffer; the book was cleared and
    /// a fresh snapshot is needed.
    Resync(Vec<MarketEvent>),
}

/// Per-symbol synchronization state machine. Pure logic, driven by the
/// pump; owns the delta book and the pre-snapshot buffer.
pub struct SymbolSync {
    book: DeltaBook,
    buffer: VecDeque<DepthUpdate>,
    awaiting_snapshot: bool,
}

impl SymbolSync {
    pub fn new(ticker_id: TickerId) -> Self {
        Self {
            book: DeltaBook::new(ticker_id),
            buffer: VecDeque::new(),
            awaiting_snapshot: true,
        }
    }

    pub fn awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    pub fn last_update_id(&self) -> u64 {
        self.book.last_update_id()
    }

    pub fn book(&self) -> &DeltaBook {
        &self.book
    }

    /// Feed one delta. Returns the emitted events and whether a snapshot
    /// (re)fetch is required.
    pub fn on_delta(&mut self, update: DepthUpdate) -> (Vec<MarketEvent>, bool) {
        if self.awaiting_snapshot {
            if self.buffer.len() >= MAX_BUFFERED_DELTAS {
                warn!(
                    ticker = self.book.ticker_id(),
                    "delta buffer overflow, restarting sync"
                );
                self.buffer.clear();
            }
            self.buffer.push_back(update);
            return (Vec::new(), true);
        }
        match self.book.apply_delta(
            update.first_update_id,
            update.last_update_id,
            &update.bids,
            &update.asks,
        ) {
            DeltaOutcome::Applied(events) => (events, false),
            DeltaOutcome::Stale => (Vec::new(), false),
            DeltaOutcome::Gap => {
                warn!(
                    ticker = self.book.ticker_id(),
                    last = self.book.last_update_id(),
                    first = update.first_update_id,
                    "sequence gap, clearing book"
                );
                let events = self.book.clear();
                self.buffer.clear();
                self.awaiting_snapshot = true;
                (events, true)
            }
        }
    }

    /// Install a REST snapshot per the synchronization protocol.
    pub fn on_snapshot(&mut self, snapshot: &DepthSnapshot) -> SnapshotOutcome {
        if let Some(first) = self.buffer.front() {
            if snapshot.last_update_id < first.first_update_id {
                debug!(
                    ticker = self.book.ticker_id(),
                    snapshot = snapshot.last_update_id,
                    first_buffered = first.first_update_id,
                    "snapshot stale"
                );
                return SnapshotOutcome::Stale;
            }
        }
        let mut events =
            self.book
                .apply_snapshot(snapshot.last_update_id, &snapshot.bids, &snapshot.asks);

        while let Some(update) = self.buffer.pop_front() {
            match self.book.apply_delta(
                update.first_update_id,
                update.last_update_id,
                &update.bids,
                &update.asks,
            ) {
                DeltaOutcome::Applied(mut applied) => events.append(&mut applied),
                DeltaOutcome::Stale => {}
                DeltaOutcome::Gap => {
                    warn!(
                        ticker = self.book.ticker_id(),
                        "gap while draining buffered deltas, resyncing"
                    );
                    events.extend(self.book.clear());
                    self.buffer.clear();
                    self.awaiting_snapshot = true;
                    return SnapshotOutcome::Resync(events);
                }
            }
        }
        self.awaiting_snapshot = false;
        SnapshotOutcome::Installed(events)
    }

    /// Transport loss: forget everything and re-enter the snapshot
    /// protocol when deltas resume.
    pub fn on_disconnect(&mut self) -> Vec<MarketEvent> {
        self.buffer.clear();
        self.awaiting_snapshot = true;
        self.book.clear()
    }

    pub fn trade_event(&self, trade: &TradeTick) -> MarketEvent {
        self.book
            .trade_event(trade.price, trade.qty, trade.buyer_is_maker)
    }
}

pub struct OctaneMarketData {
    cfg: OctaneMdConfig,
    http: reqwest::Client,
    syncs: Mutex<HashMap<TickerId, SymbolSync>>,
    symbol_by_ticker: HashMap<TickerId, String>,
}

impl OctaneMarketData {
    pub fn new(cfg: OctaneMdConfig, instruments: &[(String, TickerId)]) -> Arc<Self> {
        let mut syncs = HashMap::new();
        let mut symbol_by_ticker = HashMap::new();
        for (symbol, ticker_id) in instruments {
            syncs.insert(*ticker_id, SymbolSync::new(*ticker_id));
            symbol_by_ticker.insert(*ticker_id, symbol.clone());
        }
        Arc::new(Self {
            cfg,
            http: reqwest::Client::new(),
            syncs: Mutex::new(syncs),
            symbol_by_ticker,
        })
    }

    pub fn last_update_id(&self, ticker_id: TickerId) -> Option<u64> {
        self.syncs
            .lock()
            .unwrap()
            .get(&ticker_id)
            .map(|s| s.last_update_id())
    }

    pub fn best_bid_ask(&self, ticker_id: TickerId) -> Option<(Option<(i64, u32)>, Option<(i64, u32)>)> {
        self.syncs
            .lock()
            .unwrap()
            .get(&ticker_id)
            .map(|s| (s.book().best_bid(), s.book().best_ask()))
    }

    /// Spawn one socket task per (symbol, channel). Returns the feed
    /// receiver the pump consumes.
    pub fn spawn_streams(
        self: &Arc<Self>,
        shutdown: &ShutdownFlag,
    ) -> mpsc::UnboundedReceiver<FeedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        for (&ticker_id, symbol) in &self.symbol_by_ticker {
            tokio::spawn(run_stream(
                self.cfg.depth_stream_url(symbol),
                symbol.clone(),
                ticker_id,
                StreamKind::Depth,
                tx.clone(),
                shutdown.clone(),
            ));
            tokio::spawn(run_stream(
                self.cfg.trade_stream_url(symbol),
                symbol.clone(),
                ticker_id,
                StreamKind::Trade,
                tx.clone(),
                shutdown.clone(),
            ));
        }
        rx
    }

    /// Pump task: drains the feed, drives the per-symbol sync machines and
    /// pushes normalized events into the engine ring.
    pub async fn run_pump(
        self: Arc<Self>,
        mut feed: mpsc::UnboundedReceiver<FeedMessage>,
        mut events_out: Producer<MarketEvent>,
        shutdown: ShutdownFlag,
    ) {
        let mut dropped: u64 = 0;
        info!("octane market-data pump started");

        while !shutdown.is_requested() {
            let message =
                match tokio::time::timeout(Duration::from_millis(250), feed.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(_) => continue,
                };
            match message {
                FeedMessage::Depth(ticker_id, update) => {
                    let (events, need_snapshot) = {
                        let mut syncs = self.syncs.lock().unwrap();
                        let Some(sync) = syncs.get_mut(&ticker_id) else {
                            continue;
                        };
                        sync.on_delta(update)
                    };
                    push_all(&mut events_out, events, &mut dropped);
                    if need_snapshot {
                        self.resync(ticker_id, &mut events_out, &mut dropped, &shutdown)
                            .await;
                    }
                }
                FeedMessage::Trade(ticker_id, trade) => {
                    let event = {
                        let syncs = self.syncs.lock().unwrap();
                        syncs.get(&ticker_id).map(|s| s.trade_event(&trade))
                    };
                    if let Some(event) = event {
                        push_all(&mut events_out, vec![event], &mut dropped);
                    }
                }
                FeedMessage::Disconnected(ticker_id) => {
                    let events = {
                        let mut syncs = self.syncs.lock().unwrap();
                        syncs.get_mut(&ticker_id).map(|s| s.on_disconnect())
                    };
                    if let Some(events) = events {
                        push_all(&mut events_out, events, &mut dropped);
                    }
                }
            }
        }
        info!(dropped, "octane market-data pump stopped");
    }

    /// Fetch snapshots until one installs, the documented stale-snapshot
    /// refetch loop included.
    async fn resync(
        &self,
        ticker_id: TickerId,
        events_out: &mut Producer<MarketEvent>,
        dropped: &mut u64,
        shutdown: &ShutdownFlag,
    ) {
        let Some(symbol) = self.symbol_by_ticker.get(&ticker_id) else {
            return;
        };
        while !shutdown.is_requested() {
            let snapshot = match self.fetch_snapshot(symbol).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "snapshot fetch failed");
                    tokio::time::sleep(SNAPSHOT_RETRY).await;
                    continue;
                }
            };
            let outcome = {
                let mut syncs = self.syncs.lock().unwrap();
                let Some(sync) = syncs.get_mut(&ticker_id) else {
                    return;
                };
                sync.on_snapshot(&snapshot)
            };
            match outcome {
                SnapshotOutcome::Installed(events) => {
                    info!(
                        symbol = %symbol,
                        last_update_id = snapshot.last_update_id,
                        "depth snapshot installed"
                    );
                    push_all(events_out, events, dropped);
                    return;
                }
                SnapshotOutcome::Stale => continue,
                SnapshotOutcome::Resync(events) => {
                    push_all(events_out, events, dropped);
                    continue;
                }
            }
        }
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<DepthSnapshot> {
        let url = self.cfg.snapshot_url(symbol);
        let body = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("depth snapshot request")?
            .error_for_status()
            .context("depth snapshot status")?
            .text()
            .await
            .context("depth snapshot body")?;
        parse_depth_snapshot(&body).context("depth snapshot parse")
    }
}

impl crate::strategy::MarketView for OctaneMarketData {
    fn mid(&self, ticker_id: TickerId) -> Option<f64> {
        let (bid, ask) = self.best_bid_ask(ticker_id)?;
        match (bid, ask) {
            (Some((bid_px, _)), Some((ask_px, _))) => Some((bid_px + ask_px) as f64 / 2.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Depth,
    Trade,
}

/// One socket, one stream, reconnect with capped backoff for life.
async fn run_stream(
    url: String,
    symbol: String,
    ticker_id: TickerId,
    kind: StreamKind,
    tx: mpsc::UnboundedSender<FeedMessage>,
    shutdown: ShutdownFlag,
) {
    let mut backoff = INITIAL_BACKOFF;
    while !shutdown.is_requested() {
        let mut ws = match connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!(url = %url, error = %err, "stream connect failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        info!(url = %url, "stream open");
        backoff = INITIAL_BACKOFF;

        loop {
            let message =
                match tokio::time::timeout(Duration::from_millis(250), ws.next()).await {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(err))) => {
                        warn!(url = %url, error = %err, "stream read error");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        if shutdown.is_requested() {
                            return;
                        }
                        continue;
                    }
                };
            let text = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => break,
                _ => continue,
            };
            let sent = match kind {
                StreamKind::Depth => match parse_depth_update(&text) {
                    Some(update) => {
                        if !update.symbol.is_empty()
                            && !update.symbol.eq_ignore_ascii_case(&symbol)
                        {
                            continue;
                        }
                        tx.send(FeedMessage::Depth(ticker_id, update)).is_ok()
                    }
                    None => {
                        debug!(symbol = %symbol, "unparsed depth frame");
                        continue;
                    }
                },
                StreamKind::Trade => match parse_trade(&text) {
                    Some(trade) => tx.send(FeedMessage::Trade(ticker_id, trade)).is_ok(),
                    None => continue,
                },
            };
            if !sent {
                return;
            }
        }
        let _ = tx.send(FeedMessage::Disconnected(ticker_id));
        info!(url = %url, "stream disconnected, scheduling reconnect");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketEventKind, Side};

    fn delta(first: u64, last: u64, bids: &[(i64, u32)], asks: &[(i64, u32)]) -> DepthUpdate {
        DepthUpdate {
            symbol: "BTCUSDT".to_string(),
            event_time: None,
            first_update_id: first,
            last_update_id: last,
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        }
    }

    fn snapshot(last_update_id: u64, bids: &[(i64, u32)], asks: &[(i64, u32)]) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id,
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        }
    }

    #[test]
    fn cold_start_buffers_then_installs() {
        let mut sync = SymbolSync::new(1);

        // Deltas arrive before the snapshot and are buffered.
        let (events, need) = sync.on_delta(delta(5, 6, &[(9_990, 1)], &[]));
        assert!(events.is_empty());
        assert!(need);
        let (events, need) = sync.on_delta(delta(7, 9, &[(10_000, 2)], &[(10_010, 3)]));
        assert!(events.is_empty());
        assert!(need);

        // Snapshot with lastUpdateId=7: first buffered delta (u=6) is
        // discarded, second (U=7 <= 7+1) applies.
        let outcome = sync.on_snapshot(&snapshot(7, &[(9_995, 4)], &[(10_020, 5)]));
        let SnapshotOutcome::Installed(events) = outcome else {
            panic!("expected install, got {outcome:?}");
        };
        assert_eq!(sync.last_update_id(), 9);
        assert!(!sync.awaiting_snapshot());

        // CLEAR, two snapshot ADDs, then the delta's ADDs.
        assert_eq!(events[0].kind, MarketEventKind::Clear);
        let adds: Vec<_> = events[1..]
            .iter()
            .map(|e| (e.kind, e.side, e.price))
            .collect();
        assert_eq!(
            adds,
            vec![
                (MarketEventKind::Add, Side::Buy, 9_995),
                (MarketEventKind::Add, Side::Sell, 10_020),
                (MarketEventKind::Add, Side::Buy, 10_000),
                (MarketEventKind::Add, Side::Sell, 10_010),
            ]
        );
    }

    #[test]
    fn stale_snapshot_triggers_refetch() {
        let mut sync = SymbolSync::new(1);
        sync.on_delta(delta(100, 101, &[], &[]));
        assert_eq!(
            sync.on_snapshot(&snapshot(99, &[], &[])),
            SnapshotOutcome::Stale
        );
        assert!(sync.awaiting_snapshot());
    }

    #[test]
    fn live_gap_clears_book_and_requests_snapshot() {
        let mut sync = SymbolSync::new(1);
        let outcome = sync.on_snapshot(&snapshot(100, &[(10_000, 1)], &[]));
        assert!(matches!(outcome, SnapshotOutcome::Installed(_)));

        // Contiguous delta applies.
        let (events, need) = sync.on_delta(delta(101, 102, &[(10_005, 2)], &[]));
        assert!(!need);
        assert_eq!(events.len(), 1);
        assert_eq!(sync.last_update_id(), 102);

        // Gap: CLEAR emitted before any later ADD, buffer cleared, resync.
        let (events, need) = sync.on_delta(delta(105, 108, &[(10_010, 1)], &[]));
        assert!(need);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MarketEventKind::Clear);
        assert!(sync.awaiting_snapshot());
        assert_eq!(sync.last_update_id(), 0);
    }

    #[test]
    fn stale_live_delta_is_discarded_silently() {
        let mut sync = SymbolSync::new(1);
        sync.on_snapshot(&snapshot(50, &[], &[]));
        let (events, need) = sync.on_delta(delta(40, 50, &[(10_000, 1)], &[]));
        assert!(events.is_empty());
        assert!(!need);
        assert_eq!(sync.last_update_id(), 50);
    }

    #[test]
    fn gap_while_draining_buffer_resyncs() {
        let mut sync = SymbolSync::new(1);
        sync.on_delta(delta(8, 9, &[(10_000, 1)], &[]));
        sync.on_delta(delta(20, 21, &[(10_010, 1)], &[]));
        let outcome = sync.on_snapshot(&snapshot(8, &[(9_990, 1)], &[]));
        let SnapshotOutcome::Resync(events) = outcome else {
            panic!("expected resync, got {outcome:?}");
        };
        assert_eq!(events.last().unwrap().kind, MarketEventKind::Clear);
        assert!(sync.awaiting_snapshot());
    }

    #[test]
    fn disconnect_resets_to_snapshot_protocol() {
        let mut sync = SymbolSync::new(1);
        sync.on_snapshot(&snapshot(10, &[(10_000, 1)], &[]));
        let events = sync.on_disconnect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MarketEventKind::Clear);
        assert!(sync.awaiting_snapshot());
    }

    #[test]
    fn trades_map_maker_flag_to_aggressor_side() {
        let sync = SymbolSync::new(2);
        let sell = sync.trade_event(&TradeTick {
            price: 10_000,
            qty: 5,
            buyer_is_maker: true,
        });
        assert_eq!(sell.kind, MarketEventKind::Trade);
        assert_eq!(sell.side, Side::Sell);
        let buy = sync.trade_event(&TradeTick {
            price: 10_000,
            qty: 5,
            buyer_is_maker: false,
        });
        assert_eq!(buy.side, Side::Buy);
    }

    #[test]
    fn stream_urls_follow_wire_contract() {
        let cfg = OctaneMdConfig {
            ws_url: "wss://stream.octane.example:9443/ws".to_string(),
            rest_url: "https://api.octane.example".to_string(),
            depth_limit: 1000,
        };
        assert_eq!(
            cfg.depth_stream_url("BTCUSDT"),
            "wss://stream.octane.example:9443/ws/btcusdt@depth"
        );
        assert_eq!(
            cfg.trade_stream_url("BTCUSDT"),
            "wss://stream.octane.example:9443/ws/btcusdt@trade"
        );
        assert_eq!(
            cfg.snapshot_url("BTCUSDT"),
            "https://api.octane.example/api/v3/depth?symbol=BTCUSDT&limit=1000"
        );
    }
}
