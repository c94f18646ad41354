// src/strategy/bracket.rs
//
// Liquidity-taker overlay with bracket orders: an entry order paired with
// a stop-loss and a profit-target leg. The overlay intercepts the
// normalized response stream to drive the bracket state machine, and runs
// a chain of pre-trade gates (trading hours, circuit limits, VWAP,
// visible-volume percentile, lot size) before any entry goes out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::NaiveTime;
use tracing::{debug, info, warn};

use crate::books::depth_diff::Bbo;
use crate::config::{SessionConfig, StrategyParams};
use crate::spsc::Producer;
use crate::types::{
    ClientId, ClientRequest, ClientRequestKind, ClientResponse, ClientResponseKind, OrderId,
    Price, Qty, RejectReason, Side, TickerId,
};

/// Read-only market view the strategy consults for circuit-limit
/// refreshes; implemented by the adapter facades.
pub trait MarketView: Send + Sync {
    /// Mid price in internal fixed-point units.
    fn mid(&self, ticker_id: TickerId) -> Option<f64>;
}

#[derive(Debug, Clone)]
pub struct TakerParams {
    pub use_bracket_orders: bool,
    pub stop_loss_percent: f64,
    pub target_percent: f64,
    pub use_vwap_filter: bool,
    pub vwap_threshold: f64,
    pub min_volume_percentile: u8,
    pub enforce_trading_hours: bool,
    pub enforce_circuit_limits: bool,
    pub trading_start: NaiveTime,
    pub trading_end: NaiveTime,
}

impl TakerParams {
    pub fn from_config(cfg: &SessionConfig) -> Result<Self> {
        let params: &StrategyParams = &cfg.trading_system.strategy.parameters;
        Ok(Self {
            use_bracket_orders: params.use_bracket_orders,
            stop_loss_percent: params.stop_loss_percent,
            target_percent: params.target_percent,
            use_vwap_filter: params.use_vwap_filter,
            vwap_threshold: params.vwap_threshold,
            min_volume_percentile: params.min_volume_percentile,
            enforce_trading_hours: cfg.risk.enforce_trading_hours,
            enforce_circuit_limits: cfg.risk.enforce_circuit_limits,
            trading_start: NaiveTime::parse_from_str(&params.trading_start_time, "%H:%M:%S")
                .context("parsing trading_start_time")?,
            trading_end: NaiveTime::parse_from_str(&params.trading_end_time, "%H:%M:%S")
                .context("parsing trading_end_time")?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TickerParams {
    /// Unit order size.
    pub clip: Qty,
    /// Aggressor-qty-ratio threshold that arms an entry.
    pub threshold: f64,
}

/// Bracket lifecycle record. Exactly one of `sl_triggered` / `tp_triggered`
/// ends up true in a lifecycle where the entry fills and one exit leg
/// fills; `exit_ns` is written for observability only.
#[derive(Debug, Clone)]
pub struct BracketOrder {
    pub entry_id: OrderId,
    pub sl_id: OrderId,
    pub tp_id: OrderId,
    pub ticker_id: TickerId,
    pub side: Side,
    pub entry_px: Price,
    pub sl_px: Price,
    pub tp_px: Price,
    pub qty: Qty,
    pub entry_filled: bool,
    pub sl_triggered: bool,
    pub tp_triggered: bool,
    pub creation_ns: u64,
    pub fill_ns: u64,
    pub exit_ns: u64,
}

#[derive(Debug, Clone, Copy)]
struct CircuitLimits {
    upper: f64,
    lower: f64,
    /// Retained for observability.
    #[allow(dead_code)]
    updated_ns: u64,
}

const INDEX_CIRCUIT_PCT: f64 = 0.20;
const DEFAULT_CIRCUIT_PCT: f64 = 0.10;

pub struct LiquidityTaker {
    client_id: ClientId,
    params: TakerParams,
    per_ticker: HashMap<TickerId, TickerParams>,
    index_tickers: HashSet<TickerId>,
    lot_sizes: HashMap<TickerId, Qty>,
    market: Arc<dyn MarketView>,
    requests: Mutex<Producer<ClientRequest>>,
    brackets: Mutex<HashMap<OrderId, BracketOrder>>,
    circuit_limits: Mutex<HashMap<TickerId, CircuitLimits>>,
    vwap: Mutex<HashMap<TickerId, f64>>,
    volume_percentile: Mutex<HashMap<TickerId, u8>>,
    next_order_id: AtomicU64,
    clock_ns: Arc<dyn Fn() -> u64 + Send + Sync>,
    time_of_day: Arc<dyn Fn() -> NaiveTime + Send + Sync>,
}

impl LiquidityTaker {
    pub fn new(
        client_id: ClientId,
        params: TakerParams,
        per_ticker: HashMap<TickerId, TickerParams>,
        market: Arc<dyn MarketView>,
        requests: Producer<ClientRequest>,
    ) -> Self {
        let taker = Self {
            client_id,
            params,
            per_ticker,
            index_tickers: HashSet::new(),
            lot_sizes: HashMap::new(),
            market,
            requests: Mutex::new(requests),
            brackets: Mutex::new(HashMap::new()),
            circuit_limits: Mutex::new(HashMap::new()),
            vwap: Mutex::new(HashMap::new()),
            volume_percentile: Mutex::new(HashMap::new()),
            next_order_id: AtomicU64::new(1),
            clock_ns: Arc::new(system_ns),
            time_of_day: Arc::new(|| chrono::Local::now().time()),
        };
        taker.refresh_circuit_limits();
        taker
    }

    pub fn mark_index(&mut self, ticker_id: TickerId) {
        self.index_tickers.insert(ticker_id);
    }

    pub fn set_lot_size(&mut self, ticker_id: TickerId, lot_size: Qty) {
        self.lot_sizes.insert(ticker_id, lot_size.max(1));
    }

    #[cfg(test)]
    pub(crate) fn with_clocks(
        mut self,
        clock_ns: Arc<dyn Fn() -> u64 + Send + Sync>,
        time_of_day: Arc<dyn Fn() -> NaiveTime + Send + Sync>,
    ) -> Self {
        self.clock_ns = clock_ns;
        self.time_of_day = time_of_day;
        self
    }

    pub fn bracket(&self, entry_id: OrderId) -> Option<BracketOrder> {
        self.brackets.lock().unwrap().get(&entry_id).cloned()
    }

    pub fn active_brackets(&self) -> usize {
        self.brackets.lock().unwrap().len()
    }

    /// Book update hook: refresh the VWAP approximation and the visible
    /// liquidity percentile for the ticker.
    pub fn on_book_update(&self, ticker_id: TickerId, bbo: &Bbo) {
        if !bbo.is_valid() {
            return;
        }
        let mid = (bbo.bid_price + bbo.ask_price) as f64 / 2.0;
        let displayed = (bbo.bid_qty + bbo.ask_qty) as f64;
        if displayed > 0.0 {
            // Mid weighted by displayed size; a proxy until per-trade
            // volume is tracked.
            self.vwap.lock().unwrap().insert(ticker_id, mid);
        }
        let percentile = quantize_volume_percentile(bbo.bid_qty + bbo.ask_qty);
        self.volume_percentile
            .lock()
            .unwrap()
            .insert(ticker_id, percentile);
    }

    /// Trade hook: when the aggressor-qty ratio crosses the per-ticker
    /// threshold, run the pre-trade gates and send an entry. Returns the
    /// entry order id when an order went out.
    pub fn on_trade(
        &self,
        ticker_id: TickerId,
        aggressor: Side,
        agg_qty_ratio: f64,
        bbo: &Bbo,
    ) -> Option<OrderId> {
        let ticker_params = self.per_ticker.get(&ticker_id)?;
        if !bbo.is_valid() || agg_qty_ratio < ticker_params.threshold {
            return None;
        }

        let (entry_side, entry_px) = match aggressor {
            Side::Buy => (Side::Buy, bbo.ask_price),
            Side::Sell => (Side::Sell, bbo.bid_price),
            Side::Invalid => return None,
        };

        if self.params.enforce_trading_hours && !self.within_trading_hours() {
            debug!(ticker_id, "outside trading hours, not taking");
            return None;
        }
        if self.params.enforce_circuit_limits
            && !self.within_circuit_limits(ticker_id, entry_px, entry_side)
        {
            info!(ticker_id, px = entry_px, "circuit limit gate rejected entry");
            return None;
        }
        if self.params.use_vwap_filter && !self.vwap_ok(ticker_id, entry_px, entry_side) {
            debug!(ticker_id, px = entry_px, "vwap gate rejected entry");
            return None;
        }
        if !self.volume_ok(ticker_id) {
            debug!(ticker_id, "volume gate rejected entry");
            return None;
        }
        let qty = self.adjust_to_lot(ticker_id, ticker_params.clip);

        let (sl_px, tp_px) = bracket_prices(
            entry_side,
            entry_px,
            self.params.stop_loss_percent,
            self.params.target_percent,
        );
        if self.params.use_bracket_orders {
            Some(self.send_bracket(ticker_id, entry_side, entry_px, qty, sl_px, tp_px))
        } else {
            Some(self.send_order(ticker_id, entry_side, entry_px, qty))
        }
    }

    /// Record a bracket and emit its entry order.
    pub fn send_bracket(
        &self,
        ticker_id: TickerId,
        side: Side,
        entry_px: Price,
        qty: Qty,
        sl_px: Price,
        tp_px: Price,
    ) -> OrderId {
        let entry_id = self.alloc_order_id();
        let bracket = BracketOrder {
            entry_id,
            sl_id: 0,
            tp_id: 0,
            ticker_id,
            side,
            entry_px,
            sl_px,
            tp_px,
            qty,
            entry_filled: false,
            sl_triggered: false,
            tp_triggered: false,
            creation_ns: (self.clock_ns)(),
            fill_ns: 0,
            exit_ns: 0,
        };
        self.brackets.lock().unwrap().insert(entry_id, bracket);
        self.emit_new(entry_id, ticker_id, side, entry_px, qty);
        info!(
            entry_id,
            ticker_id,
            side = %side,
            entry_px,
            sl_px,
            tp_px,
            qty,
            "bracket entry sent"
        );
        entry_id
    }

    /// Plain (non-bracket) limit order.
    pub fn send_order(&self, ticker_id: TickerId, side: Side, px: Price, qty: Qty) -> OrderId {
        let order_id = self.alloc_order_id();
        self.emit_new(order_id, ticker_id, side, px, qty);
        order_id
    }

    /// Market order: price 0 on the wire.
    pub fn send_market_order(&self, ticker_id: TickerId, side: Side, qty: Qty) -> OrderId {
        let order_id = self.alloc_order_id();
        self.emit_new(order_id, ticker_id, side, 0, qty);
        order_id
    }

    /// Response-stream interception driving the bracket state machine.
    pub fn on_response(&self, resp: &ClientResponse) {
        match resp.kind {
            ClientResponseKind::Filled | ClientResponseKind::PartiallyFilled => {
                self.on_fill(resp);
            }
            ClientResponseKind::Rejected => {
                warn!(%resp, "order rejected");
                if resp.reject_reason == RejectReason::InvalidPrice {
                    // The band moved; refresh the cached limits.
                    self.refresh_circuit_limits();
                }
            }
            ClientResponseKind::CancelRejected => {
                // Expected when the sibling leg filled before the cancel
                // landed.
                debug!(%resp, "cancel rejected");
            }
            _ => {}
        }
    }

    fn on_fill(&self, resp: &ClientResponse) {
        let mut to_send: Vec<ClientRequest> = Vec::new();
        {
            let mut brackets = self.brackets.lock().unwrap();
            if let Some(bracket) = brackets.get_mut(&resp.order_id) {
                if !bracket.entry_filled {
                    bracket.entry_filled = true;
                    bracket.fill_ns = (self.clock_ns)();
                    bracket.sl_id = self.alloc_order_id();
                    bracket.tp_id = self.alloc_order_id();
                    let exit_side = bracket.side.opposite();
                    let exit_qty = if resp.exec_qty > 0 {
                        resp.exec_qty
                    } else {
                        bracket.qty
                    };
                    info!(
                        entry_id = bracket.entry_id,
                        sl_id = bracket.sl_id,
                        tp_id = bracket.tp_id,
                        "entry filled, posting contingent legs"
                    );
                    to_send.push(self.new_request(
                        bracket.sl_id,
                        bracket.ticker_id,
                        exit_side,
                        bracket.sl_px,
                        exit_qty,
                    ));
                    to_send.push(self.new_request(
                        bracket.tp_id,
                        bracket.ticker_id,
                        exit_side,
                        bracket.tp_px,
                        exit_qty,
                    ));
                }
            } else {
                // Not an entry: check the contingent legs.
                for bracket in brackets.values_mut() {
                    if resp.order_id == bracket.sl_id && bracket.sl_id != 0 {
                        if !bracket.sl_triggered {
                            bracket.sl_triggered = true;
                            bracket.exit_ns = (self.clock_ns)();
                            info!(
                                entry_id = bracket.entry_id,
                                sl_id = bracket.sl_id,
                                "stop loss filled, canceling target"
                            );
                            to_send.push(self.cancel_request(bracket.tp_id, bracket.ticker_id));
                        }
                        break;
                    }
                    if resp.order_id == bracket.tp_id && bracket.tp_id != 0 {
                        if !bracket.tp_triggered {
                            bracket.tp_triggered = true;
                            bracket.exit_ns = (self.clock_ns)();
                            info!(
                                entry_id = bracket.entry_id,
                                tp_id = bracket.tp_id,
                                "target filled, canceling stop loss"
                            );
                            to_send.push(self.cancel_request(bracket.sl_id, bracket.ticker_id));
                        }
                        break;
                    }
                }
            }
        }
        for request in to_send {
            self.push_request(request);
        }
    }

    // ---- pre-trade gates -------------------------------------------------

    pub fn within_trading_hours(&self) -> bool {
        let now = (self.time_of_day)();
        now >= self.params.trading_start && now <= self.params.trading_end
    }

    /// BUY entries must stay at or below the upper circuit, SELL entries at
    /// or above the lower one. Unknown tickers pass.
    pub fn within_circuit_limits(&self, ticker_id: TickerId, px: Price, side: Side) -> bool {
        let limits = self.circuit_limits.lock().unwrap();
        let Some(limits) = limits.get(&ticker_id) else {
            return true;
        };
        match side {
            Side::Buy => (px as f64) <= limits.upper,
            Side::Sell => (px as f64) >= limits.lower,
            Side::Invalid => false,
        }
    }

    /// Reject entries chasing too far through the VWAP.
    pub fn vwap_ok(&self, ticker_id: TickerId, px: Price, side: Side) -> bool {
        let vwap = self.vwap.lock().unwrap();
        let Some(&vwap) = vwap.get(&ticker_id) else {
            return true;
        };
        if vwap <= 0.0 {
            return true;
        }
        let ratio = px as f64 / vwap;
        match side {
            Side::Buy => ratio <= 1.0 + self.params.vwap_threshold,
            Side::Sell => ratio >= 1.0 - self.params.vwap_threshold,
            Side::Invalid => false,
        }
    }

    pub fn volume_ok(&self, ticker_id: TickerId) -> bool {
        let percentiles = self.volume_percentile.lock().unwrap();
        let Some(&percentile) = percentiles.get(&ticker_id) else {
            return true;
        };
        percentile >= self.params.min_volume_percentile
    }

    /// Round down to the lot size, never below one lot.
    pub fn adjust_to_lot(&self, ticker_id: TickerId, qty: Qty) -> Qty {
        let Some(&lot) = self.lot_sizes.get(&ticker_id) else {
            return qty;
        };
        ((qty / lot) * lot).max(lot)
    }

    /// Recompute circuit limits from current mids: ±20% for indices, ±10%
    /// otherwise.
    pub fn refresh_circuit_limits(&self) {
        let now_ns = (self.clock_ns)();
        let mut limits = self.circuit_limits.lock().unwrap();
        for &ticker_id in self.per_ticker.keys() {
            let Some(mid) = self.market.mid(ticker_id) else {
                continue;
            };
            if mid <= 0.0 {
                continue;
            }
            let pct = if self.index_tickers.contains(&ticker_id) {
                INDEX_CIRCUIT_PCT
            } else {
                DEFAULT_CIRCUIT_PCT
            };
            limits.insert(
                ticker_id,
                CircuitLimits {
                    upper: mid * (1.0 + pct),
                    lower: mid * (1.0 - pct),
                    updated_ns: now_ns,
                },
            );
            debug!(
                ticker_id,
                lower = mid * (1.0 - pct),
                upper = mid * (1.0 + pct),
                "circuit limits refreshed"
            );
        }
    }

    // ---- plumbing --------------------------------------------------------

    fn alloc_order_id(&self) -> OrderId {
        self.next_order_id.fetch_add(1, Ordering::Relaxed)
    }

    fn new_request(
        &self,
        order_id: OrderId,
        ticker_id: TickerId,
        side: Side,
        price: Price,
        qty: Qty,
    ) -> ClientRequest {
        ClientRequest {
            kind: ClientRequestKind::New,
            client_id: self.client_id,
            order_id,
            ticker_id,
            side,
            price,
            qty,
        }
    }

    fn cancel_request(&self, order_id: OrderId, ticker_id: TickerId) -> ClientRequest {
        ClientRequest {
            kind: ClientRequestKind::Cancel,
            client_id: self.client_id,
            order_id,
            ticker_id,
            side: Side::Invalid,
            price: 0,
            qty: 0,
        }
    }

    fn emit_new(&self, order_id: OrderId, ticker_id: TickerId, side: Side, px: Price, qty: Qty) {
        self.push_request(self.new_request(order_id, ticker_id, side, px, qty));
    }

    fn push_request(&self, request: ClientRequest) {
        if self.requests.lock().unwrap().push(request).is_err() {
            warn!(%request, "request queue full, dropping");
        }
    }
}

/// Stop-loss and target prices from the entry side and the configured
/// percentages.
pub fn bracket_prices(side: Side, entry_px: Price, sl_pct: f64, tp_pct: f64) -> (Price, Price) {
    let px = entry_px as f64;
    match side {
        Side::Buy => (
            (px * (1.0 - sl_pct / 100.0)) as Price,
            (px * (1.0 + tp_pct / 100.0)) as Price,
        ),
        _ => (
            (px * (1.0 + sl_pct / 100.0)) as Price,
            (px * (1.0 - tp_pct / 100.0)) as Price,
        ),
    }
}

/// Visible-liquidity percentile quantized from displayed size.
pub fn quantize_volume_percentile(displayed: u32) -> u8 {
    match displayed {
        v if v > 10_000 => 90,
        v if v > 5_000 => 75,
        v if v > 1_000 => 50,
        v if v > 500 => 25,
        _ => 10,
    }
}

fn system_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spsc::{self, Consumer};

    struct StaticView(HashMap<TickerId, f64>);

    impl MarketView for StaticView {
        fn mid(&self, ticker_id: TickerId) -> Option<f64> {
            self.0.get(&ticker_id).copied()
        }
    }

    fn params() -> TakerParams {
        TakerParams {
            use_bracket_orders: true,
            stop_loss_percent: 1.0,
            target_percent: 2.0,
            use_vwap_filter: false,
            vwap_threshold: 0.01,
            min_volume_percentile: 0,
            enforce_trading_hours: false,
            enforce_circuit_limits: false,
            trading_start: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            trading_end: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        }
    }

    fn taker_with(
        params: TakerParams,
        mids: &[(TickerId, f64)],
    ) -> (LiquidityTaker, Consumer<ClientRequest>) {
        let (req_tx, req_rx) = spsc::channel::<ClientRequest>(64);
        let mut per_ticker = HashMap::new();
        per_ticker.insert(
            1,
            TickerParams {
                clip: 10,
                threshold: 0.6,
            },
        );
        let view = StaticView(mids.iter().copied().collect());
        let taker = LiquidityTaker::new(7, params, per_ticker, Arc::new(view), req_tx).with_clocks(
            Arc::new(|| 1_000),
            Arc::new(|| NaiveTime::from_hms_opt(10, 0, 0).unwrap()),
        );
        (taker, req_rx)
    }

    fn fill(order_id: OrderId, qty: Qty) -> ClientResponse {
        ClientResponse {
            kind: ClientResponseKind::Filled,
            reject_reason: RejectReason::None,
            client_id: 7,
            ticker_id: 1,
            order_id,
            side: Side::Buy,
            price: 50_000,
            exec_qty: qty,
            leaves_qty: 0,
        }
    }

    #[test]
    fn bracket_lifecycle_entry_fill_posts_exit_legs() {
        let (taker, mut req_rx) = taker_with(params(), &[]);

        // NEW BUY @ 500.00, qty 10, sl 495.00, tp 510.00.
        let entry_id = taker.send_bracket(1, Side::Buy, 50_000, 10, 49_500, 51_000);
        let entry = req_rx.pop().unwrap();
        assert_eq!(entry.kind, ClientRequestKind::New);
        assert_eq!(entry.order_id, entry_id);
        assert_eq!(entry.side, Side::Buy);
        assert_eq!(entry.price, 50_000);
        assert_eq!(entry.qty, 10);

        // Entry fill: two opposite-side NEWs at the bracket prices.
        taker.on_response(&fill(entry_id, 10));
        let sl = req_rx.pop().unwrap();
        let tp = req_rx.pop().unwrap();
        assert_eq!(sl.kind, ClientRequestKind::New);
        assert_eq!(sl.side, Side::Sell);
        assert_eq!(sl.price, 49_500);
        assert_eq!(sl.qty, 10);
        assert_eq!(tp.side, Side::Sell);
        assert_eq!(tp.price, 51_000);
        assert_eq!(tp.qty, 10);

        let bracket = taker.bracket(entry_id).unwrap();
        assert!(bracket.entry_filled);
        assert_eq!(bracket.sl_id, sl.order_id);
        assert_eq!(bracket.tp_id, tp.order_id);

        // A second fill report on the entry must not re-post the legs.
        taker.on_response(&fill(entry_id, 10));
        assert!(req_rx.pop().is_none());

        // Target leg fills: the stop loss gets canceled, exactly one
        // trigger flag set.
        taker.on_response(&fill(bracket.tp_id, 10));
        let cancel = req_rx.pop().unwrap();
        assert_eq!(cancel.kind, ClientRequestKind::Cancel);
        assert_eq!(cancel.order_id, bracket.sl_id);

        let done = taker.bracket(entry_id).unwrap();
        assert!(done.tp_triggered);
        assert!(!done.sl_triggered);
        assert!(done.exit_ns > 0);
    }

    #[test]
    fn stop_loss_fill_cancels_target() {
        let (taker, mut req_rx) = taker_with(params(), &[]);
        let entry_id = taker.send_bracket(1, Side::Sell, 50_000, 5, 50_500, 49_000);
        req_rx.pop().unwrap();
        taker.on_response(&fill(entry_id, 5));
        let sl = req_rx.pop().unwrap();
        let tp = req_rx.pop().unwrap();
        assert_eq!(sl.side, Side::Buy);

        taker.on_response(&fill(sl.order_id, 5));
        let cancel = req_rx.pop().unwrap();
        assert_eq!(cancel.kind, ClientRequestKind::Cancel);
        assert_eq!(cancel.order_id, tp.order_id);
        let done = taker.bracket(entry_id).unwrap();
        assert!(done.sl_triggered && !done.tp_triggered);
    }

    #[test]
    fn on_trade_respects_threshold_and_sides() {
        let (taker, mut req_rx) = taker_with(params(), &[]);
        let bbo = Bbo {
            bid_price: 49_990,
            bid_qty: 600,
            ask_price: 50_010,
            ask_qty: 600,
        };
        // Below threshold: nothing.
        assert!(taker.on_trade(1, Side::Buy, 0.5, &bbo).is_none());
        // Buy-side aggression enters at the ask.
        taker.on_trade(1, Side::Buy, 0.9, &bbo).unwrap();
        let entry = req_rx.pop().unwrap();
        assert_eq!(entry.side, Side::Buy);
        assert_eq!(entry.price, 50_010);
        // Sell-side aggression enters at the bid.
        taker.on_trade(1, Side::Sell, 0.9, &bbo).unwrap();
        let entry = req_rx.pop().unwrap();
        assert_eq!(entry.side, Side::Sell);
        assert_eq!(entry.price, 49_990);
    }

    #[test]
    fn trading_hours_gate() {
        let mut p = params();
        p.enforce_trading_hours = true;
        let (taker, _req_rx) = taker_with(p, &[]);
        // Injected clock says 10:00, inside the window.
        assert!(taker.within_trading_hours());

        let mut p = params();
        p.enforce_trading_hours = true;
        p.trading_start = NaiveTime::from_hms_opt(11, 0, 0).unwrap();
        p.trading_end = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let (taker, mut req_rx) = taker_with(p, &[]);
        assert!(!taker.within_trading_hours());
        let bbo = Bbo {
            bid_price: 49_990,
            bid_qty: 600,
            ask_price: 50_010,
            ask_qty: 600,
        };
        assert!(taker.on_trade(1, Side::Buy, 0.9, &bbo).is_none());
        assert!(req_rx.pop().is_none());
    }

    #[test]
    fn circuit_limit_gate_uses_index_width() {
        let mut p = params();
        p.enforce_circuit_limits = true;
        let (taker, _rx) = taker_with(p, &[(1, 50_000.0)]);
        taker.refresh_circuit_limits();
        // Non-index: +-10% of mid 500.00.
        assert!(taker.within_circuit_limits(1, 54_900, Side::Buy));
        assert!(!taker.within_circuit_limits(1, 55_100, Side::Buy));
        assert!(taker.within_circuit_limits(1, 45_100, Side::Sell));
        assert!(!taker.within_circuit_limits(1, 44_900, Side::Sell));

        let mut p = params();
        p.enforce_circuit_limits = true;
        let (mut taker, _rx) = taker_with(p, &[(1, 50_000.0)]);
        taker.mark_index(1);
        taker.refresh_circuit_limits();
        assert!(taker.within_circuit_limits(1, 59_900, Side::Buy));
        assert!(!taker.within_circuit_limits(1, 60_100, Side::Buy));
    }

    #[test]
    fn invalid_price_reject_refreshes_circuit_cache() {
        let mut p = params();
        p.enforce_circuit_limits = true;
        let (taker, _rx) = taker_with(p, &[(1, 50_000.0)]);
        {
            taker.circuit_limits.lock().unwrap().clear();
        }
        let resp = ClientResponse {
            kind: ClientResponseKind::Rejected,
            reject_reason: RejectReason::InvalidPrice,
            client_id: 7,
            ticker_id: 1,
            order_id: 99,
            side: Side::Buy,
            price: 50_000,
            exec_qty: 0,
            leaves_qty: 0,
        };
        taker.on_response(&resp);
        assert!(taker.circuit_limits.lock().unwrap().contains_key(&1));
    }

    #[test]
    fn vwap_gate_blocks_chasing_side_only() {
        let mut p = params();
        p.use_vwap_filter = true;
        p.vwap_threshold = 0.01;
        let (taker, _rx) = taker_with(p, &[]);
        taker.vwap.lock().unwrap().insert(1, 50_000.0);
        // 1% above VWAP is the limit for buys.
        assert!(taker.vwap_ok(1, 50_400, Side::Buy));
        assert!(!taker.vwap_ok(1, 50_600, Side::Buy));
        // Sells are unconstrained upward.
        assert!(taker.vwap_ok(1, 50_600, Side::Sell));
        assert!(!taker.vwap_ok(1, 49_400, Side::Sell));
    }

    #[test]
    fn volume_percentile_quantization_and_gate() {
        assert_eq!(quantize_volume_percentile(20_000), 90);
        assert_eq!(quantize_volume_percentile(7_000), 75);
        assert_eq!(quantize_volume_percentile(2_000), 50);
        assert_eq!(quantize_volume_percentile(600), 25);
        assert_eq!(quantize_volume_percentile(100), 10);

        let mut p = params();
        p.min_volume_percentile = 50;
        let (taker, _rx) = taker_with(p, &[]);
        let thin = Bbo {
            bid_price: 49_990,
            bid_qty: 100,
            ask_price: 50_010,
            ask_qty: 100,
        };
        taker.on_book_update(1, &thin);
        assert!(!taker.volume_ok(1));
        let deep = Bbo {
            bid_price: 49_990,
            bid_qty: 3_000,
            ask_price: 50_010,
            ask_qty: 3_000,
        };
        taker.on_book_update(1, &deep);
        assert!(taker.volume_ok(1));
    }

    #[test]
    fn lot_size_rounds_down_but_keeps_one_lot() {
        let (mut taker, _rx) = taker_with(params(), &[]);
        taker.set_lot_size(1, 50);
        assert_eq!(taker.adjust_to_lot(1, 175), 150);
        assert_eq!(taker.adjust_to_lot(1, 49), 50);
        assert_eq!(taker.adjust_to_lot(1, 100), 100);
        // Unknown ticker: unchanged.
        assert_eq!(taker.adjust_to_lot(2, 33), 33);
    }

    #[test]
    fn bracket_price_computation() {
        let (sl, tp) = bracket_prices(Side::Buy, 50_000, 1.0, 2.0);
        assert_eq!(sl, 49_500);
        assert_eq!(tp, 51_000);
        let (sl, tp) = bracket_prices(Side::Sell, 50_000, 1.0, 2.0);
        assert_eq!(sl, 50_500);
        assert_eq!(tp, 49_000);
    }

    #[test]
    fn market_order_uses_zero_price() {
        let (taker, mut req_rx) = taker_with(params(), &[]);
        taker.send_market_order(1, Side::Buy, 10);
        let req = req_rx.pop().unwrap();
        assert!(req.is_market());
    }
}
