// src/venues/paper.rs
//
// Paper-trading simulator shared by both order gateways. NEWs are
// acknowledged immediately and a fill is scheduled on an internal timer
// queue drained by the gateway run loop; no network I/O and no detached
// task per order, so shutdown stays deterministic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::config::PaperTradingConfig;
use crate::types::{
    ClientRequest, ClientResponse, ClientResponseKind, OrderId, Price, RejectReason,
};

struct PendingFill {
    due: Instant,
    seq: u64,
    fill: ClientResponse,
}

impl PartialEq for PendingFill {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for PendingFill {}
impl PartialOrd for PendingFill {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingFill {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

pub struct PaperEngine {
    cfg: PaperTradingConfig,
    rng: StdRng,
    pending: BinaryHeap<Reverse<PendingFill>>,
    canceled: HashSet<OrderId>,
    seq: u64,
}

impl PaperEngine {
    pub fn new(cfg: PaperTradingConfig) -> Self {
        Self::with_rng(cfg, StdRng::from_entropy())
    }

    pub fn with_seed(cfg: PaperTradingConfig, seed: u64) -> Self {
        Self::with_rng(cfg, StdRng::seed_from_u64(seed))
    }

    fn with_rng(cfg: PaperTradingConfig, rng: StdRng) -> Self {
        Self {
            cfg,
            rng,
            pending: BinaryHeap::new(),
            canceled: HashSet::new(),
            seq: 0,
        }
    }

    /// Acknowledge a NEW and, with the configured probability, schedule its
    /// fill after a uniformly drawn latency. Orders that lose the draw stay
    /// open until canceled.
    pub fn on_new(&mut self, req: &ClientRequest, now: Instant) -> ClientResponse {
        self.canceled.remove(&req.order_id);
        let accepted = ClientResponse::for_request(req, ClientResponseKind::Accepted);

        if self.rng.gen_bool(self.cfg.fill_probability.clamp(0.0, 1.0)) {
            let latency_ms = self
                .rng
                .gen_range(self.cfg.min_latency_ms..=self.cfg.max_latency_ms.max(self.cfg.min_latency_ms));
            let mut fill = ClientResponse::for_request(req, ClientResponseKind::Filled);
            fill.price = self.slipped_price(req.price);
            fill.exec_qty = req.qty;
            fill.leaves_qty = 0;
            self.seq += 1;
            self.pending.push(Reverse(PendingFill {
                due: now + Duration::from_millis(latency_ms),
                seq: self.seq,
                fill,
            }));
            debug!(order_id = req.order_id, latency_ms, "paper fill scheduled");
        }
        accepted
    }

    /// Cancels always succeed in paper mode and void any scheduled fill.
    pub fn on_cancel(&mut self, req: &ClientRequest) -> ClientResponse {
        self.canceled.insert(req.order_id);
        let mut resp = ClientResponse::for_request(req, ClientResponseKind::Canceled);
        resp.reject_reason = RejectReason::None;
        resp.leaves_qty = 0;
        resp
    }

    /// Fills whose latency has elapsed, in schedule order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<ClientResponse> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.pending.peek() {
            if head.due > now {
                break;
            }
            let Reverse(pending) = self.pending.pop().expect("peeked entry");
            if self.canceled.remove(&pending.fill.order_id) {
                continue;
            }
            due.push(pending.fill);
        }
        due
    }

    /// Deadline of the earliest scheduled fill, for run-loop sleeps.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.peek().map(|Reverse(p)| p.due)
    }

    pub fn pending_fills(&self) -> usize {
        self.pending.len()
    }

    fn slipped_price(&mut self, price: Price) -> Price {
        if self.cfg.slippage_factor <= 0.0 || price == 0 {
            return price;
        }
        let normal = match Normal::new(0.0, self.cfg.slippage_factor) {
            Ok(n) => n,
            Err(_) => return price,
        };
        let factor: f64 = 1.0 + normal.sample(&mut self.rng);
        ((price as f64) * factor).round() as Price
    }
}
