// src/venues/octane/gateway.rs
//
// Octane order gateway: translates normalized requests into signed REST
// calls, keeps the internal-id -> venue-id map, polls order status on its
// own task and emits normalized lifecycle responses. A paper mode (chosen
// per adapter instance) routes everything through the simulator instead of
// the network.
//
// The HTTP client is serialized by a mutex so the request path and the
// poller can share it; the order map has its own lock. When both are
// needed the client lock is taken first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::PaperTradingConfig;
use crate::runtime::ShutdownFlag;
use crate::spsc::{Consumer, Producer};
use crate::types::{
    price_from_f64, price_to_f64, qty_to_f64, ClientId, ClientRequest, ClientRequestKind,
    ClientResponse, ClientResponseKind, Qty, RejectReason, Side, TickerId,
};
use crate::venues::paper::PaperEngine;

type HmacSha256 = Hmac<Sha256>;

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OctaneGatewayConfig {
    pub rest_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Sleep between consecutive status requests, to stay inside the
    /// venue's rate window.
    pub poll_request_gap: Duration,
    /// Sleep between polling cycles.
    pub poll_cycle: Duration,
    /// Reject reason used when the exchange-info probe itself fails.
    pub probe_failure_reason: RejectReason,
    /// Present in paper mode; no network I/O is performed.
    pub paper: Option<PaperTradingConfig>,
}

impl OctaneGatewayConfig {
    pub fn new(rest_url: String, api_key: String, api_secret: String) -> Self {
        Self {
            rest_url,
            api_key,
            api_secret,
            poll_request_gap: Duration::from_millis(250),
            poll_cycle: Duration::from_secs(5),
            probe_failure_reason: RejectReason::InvalidPrice,
            paper: None,
        }
    }
}

/// `HEX(HMAC_SHA256(secret, query))`, appended to the query string as
/// `&signature=`.
pub fn sign_query(secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// LOT_SIZE and PERCENT_PRICE_BY_SIDE parameters from exchange-info.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub bid_multiplier_up: f64,
    pub bid_multiplier_down: f64,
    pub ask_multiplier_up: f64,
    pub ask_multiplier_down: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            min_qty: 0.0,
            max_qty: f64::MAX,
            step_size: 0.0,
            bid_multiplier_up: 5.0,
            bid_multiplier_down: 0.2,
            ask_multiplier_up: 5.0,
            ask_multiplier_down: 0.2,
        }
    }
}

impl SymbolFilters {
    /// Extract the filters from one exchange-info symbol object.
    pub fn from_symbol_info(info: &Value) -> Self {
        let mut filters = SymbolFilters::default();
        let Some(list) = info.get("filters").and_then(Value::as_array) else {
            return filters;
        };
        for filter in list {
            match filter.get("filterType").and_then(Value::as_str) {
                Some("LOT_SIZE") => {
                    filters.min_qty = str_field(filter, "minQty").unwrap_or(filters.min_qty);
                    filters.max_qty = str_field(filter, "maxQty").unwrap_or(filters.max_qty);
                    filters.step_size =
                        str_field(filter, "stepSize").unwrap_or(filters.step_size);
                }
                Some("PERCENT_PRICE_BY_SIDE") => {
                    filters.bid_multiplier_up =
                        str_field(filter, "bidMultiplierUp").unwrap_or(filters.bid_multiplier_up);
                    filters.bid_multiplier_down = str_field(filter, "bidMultiplierDown")
                        .unwrap_or(filters.bid_multiplier_down);
                    filters.ask_multiplier_up =
                        str_field(filter, "askMultiplierUp").unwrap_or(filters.ask_multiplier_up);
                    filters.ask_multiplier_down = str_field(filter, "askMultiplierDown")
                        .unwrap_or(filters.ask_multiplier_down);
                }
                _ => {}
            }
        }
        filters
    }

    /// Round a venue quantity down to the step size. Fails when the result
    /// lands below the minimum.
    pub fn adjust_qty(&self, qty: f64) -> Result<f64, RejectReason> {
        if qty < self.min_qty {
            return Err(RejectReason::InvalidQuantity);
        }
        if qty > self.max_qty {
            return Err(RejectReason::InvalidQuantity);
        }
        if self.step_size > 0.0 {
            let remainder = qty % self.step_size;
            if remainder > 1e-9 {
                let adjusted = (qty / self.step_size).floor() * self.step_size;
                if adjusted < self.min_qty {
                    return Err(RejectReason::InvalidQuantity);
                }
                return Ok(adjusted);
            }
        }
        Ok(qty)
    }

    /// PERCENT_PRICE_BY_SIDE band check against the current market price.
    pub fn price_in_band(&self, side: Side, price: f64, current: f64) -> bool {
        let (down, up) = match side {
            Side::Buy => (self.bid_multiplier_down, self.bid_multiplier_up),
            _ => (self.ask_multiplier_down, self.ask_multiplier_up),
        };
        price >= current * down && price <= current * up
    }
}

/// Price submitted when the requested one fails the band check: 1% inside
/// the allowed range from the current market price.
pub fn band_adjusted_price(side: Side, current: f64) -> f64 {
    match side {
        Side::Buy => current * 0.99,
        _ => current * 1.01,
    }
}

/// Map a venue error code (and message) onto a normalized reject reason.
pub fn map_reject_reason(code: i64, msg: &str) -> RejectReason {
    let lower = msg.to_ascii_lowercase();
    match code {
        -1013 | -1111 => {
            if lower.contains("lot_size") || lower.contains("quantity") {
                RejectReason::InvalidQuantity
            } else {
                RejectReason::InvalidPrice
            }
        }
        -1121 => RejectReason::InvalidTicker,
        -2010 => {
            if lower.contains("balance") || lower.contains("insufficient") {
                RejectReason::RiskReject
            } else if lower.contains("duplicate") {
                RejectReason::DuplicateOrderId
            } else {
                RejectReason::InvalidPrice
            }
        }
        -2011 | -2013 => RejectReason::InvalidOrderId,
        _ => RejectReason::RiskReject,
    }
}

/// Signed query for a NEW order. Field order is part of the venue
/// contract and must be preserved verbatim.
pub fn new_order_query(
    symbol: &str,
    side: Side,
    price_venue: Option<f64>,
    qty_venue: f64,
    timestamp_ms: u64,
) -> String {
    match price_venue {
        Some(price) => format!(
            "symbol={}&side={}&type=LIMIT&timeInForce=GTC&quantity={:.8}&price={:.8}&timestamp={}",
            symbol,
            side.as_str(),
            qty_venue,
            price,
            timestamp_ms
        ),
        None => format!(
            "symbol={}&side={}&type=MARKET&quantity={:.8}&timestamp={}",
            symbol,
            side.as_str(),
            qty_venue,
            timestamp_ms
        ),
    }
}

pub fn cancel_order_query(symbol: &str, venue_order_id: &str, timestamp_ms: u64) -> String {
    format!("symbol={symbol}&orderId={venue_order_id}&timestamp={timestamp_ms}")
}

#[derive(Debug, Clone)]
struct VenueOrder {
    venue_order_id: String,
    symbol: String,
    ticker_id: TickerId,
    side: Side,
    qty: Qty,
}

pub struct OctaneOrderGateway {
    cfg: OctaneGatewayConfig,
    client_id: ClientId,
    http: tokio::sync::Mutex<reqwest::Client>,
    order_map: Mutex<HashMap<u64, VenueOrder>>,
    ticker_to_symbol: HashMap<TickerId, String>,
    paper: Option<Mutex<PaperEngine>>,
}

impl OctaneOrderGateway {
    pub fn new(
        cfg: OctaneGatewayConfig,
        client_id: ClientId,
        instruments: &[(TickerId, String)],
    ) -> Arc<Self> {
        let paper = cfg
            .paper
            .map(|paper_cfg| Mutex::new(PaperEngine::new(paper_cfg)));
        let ticker_to_symbol = instruments.iter().cloned().collect();
        Arc::new(Self {
            cfg,
            client_id,
            http: tokio::sync::Mutex::new(reqwest::Client::new()),
            order_map: Mutex::new(HashMap::new()),
            ticker_to_symbol,
            paper,
        })
    }

    pub fn is_paper(&self) -> bool {
        self.paper.is_some()
    }

    pub fn open_order_count(&self) -> usize {
        self.order_map.lock().unwrap().len()
    }

    /// Gateway run loop: the single producer of the response ring. Status
    /// results from the poller arrive on `status_rx` and are forwarded
    /// here so the SPSC contract holds.
    pub async fn run(
        self: Arc<Self>,
        mut requests: Consumer<ClientRequest>,
        mut responses: Producer<ClientResponse>,
        mut status_rx: mpsc::UnboundedReceiver<ClientResponse>,
        shutdown: ShutdownFlag,
    ) {
        info!(paper = self.is_paper(), "octane order gateway started");
        while !shutdown.is_requested() {
            let mut made_progress = false;

            while let Some(request) = requests.pop() {
                made_progress = true;
                if request.client_id != self.client_id {
                    warn!(
                        got = request.client_id,
                        expected = self.client_id,
                        "request for wrong client id"
                    );
                    continue;
                }
                for response in self.dispatch(&request).await {
                    emit(&mut responses, response);
                }
            }

            while let Ok(response) = status_rx.try_recv() {
                made_progress = true;
                emit(&mut responses, response);
            }

            if let Some(paper) = &self.paper {
                for fill in paper.lock().unwrap().pop_due(Instant::now()) {
                    made_progress = true;
                    emit(&mut responses, fill);
                }
            }

            if !made_progress {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
        info!("octane order gateway stopped");
    }

    async fn dispatch(&self, request: &ClientRequest) -> Vec<ClientResponse> {
        match request.kind {
            ClientRequestKind::New => self.handle_new(request).await,
            ClientRequestKind::Cancel => self.handle_cancel(request).await,
        }
    }

    async fn handle_new(&self, request: &ClientRequest) -> Vec<ClientResponse> {
        if let Some(paper) = &self.paper {
            return vec![paper.lock().unwrap().on_new(request, Instant::now())];
        }

        let Some(symbol) = self.ticker_to_symbol.get(&request.ticker_id) else {
            warn!(%request, "new order for unknown ticker");
            return vec![ClientResponse::rejected(request, RejectReason::InvalidTicker)];
        };
        if request.qty == 0 {
            return vec![ClientResponse::rejected(request, RejectReason::InvalidQuantity)];
        }
        if request.price < 0 {
            return vec![ClientResponse::rejected(request, RejectReason::InvalidPrice)];
        }

        let filters = match self.exchange_info(symbol).await {
            Ok(filters) => filters,
            Err(err) => {
                warn!(symbol = %symbol, error = %err, "exchange-info probe failed");
                return vec![ClientResponse::rejected(
                    request,
                    self.cfg.probe_failure_reason,
                )];
            }
        };

        let qty_venue = match filters.adjust_qty(qty_to_f64(request.qty)) {
            Ok(qty) => qty,
            Err(reason) => return vec![ClientResponse::rejected(request, reason)],
        };

        let price_venue = if request.is_market() {
            None
        } else {
            let requested = price_to_f64(request.price);
            match self.current_price(symbol).await {
                Some(current) if !filters.price_in_band(request.side, requested, current) => {
                    let adjusted = band_adjusted_price(request.side, current);
                    info!(
                        symbol = %symbol,
                        requested,
                        adjusted,
                        current,
                        "price outside band, submitting filter-adjusted price"
                    );
                    Some(adjusted)
                }
                Some(_) => Some(requested),
                None => {
                    warn!(symbol = %symbol, "no market price for band check");
                    return vec![ClientResponse::rejected(request, RejectReason::InvalidPrice)];
                }
            }
        };

        let query = new_order_query(
            symbol,
            request.side,
            price_venue,
            qty_venue,
            timestamp_ms(),
        );
        let result = self.send_signed(reqwest::Method::POST, "/api/v3/order", &query).await;
        match result {
            Ok(body) => {
                if let Some(venue_order_id) = order_id_field(&body) {
                    self.order_map.lock().unwrap().insert(
                        request.order_id,
                        VenueOrder {
                            venue_order_id: venue_order_id.clone(),
                            symbol: symbol.clone(),
                            ticker_id: request.ticker_id,
                            side: request.side,
                            qty: request.qty,
                        },
                    );
                    info!(
                        order_id = request.order_id,
                        venue_order_id = %venue_order_id,
                        "order accepted"
                    );
                    vec![ClientResponse::for_request(
                        request,
                        ClientResponseKind::Accepted,
                    )]
                } else if let Some((code, msg)) = venue_error(&body) {
                    warn!(code, msg = %msg, "order rejected by venue");
                    vec![ClientResponse::rejected(request, map_reject_reason(code, &msg))]
                } else {
                    warn!(body = %body, "unexpected order response");
                    vec![ClientResponse::rejected(request, RejectReason::RiskReject)]
                }
            }
            Err(err) => {
                warn!(error = %err, "order transport error");
                vec![ClientResponse::rejected(request, RejectReason::RiskReject)]
            }
        }
    }

    async fn handle_cancel(&self, request: &ClientRequest) -> Vec<ClientResponse> {
        if let Some(paper) = &self.paper {
            return vec![paper.lock().unwrap().on_cancel(request)];
        }

        let venue_order = {
            let map = self.order_map.lock().unwrap();
            map.get(&request.order_id).cloned()
        };
        let Some(venue_order) = venue_order else {
            return vec![ClientResponse::cancel_rejected(
                request,
                RejectReason::InvalidOrderId,
            )];
        };

        let query = cancel_order_query(
            &venue_order.symbol,
            &venue_order.venue_order_id,
            timestamp_ms(),
        );
        match self
            .send_signed(reqwest::Method::DELETE, "/api/v3/order", &query)
            .await
        {
            Ok(body) => {
                if order_id_field(&body).is_some() {
                    self.order_map.lock().unwrap().remove(&request.order_id);
                    let mut resp =
                        ClientResponse::for_request(request, ClientResponseKind::Canceled);
                    resp.leaves_qty = 0;
                    vec![resp]
                } else if let Some((code, msg)) = venue_error(&body) {
                    vec![ClientResponse::cancel_rejected(
                        request,
                        map_reject_reason(code, &msg),
                    )]
                } else {
                    vec![ClientResponse::cancel_rejected(
                        request,
                        RejectReason::InvalidOrderId,
                    )]
                }
            }
            Err(err) => {
                warn!(error = %err, "cancel transport error");
                vec![ClientResponse::cancel_rejected(
                    request,
                    RejectReason::RiskReject,
                )]
            }
        }
    }

    /// Status poller: iterates the live order map on its own task, sending
    /// normalized responses back to the run loop. Live mode only.
    pub async fn run_poller(
        self: Arc<Self>,
        status_tx: mpsc::UnboundedSender<ClientResponse>,
        shutdown: ShutdownFlag,
    ) {
        if self.is_paper() {
            return;
        }
        info!("order status poller started");
        while !shutdown.is_requested() {
            let snapshot: Vec<(u64, VenueOrder)> = {
                let map = self.order_map.lock().unwrap();
                map.iter().map(|(&id, vo)| (id, vo.clone())).collect()
            };
            for (order_id, venue_order) in snapshot {
                if shutdown.is_requested() {
                    break;
                }
                match self.order_status(&venue_order).await {
                    Ok(body) => {
                        if let Some(response) =
                            self.interpret_status(order_id, &venue_order, &body)
                        {
                            if status_tx.send(response).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(order_id, error = %err, "status poll failed");
                    }
                }
                tokio::time::sleep(self.cfg.poll_request_gap).await;
            }
            tokio::time::sleep(self.cfg.poll_cycle).await;
        }
        info!("order status poller stopped");
    }

    /// Interpret one status payload; terminal statuses drop the mapping.
    fn interpret_status(
        &self,
        order_id: u64,
        venue_order: &VenueOrder,
        body: &Value,
    ) -> Option<ClientResponse> {
        let status = body.get("status")?.as_str()?;
        let executed = str_field(body, "executedQty").unwrap_or(0.0);
        let price = str_field(body, "price").unwrap_or(0.0);
        let exec_qty = crate::types::qty_from_f64(executed);
        let leaves = venue_order.qty.saturating_sub(exec_qty);

        let (kind, drop_mapping) = match status {
            "FILLED" => (ClientResponseKind::Filled, true),
            "PARTIALLY_FILLED" => (ClientResponseKind::PartiallyFilled, false),
            "CANCELED" => (ClientResponseKind::Canceled, true),
            "REJECTED" => (ClientResponseKind::Rejected, true),
            // NEW, PENDING_CANCEL: keep tracking.
            _ => return None,
        };
        if drop_mapping {
            self.order_map.lock().unwrap().remove(&order_id);
        }
        Some(ClientResponse {
            kind,
            reject_reason: RejectReason::None,
            client_id: self.client_id,
            ticker_id: venue_order.ticker_id,
            order_id,
            side: venue_order.side,
            price: if price > 0.0 {
                price_from_f64(price)
            } else {
                0
            },
            exec_qty,
            leaves_qty: if kind == ClientResponseKind::Filled {
                0
            } else {
                leaves
            },
        })
    }

    async fn order_status(&self, venue_order: &VenueOrder) -> Result<Value> {
        let query = format!(
            "symbol={}&orderId={}&timestamp={}",
            venue_order.symbol,
            venue_order.venue_order_id,
            timestamp_ms()
        );
        self.send_signed(reqwest::Method::GET, "/api/v3/order", &query)
            .await
    }

    async fn exchange_info(&self, symbol: &str) -> Result<SymbolFilters> {
        let body = self
            .send_plain(&format!("/api/v3/exchangeInfo?symbol={symbol}"))
            .await?;
        let info = body
            .get("symbols")
            .and_then(Value::as_array)
            .and_then(|symbols| symbols.first())
            .ok_or_else(|| anyhow!("exchange-info missing symbol entry"))?;
        Ok(SymbolFilters::from_symbol_info(info))
    }

    async fn current_price(&self, symbol: &str) -> Option<f64> {
        let body = self
            .send_plain(&format!("/api/v3/ticker/price?symbol={symbol}"))
            .await
            .ok()?;
        str_field(&body, "price")
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        query: &str,
    ) -> Result<Value> {
        let signature = sign_query(&self.cfg.api_secret, query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.cfg.rest_url, endpoint, query, signature
        );
        let client = self.http.lock().await;
        let resp = client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.cfg.api_key)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .context("signed request transport")?;
        let body = resp.text().await.context("signed request body")?;
        serde_json::from_str(&body).context("signed request parse")
    }

    async fn send_plain(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.cfg.rest_url, path);
        let client = self.http.lock().await;
        let resp = client
            .get(&url)
            .header("X-MBX-APIKEY", &self.cfg.api_key)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .context("request transport")?;
        let body = resp.text().await.context("request body")?;
        serde_json::from_str(&body).context("request parse")
    }
}

fn emit(responses: &mut Producer<ClientResponse>, response: ClientResponse) {
    if responses.push(response).is_err() {
        warn!("response queue full, dropping response");
    }
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn order_id_field(body: &Value) -> Option<String> {
    match body.get("orderId") {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn venue_error(body: &Value) -> Option<(i64, String)> {
    let code = body.get("code")?.as_i64()?;
    let msg = body
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some((code, msg))
}

fn str_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
