// src/types.rs
//
// Common shared types for the tradelink adapter layer: identifiers, the
// fixed-point price representation, and the normalized records that flow
// across the engine <-> adapter queues.

use std::fmt;

/// Process-local dense instrument identifier.
pub type TickerId = u32;
pub const TICKER_ID_INVALID: TickerId = TickerId::MAX;

/// Opaque tag for the engine instance, threaded through every
/// request/response.
pub type ClientId = u32;
pub const CLIENT_ID_INVALID: ClientId = ClientId::MAX;

/// Engine-issued order identifier, monotonic per client. Doubles as the
/// de-duplication key in the order gateway.
pub type OrderId = u64;
pub const ORDER_ID_INVALID: OrderId = OrderId::MAX;

/// Fixed-point price, scale 100 (two decimal places).
pub type Price = i64;
pub const PRICE_INVALID: Price = Price::MAX;
pub const PRICE_SCALE: i64 = 100;

/// Unsigned lots / contracts. Scale is venue-dependent and carried in the
/// instrument metadata.
pub type Qty = u32;
pub const QTY_INVALID: Qty = Qty::MAX;

/// Convert a venue decimal into the internal fixed-point representation.
#[inline]
pub fn price_from_f64(px: f64) -> Price {
    (px * PRICE_SCALE as f64).round() as Price
}

/// Convert an internal fixed-point price into the venue decimal.
#[inline]
pub fn price_to_f64(px: Price) -> f64 {
    px as f64 / PRICE_SCALE as f64
}

#[inline]
pub fn qty_from_f64(qty: f64) -> Qty {
    (qty * PRICE_SCALE as f64).round() as Qty
}

#[inline]
pub fn qty_to_f64(qty: Qty) -> f64 {
    qty as f64 / PRICE_SCALE as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
    Invalid,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
            Side::Invalid => Side::Invalid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a normalized market event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketEventKind {
    Clear,
    Add,
    Modify,
    Cancel,
    Trade,
}

impl MarketEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketEventKind::Clear => "CLEAR",
            MarketEventKind::Add => "ADD",
            MarketEventKind::Modify => "MODIFY",
            MarketEventKind::Cancel => "CANCEL",
            MarketEventKind::Trade => "TRADE",
        }
    }
}

/// Wire-neutral market event pushed from the adapter to the engine.
///
/// Fixed-size and `Copy` so it moves through the SPSC ring without heap
/// traffic. Invariants: `Add`/`Modify` carry `qty > 0`, `Cancel` carries
/// `qty == 0`, `Trade` may carry `Side::Invalid` when the aggressor is
/// unknown, and `Clear` zeroes every level of the ticker downstream.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MarketEvent {
    pub kind: MarketEventKind,
    pub ticker_id: TickerId,
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub qty: Qty,
    /// Queue priority of the synthesized order; always 1 for events
    /// synthesized from depth snapshots.
    pub priority: u32,
}

impl MarketEvent {
    pub fn clear(ticker_id: TickerId) -> Self {
        Self {
            kind: MarketEventKind::Clear,
            ticker_id,
            order_id: ORDER_ID_INVALID,
            side: Side::Invalid,
            price: PRICE_INVALID,
            qty: QTY_INVALID,
            priority: 1,
        }
    }
}

impl fmt::Debug for MarketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MarketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MarketEvent [{} ticker:{} oid:{:#x} side:{} px:{} qty:{} prio:{}]",
            self.kind.as_str(),
            self.ticker_id,
            self.order_id,
            self.side,
            fmt_price(self.price),
            fmt_qty(self.qty),
            self.priority,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequestKind {
    New,
    Cancel,
}

impl ClientRequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientRequestKind::New => "NEW",
            ClientRequestKind::Cancel => "CANCEL",
        }
    }
}

/// Normalized order request sent by the engine to the adapter.
///
/// A `New` with `price == 0` denotes a market order; any other price is a
/// limit price.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClientRequest {
    pub kind: ClientRequestKind,
    pub client_id: ClientId,
    pub order_id: OrderId,
    pub ticker_id: TickerId,
    pub side: Side,
    pub price: Price,
    pub qty: Qty,
}

impl ClientRequest {
    pub fn is_market(&self) -> bool {
        self.kind == ClientRequestKind::New && self.price == 0
    }
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientRequest [{} client:{} oid:{} ticker:{} side:{} px:{} qty:{}]",
            self.kind.as_str(),
            self.client_id,
            self.order_id,
            self.ticker_id,
            self.side,
            fmt_price(self.price),
            fmt_qty(self.qty),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientResponseKind {
    Accepted,
    Rejected,
    Canceled,
    Filled,
    CancelRejected,
    PartiallyFilled,
}

impl ClientResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientResponseKind::Accepted => "ACCEPTED",
            ClientResponseKind::Rejected => "REJECTED",
            ClientResponseKind::Canceled => "CANCELED",
            ClientResponseKind::Filled => "FILLED",
            ClientResponseKind::CancelRejected => "CANCEL_REJECTED",
            ClientResponseKind::PartiallyFilled => "PARTIALLY_FILLED",
        }
    }

    /// True for states after which no further lifecycle event is expected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClientResponseKind::Filled
                | ClientResponseKind::Canceled
                | ClientResponseKind::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    None,
    InvalidQuantity,
    InvalidPrice,
    InvalidTicker,
    InvalidOrderId,
    DuplicateOrderId,
    RiskReject,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::None => "NONE",
            RejectReason::InvalidQuantity => "INVALID_QUANTITY",
            RejectReason::InvalidPrice => "INVALID_PRICE",
            RejectReason::InvalidTicker => "INVALID_TICKER",
            RejectReason::InvalidOrderId => "INVALID_ORDER_ID",
            RejectReason::DuplicateOrderId => "DUPLICATE_ORDER_ID",
            RejectReason::RiskReject => "RISK_REJECT",
        }
    }
}

/// Normalized order-lifecycle response surfaced by the adapter.
///
/// Carries every identity field from the originating request plus
/// `exec_qty` (cumulative filled) and `leaves_qty` (remaining).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClientResponse {
    pub kind: ClientResponseKind,
    pub reject_reason: RejectReason,
    pub client_id: ClientId,
    pub ticker_id: TickerId,
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub exec_qty: Qty,
    pub leaves_qty: Qty,
}

impl ClientResponse {
    /// Response echoing the identity fields of `req`.
    pub fn for_request(req: &ClientRequest, kind: ClientResponseKind) -> Self {
        Self {
            kind,
            reject_reason: RejectReason::None,
            client_id: req.client_id,
            ticker_id: req.ticker_id,
            order_id: req.order_id,
            side: req.side,
            price: req.price,
            exec_qty: 0,
            leaves_qty: req.qty,
        }
    }

    pub fn rejected(req: &ClientRequest, reason: RejectReason) -> Self {
        let mut resp = Self::for_request(req, ClientResponseKind::Rejected);
        resp.reject_reason = reason;
        resp.leaves_qty = 0;
        resp
    }

    pub fn cancel_rejected(req: &ClientRequest, reason: RejectReason) -> Self {
        let mut resp = Self::for_request(req, ClientResponseKind::CancelRejected);
        resp.reject_reason = reason;
        resp.leaves_qty = 0;
        resp
    }
}

impl fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientResponse [{} reason:{} client:{} ticker:{} oid:{} side:{} px:{} exec:{} leaves:{}]",
            self.kind.as_str(),
            self.reject_reason.as_str(),
            self.client_id,
            self.ticker_id,
            self.order_id,
            self.side,
            fmt_price(self.price),
            fmt_qty(self.exec_qty),
            fmt_qty(self.leaves_qty),
        )
    }
}

fn fmt_price(px: Price) -> String {
    if px == PRICE_INVALID {
        "INVALID".to_string()
    } else {
        format!("{:.2}", price_to_f64(px))
    }
}

fn fmt_qty(qty: Qty) -> String {
    if qty == QTY_INVALID {
        "INVALID".to_string()
    } else {
        qty.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_scaling_round_trips() {
        for raw in [0i64, 1, 99, 100, 12_345, 10_000_000, -250] {
            let venue = price_to_f64(raw);
            assert_eq!(price_from_f64(venue), raw);
        }
    }

    #[test]
    fn market_order_detection() {
        let mut req = ClientRequest {
            kind: ClientRequestKind::New,
            client_id: 1,
            order_id: 7,
            ticker_id: 3,
            side: Side::Buy,
            price: 0,
            qty: 10,
        };
        assert!(req.is_market());
        req.price = 50_000;
        assert!(!req.is_market());
        req.kind = ClientRequestKind::Cancel;
        req.price = 0;
        assert!(!req.is_market());
    }

    #[test]
    fn response_formatting_is_explicit() {
        let req = ClientRequest {
            kind: ClientRequestKind::New,
            client_id: 2,
            order_id: 11,
            ticker_id: 1,
            side: Side::Sell,
            price: 50_025,
            qty: 4,
        };
        let resp = ClientResponse::rejected(&req, RejectReason::InvalidPrice);
        let text = resp.to_string();
        assert!(text.contains("REJECTED"));
        assert!(text.contains("INVALID_PRICE"));
        assert!(text.contains("500.25"));
    }
}
