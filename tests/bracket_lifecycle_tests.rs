// Bracket-order lifecycle scenarios driven through the request ring, the
// way the engine-side overlay and the gateway see them.

use std::collections::HashMap;
use std::sync::Arc;

use tradelink::books::depth_diff::Bbo;
use tradelink::spsc;
use tradelink::strategy::{LiquidityTaker, MarketView, TakerParams, TickerParams};
use tradelink::types::{
    ClientRequest, ClientRequestKind, ClientResponse, ClientResponseKind, RejectReason, Side,
    TickerId,
};

struct NoView;

impl MarketView for NoView {
    fn mid(&self, _ticker_id: TickerId) -> Option<f64> {
        None
    }
}

fn taker_params() -> TakerParams {
    TakerParams {
        use_bracket_orders: true,
        stop_loss_percent: 1.0,
        target_percent: 2.0,
        use_vwap_filter: false,
        vwap_threshold: 0.01,
        min_volume_percentile: 0,
        enforce_trading_hours: false,
        enforce_circuit_limits: false,
        trading_start: chrono::NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
        trading_end: chrono::NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
    }
}

fn build_taker() -> (LiquidityTaker, spsc::Consumer<ClientRequest>) {
    let (req_tx, req_rx) = spsc::channel::<ClientRequest>(64);
    let mut per_ticker = HashMap::new();
    per_ticker.insert(
        1,
        TickerParams {
            clip: 10,
            threshold: 0.6,
        },
    );
    (
        LiquidityTaker::new(7, taker_params(), per_ticker, Arc::new(NoView), req_tx),
        req_rx,
    )
}

fn filled(req: &ClientRequest, exec_qty: u32) -> ClientResponse {
    let mut resp = ClientResponse::for_request(req, ClientResponseKind::Filled);
    resp.exec_qty = exec_qty;
    resp.leaves_qty = 0;
    resp
}

#[test]
fn entry_fill_posts_both_exit_legs_then_one_leg_cancels_the_other() {
    let (taker, mut req_rx) = build_taker();
    let bbo = Bbo {
        bid_price: 49_990,
        bid_qty: 1_000,
        ask_price: 50_000,
        ask_qty: 1_000,
    };

    // Strategy triggers NEW BUY @ 500.00 qty=10; sl 495.00, tp 510.00.
    let entry_id = taker.on_trade(1, Side::Buy, 0.9, &bbo).unwrap();
    let entry = req_rx.pop().unwrap();
    assert_eq!(entry.order_id, entry_id);
    assert_eq!(entry.price, 50_000);
    assert_eq!(entry.qty, 10);

    // Engine sees ACCEPTED, then FILLED on the entry.
    let accepted = ClientResponse::for_request(&entry, ClientResponseKind::Accepted);
    taker.on_response(&accepted);
    assert!(req_rx.pop().is_none());

    taker.on_response(&filled(&entry, 10));
    let sl = req_rx.pop().unwrap();
    let tp = req_rx.pop().unwrap();
    assert_eq!(sl.kind, ClientRequestKind::New);
    assert_eq!(sl.side, Side::Sell);
    assert_eq!(sl.price, 49_500);
    assert_eq!(sl.qty, 10);
    assert_eq!(tp.side, Side::Sell);
    assert_eq!(tp.price, 51_000);

    // The 510 leg fills: a CANCEL for the 495 leg goes out.
    taker.on_response(&filled(&tp, 10));
    let cancel = req_rx.pop().unwrap();
    assert_eq!(cancel.kind, ClientRequestKind::Cancel);
    assert_eq!(cancel.order_id, sl.order_id);

    // Exactly one trigger flag is set in the completed lifecycle.
    let bracket = taker.bracket(entry_id).unwrap();
    assert!(bracket.entry_filled);
    assert!(bracket.tp_triggered ^ bracket.sl_triggered);
}

#[test]
fn cancel_reject_on_filled_leg_is_not_an_error() {
    let (taker, mut req_rx) = build_taker();
    let entry_id = taker.send_bracket(1, Side::Buy, 50_000, 10, 49_500, 51_000);
    let entry = req_rx.pop().unwrap();
    taker.on_response(&filled(&entry, 10));
    let sl = req_rx.pop().unwrap();
    let _tp = req_rx.pop().unwrap();

    // SL fills first and the TP cancel races a TP fill: the venue answers
    // CANCEL_REJECTED. The state machine must not change further.
    taker.on_response(&filled(&sl, 10));
    let cancel = req_rx.pop().unwrap();
    assert_eq!(cancel.kind, ClientRequestKind::Cancel);

    let before = taker.bracket(entry_id).unwrap();
    let mut reject = ClientResponse::for_request(&cancel, ClientResponseKind::CancelRejected);
    reject.reject_reason = RejectReason::InvalidOrderId;
    taker.on_response(&reject);
    let after = taker.bracket(entry_id).unwrap();
    assert_eq!(before.sl_triggered, after.sl_triggered);
    assert_eq!(before.tp_triggered, after.tp_triggered);
    assert!(req_rx.pop().is_none());
}

#[test]
fn partial_entry_fill_posts_legs_for_the_filled_qty() {
    let (taker, mut req_rx) = build_taker();
    let entry_id = taker.send_bracket(1, Side::Buy, 50_000, 10, 49_500, 51_000);
    let entry = req_rx.pop().unwrap();

    let mut partial = ClientResponse::for_request(&entry, ClientResponseKind::PartiallyFilled);
    partial.exec_qty = 4;
    partial.leaves_qty = 6;
    taker.on_response(&partial);

    let sl = req_rx.pop().unwrap();
    let tp = req_rx.pop().unwrap();
    assert_eq!(sl.qty, 4);
    assert_eq!(tp.qty, 4);

    // Later reports on the already-marked entry change nothing.
    taker.on_response(&filled(&entry, 10));
    assert!(req_rx.pop().is_none());
    assert!(taker.bracket(entry_id).unwrap().entry_filled);
}
