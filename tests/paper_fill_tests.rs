// Paper-trading fill distribution: every NEW is acknowledged immediately
// and, at fill probability 1, filled with a latency inside the configured
// window; nothing is rejected.

use std::time::{Duration, Instant};

use tradelink::config::PaperTradingConfig;
use tradelink::types::{ClientRequest, ClientRequestKind, ClientResponseKind, Side};
use tradelink::venues::paper::PaperEngine;

fn new_order(order_id: u64) -> ClientRequest {
    ClientRequest {
        kind: ClientRequestKind::New,
        client_id: 1,
        order_id,
        ticker_id: 2,
        side: Side::Buy,
        price: 10_000,
        qty: 1,
    }
}

#[test]
fn thousand_orders_accept_then_fill_within_latency_window() {
    let cfg = PaperTradingConfig {
        fill_probability: 1.0,
        min_latency_ms: 10,
        max_latency_ms: 50,
        slippage_factor: 0.0,
    };
    let mut engine = PaperEngine::with_seed(cfg, 20_240_801);
    let t0 = Instant::now();

    let mut accepted = 0;
    for order_id in 0..1_000u64 {
        let ack = engine.on_new(&new_order(order_id), t0);
        assert_eq!(ack.kind, ClientResponseKind::Accepted);
        accepted += 1;
    }
    assert_eq!(accepted, 1_000);
    assert_eq!(engine.pending_fills(), 1_000);

    // Nothing matures before the window opens.
    assert!(engine
        .pop_due(t0 + Duration::from_millis(9))
        .is_empty());

    // Sweep virtual time across the window; every fill's emission time
    // must land inside [10, 50] ms.
    let mut fills = 0;
    for ms in 10..=50u64 {
        for fill in engine.pop_due(t0 + Duration::from_millis(ms)) {
            assert_eq!(fill.kind, ClientResponseKind::Filled);
            assert_eq!(fill.exec_qty, 1);
            assert_eq!(fill.leaves_qty, 0);
            assert_eq!(fill.price, 10_000);
            fills += 1;
        }
    }
    assert_eq!(fills, 1_000);
    assert!(engine.next_due().is_none());
}

#[test]
fn losing_the_fill_draw_keeps_the_order_open_until_cancel() {
    let cfg = PaperTradingConfig {
        fill_probability: 0.0,
        min_latency_ms: 1,
        max_latency_ms: 2,
        slippage_factor: 0.0,
    };
    let mut engine = PaperEngine::with_seed(cfg, 7);
    let t0 = Instant::now();

    for order_id in 0..100u64 {
        assert_eq!(
            engine.on_new(&new_order(order_id), t0).kind,
            ClientResponseKind::Accepted
        );
    }
    assert!(engine.pop_due(t0 + Duration::from_secs(10)).is_empty());

    for order_id in 0..100u64 {
        let mut cancel = new_order(order_id);
        cancel.kind = ClientRequestKind::Cancel;
        assert_eq!(engine.on_cancel(&cancel).kind, ClientResponseKind::Canceled);
    }
}

#[test]
fn intermediate_probability_splits_orders_between_fill_and_open() {
    let cfg = PaperTradingConfig {
        fill_probability: 0.5,
        min_latency_ms: 1,
        max_latency_ms: 2,
        slippage_factor: 0.0,
    };
    let mut engine = PaperEngine::with_seed(cfg, 99);
    let t0 = Instant::now();
    for order_id in 0..1_000u64 {
        engine.on_new(&new_order(order_id), t0);
    }
    let filled = engine.pop_due(t0 + Duration::from_secs(1)).len();
    // Seeded draw: close to half fill, the rest stay open.
    assert!((300..=700).contains(&filled), "filled {filled}");
}
