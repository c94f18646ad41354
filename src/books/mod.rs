//! Per-instrument order books and the normalized event streams they emit.

pub mod delta;
pub mod depth_diff;

use crate::types::{OrderId, Price, Side, TickerId};

/// Synthesized order id for a (ticker, price, side) level: stable across
/// updates, so downstream consumers can treat ADD/MODIFY/CANCEL as
/// manipulations of a single virtual order per level.
#[inline]
pub fn synth_order_id(ticker_id: TickerId, price: Price, side: Side) -> OrderId {
    let side_bit = match side {
        Side::Sell => 1u64,
        _ => 0u64,
    };
    ((ticker_id as u64) << 48) | ((price as u64) << 1) | side_bit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synth_ids_are_stable_and_distinct_per_level() {
        let a = synth_order_id(3, 10_000, Side::Buy);
        let b = synth_order_id(3, 10_000, Side::Buy);
        assert_eq!(a, b);
        assert_ne!(a, synth_order_id(3, 10_000, Side::Sell));
        assert_ne!(a, synth_order_id(3, 10_001, Side::Buy));
        assert_ne!(a, synth_order_id(4, 10_000, Side::Buy));
        assert_eq!(a >> 48, 3);
    }
}
