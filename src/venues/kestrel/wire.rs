// src/venues/kestrel/wire.rs
//
// Binary feed decoder. A frame is a two-byte big-endian packet count
// followed by (two-byte big-endian length, payload) pairs. Packet kind is
// dispatched by payload length and token range: 8 = LTP, 44 = QUOTE,
// 184 = FULL (quote + OI/timestamps + 5x2 depth), and index tokens get
// their own shape. All prices arrive as integer paise, which is exactly
// the internal fixed-point scale, so no arithmetic rescale is needed.

use tracing::warn;

use crate::books::depth_diff::{DepthLevel, DepthView, DEPTH_LEVELS};
use crate::types::{Price, Qty};

pub const LTP_PACKET_LEN: usize = 8;
pub const QUOTE_PACKET_LEN: usize = 44;
pub const FULL_PACKET_LEN: usize = 184;
pub const INDEX_QUOTE_LEN: usize = 28;
pub const INDEX_FULL_LEN: usize = 32;

const DEPTH_OFFSET: usize = 64;
const DEPTH_ENTRY_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Ltp,
    Quote,
    Full,
    Index,
}

/// Decoded per-instrument snapshot. One is produced per wire packet and
/// pushed onto the decode queue for the market-data pump.
#[derive(Debug, Clone, Copy)]
pub struct KestrelTick {
    pub token: i32,
    pub kind: TickKind,
    pub last_price: Price,
    pub last_qty: Qty,
    pub avg_price: Price,
    pub volume: u32,
    pub buy_qty: u32,
    pub sell_qty: u32,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub last_trade_time: u32,
    pub open_interest: u32,
    pub oi_day_high: u32,
    pub oi_day_low: u32,
    pub exchange_ts: u32,
    pub bids: [DepthLevel; DEPTH_LEVELS],
    pub asks: [DepthLevel; DEPTH_LEVELS],
    pub recv_ns: u64,
}

impl KestrelTick {
    fn empty(token: i32, kind: TickKind, recv_ns: u64) -> Self {
        Self {
            token,
            kind,
            last_price: 0,
            last_qty: 0,
            avg_price: 0,
            volume: 0,
            buy_qty: 0,
            sell_qty: 0,
            open: 0,
            high: 0,
            low: 0,
            close: 0,
            last_trade_time: 0,
            open_interest: 0,
            oi_day_high: 0,
            oi_day_low: 0,
            exchange_ts: 0,
            bids: [DepthLevel::default(); DEPTH_LEVELS],
            asks: [DepthLevel::default(); DEPTH_LEVELS],
            recv_ns,
        }
    }

    /// Depth view for the diff book. Meaningful for FULL ticks only.
    pub fn depth_view(&self) -> DepthView {
        DepthView {
            bids: self.bids,
            asks: self.asks,
            last_price: self.last_price,
            last_qty: self.last_qty,
        }
    }
}

/// Parse one binary frame, invoking `sink` per decoded packet. Returns the
/// number of packets decoded; malformed packets are logged and skipped.
pub fn parse_frame(
    data: &[u8],
    is_index: impl Fn(i32) -> bool,
    recv_ns: u64,
    mut sink: impl FnMut(KestrelTick),
) -> usize {
    if data.len() < 4 {
        warn!(len = data.len(), "binary frame too short");
        return 0;
    }
    let packet_count = read_u16(data, 0) as usize;
    let mut offset = 2;
    let mut decoded = 0;

    for i in 0..packet_count {
        if offset + 2 > data.len() {
            warn!(packet = i, "frame ended before packet header");
            break;
        }
        let packet_len = read_u16(data, offset) as usize;
        offset += 2;
        if offset + packet_len > data.len() {
            warn!(
                packet = i,
                need = packet_len,
                have = data.len() - offset,
                "truncated packet"
            );
            break;
        }
        let payload = &data[offset..offset + packet_len];
        offset += packet_len;

        match parse_packet(payload, &is_index, recv_ns) {
            Some(tick) => {
                sink(tick);
                decoded += 1;
            }
            None => {
                let token = if payload.len() >= 4 {
                    read_i32(payload, 0)
                } else {
                    0
                };
                warn!(packet = i, token, len = packet_len, "unrecognized packet");
            }
        }
    }
    decoded
}

fn parse_packet(payload: &[u8], is_index: &impl Fn(i32) -> bool, recv_ns: u64) -> Option<KestrelTick> {
    if payload.len() < 4 {
        return None;
    }
    let token = read_i32(payload, 0);
    if is_index(token) && payload.len() >= INDEX_QUOTE_LEN {
        return Some(parse_index_packet(token, payload, recv_ns));
    }
    match payload.len() {
        LTP_PACKET_LEN => Some(parse_ltp_packet(token, payload, recv_ns)),
        QUOTE_PACKET_LEN => Some(parse_quote_packet(token, payload, recv_ns)),
        FULL_PACKET_LEN => Some(parse_full_packet(token, payload, recv_ns)),
        _ => None,
    }
}

fn parse_ltp_packet(token: i32, payload: &[u8], recv_ns: u64) -> KestrelTick {
    let mut tick = KestrelTick::empty(token, TickKind::Ltp, recv_ns);
    tick.last_price = read_i32(payload, 4) as Price;
    tick
}

fn parse_quote_packet(token: i32, payload: &[u8], recv_ns: u64) -> KestrelTick {
    let mut tick = KestrelTick::empty(token, TickKind::Quote, recv_ns);
    fill_quote_fields(&mut tick, payload);
    tick
}

fn fill_quote_fields(tick: &mut KestrelTick, payload: &[u8]) {
    tick.last_price = read_i32(payload, 4) as Price;
    tick.last_qty = read_i32(payload, 8) as Qty;
    tick.avg_price = read_i32(payload, 12) as Price;
    tick.volume = read_i32(payload, 16) as u32;
    tick.buy_qty = read_i32(payload, 20) as u32;
    tick.sell_qty = read_i32(payload, 24) as u32;
    tick.open = read_i32(payload, 28) as Price;
    tick.high = read_i32(payload, 32) as Price;
    tick.low = read_i32(payload, 36) as Price;
    tick.close = read_i32(payload, 40) as Price;
}

fn parse_full_packet(token: i32, payload: &[u8], recv_ns: u64) -> KestrelTick {
    let mut tick = KestrelTick::empty(token, TickKind::Full, recv_ns);
    fill_quote_fields(&mut tick, payload);
    tick.last_trade_time = read_i32(payload, 44) as u32;
    tick.open_interest = read_i32(payload, 48) as u32;
    tick.oi_day_high = read_i32(payload, 52) as u32;
    tick.oi_day_low = read_i32(payload, 56) as u32;
    tick.exchange_ts = read_i32(payload, 60) as u32;

    for i in 0..DEPTH_LEVELS {
        let offset = DEPTH_OFFSET + i * DEPTH_ENTRY_LEN;
        tick.bids[i] = read_depth_entry(payload, offset);
    }
    for i in 0..DEPTH_LEVELS {
        let offset = DEPTH_OFFSET + (DEPTH_LEVELS + i) * DEPTH_ENTRY_LEN;
        tick.asks[i] = read_depth_entry(payload, offset);
    }
    tick
}

fn parse_index_packet(token: i32, payload: &[u8], recv_ns: u64) -> KestrelTick {
    let mut tick = KestrelTick::empty(token, TickKind::Index, recv_ns);
    tick.last_price = read_i32(payload, 4) as Price;
    tick.high = read_i32(payload, 8) as Price;
    tick.low = read_i32(payload, 12) as Price;
    tick.open = read_i32(payload, 16) as Price;
    tick.close = read_i32(payload, 20) as Price;
    if payload.len() >= INDEX_FULL_LEN {
        tick.exchange_ts = read_i32(payload, 28) as u32;
    }
    tick
}

// Depth entry layout: quantity (4), price (4), orders (2), padding (2).
fn read_depth_entry(payload: &[u8], offset: usize) -> DepthLevel {
    DepthLevel {
        qty: read_i32(payload, offset) as Qty,
        price: read_i32(payload, offset + 4) as Price,
        orders: read_i16(payload, offset + 8) as u16,
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Frame builders mirroring the wire layout, for decoder tests.

    use super::*;

    pub struct FrameBuilder {
        packets: Vec<Vec<u8>>,
    }

    impl FrameBuilder {
        pub fn new() -> Self {
            Self {
                packets: Vec::new(),
            }
        }

        pub fn push_packet(&mut self, payload: Vec<u8>) -> &mut Self {
            self.packets.push(payload);
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend((self.packets.len() as u16).to_be_bytes());
            for packet in &self.packets {
                out.extend((packet.len() as u16).to_be_bytes());
                out.extend(packet);
            }
            out
        }
    }

    pub fn ltp_packet(token: i32, last_price: i32) -> Vec<u8> {
        let mut p = Vec::with_capacity(LTP_PACKET_LEN);
        p.extend(token.to_be_bytes());
        p.extend(last_price.to_be_bytes());
        p
    }

    pub fn quote_packet(token: i32, fields: [i32; 10]) -> Vec<u8> {
        let mut p = Vec::with_capacity(QUOTE_PACKET_LEN);
        p.extend(token.to_be_bytes());
        for field in fields {
            p.extend(field.to_be_bytes());
        }
        p
    }

    #[allow(clippy::too_many_arguments)]
    pub fn full_packet(
        token: i32,
        quote: [i32; 10],
        extra: [i32; 5],
        bids: [(i32, i32, i16); 5],
        asks: [(i32, i32, i16); 5],
    ) -> Vec<u8> {
        let mut p = quote_packet(token, quote);
        for field in extra {
            p.extend(field.to_be_bytes());
        }
        for (qty, price, orders) in bids.into_iter().chain(asks) {
            p.extend(qty.to_be_bytes());
            p.extend(price.to_be_bytes());
            p.extend(orders.to_be_bytes());
            p.extend([0u8, 0u8]);
        }
        assert_eq!(p.len(), FULL_PACKET_LEN);
        p
    }

    pub fn index_packet(token: i32, fields: [i32; 6], exchange_ts: Option<i32>) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend(token.to_be_bytes());
        for field in fields {
            p.extend(field.to_be_bytes());
        }
        if let Some(ts) = exchange_ts {
            p.extend(ts.to_be_bytes());
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn not_index(_: i32) -> bool {
        false
    }

    #[test]
    fn decodes_ltp_packet() {
        let mut frame = FrameBuilder::new();
        frame.push_packet(ltp_packet(738561, 285_050));
        let mut ticks = Vec::new();
        let n = parse_frame(&frame.build(), not_index, 7, |t| ticks.push(t));
        assert_eq!(n, 1);
        assert_eq!(ticks[0].kind, TickKind::Ltp);
        assert_eq!(ticks[0].token, 738561);
        // 285050 paise == 2850.50 in internal fixed point.
        assert_eq!(ticks[0].last_price, 285_050);
        assert_eq!(ticks[0].recv_ns, 7);
    }

    #[test]
    fn decodes_quote_packet() {
        let fields = [285_050, 25, 285_000, 1_000_000, 5000, 4000, 280_000, 286_000, 279_000, 284_000];
        let mut frame = FrameBuilder::new();
        frame.push_packet(quote_packet(738561, fields));
        let mut ticks = Vec::new();
        parse_frame(&frame.build(), not_index, 0, |t| ticks.push(t));
        let tick = &ticks[0];
        assert_eq!(tick.kind, TickKind::Quote);
        assert_eq!(tick.last_qty, 25);
        assert_eq!(tick.avg_price, 285_000);
        assert_eq!(tick.volume, 1_000_000);
        assert_eq!(tick.buy_qty, 5000);
        assert_eq!(tick.sell_qty, 4000);
        assert_eq!(tick.open, 280_000);
        assert_eq!(tick.close, 284_000);
    }

    #[test]
    fn decodes_full_packet_with_depth() {
        let quote = [285_050, 25, 285_000, 1_000_000, 5000, 4000, 280_000, 286_000, 279_000, 284_000];
        let extra = [1_722_400_000, 900, 950, 850, 1_722_400_010];
        let bids = [
            (10, 285_000, 3),
            (20, 284_950, 2),
            (5, 284_900, 1),
            (0, 0, 0),
            (0, 0, 0),
        ];
        let asks = [
            (7, 285_100, 1),
            (9, 285_150, 4),
            (0, 0, 0),
            (0, 0, 0),
            (0, 0, 0),
        ];
        let mut frame = FrameBuilder::new();
        frame.push_packet(full_packet(408065, quote, extra, bids, asks));
        let mut ticks = Vec::new();
        parse_frame(&frame.build(), not_index, 0, |t| ticks.push(t));
        let tick = &ticks[0];
        assert_eq!(tick.kind, TickKind::Full);
        assert_eq!(tick.open_interest, 900);
        assert_eq!(tick.exchange_ts, 1_722_400_010);
        assert_eq!(tick.bids[0].price, 285_000);
        assert_eq!(tick.bids[0].qty, 10);
        assert_eq!(tick.bids[0].orders, 3);
        assert_eq!(tick.bids[1].price, 284_950);
        assert_eq!(tick.asks[1].price, 285_150);
        assert_eq!(tick.asks[1].orders, 4);
        assert_eq!(tick.asks[4], DepthLevel::default());
    }

    #[test]
    fn index_tokens_dispatch_by_predicate_not_length() {
        let payload = index_packet(
            256265,
            [2_450_000, 2_460_000, 2_440_000, 2_445_000, 2_448_000, 2_000],
            Some(1_722_400_000),
        );
        assert_eq!(payload.len(), INDEX_FULL_LEN);
        let mut frame = FrameBuilder::new();
        frame.push_packet(payload);
        let mut ticks = Vec::new();
        parse_frame(&frame.build(), |t| t == 256265, 0, |t| ticks.push(t));
        let tick = &ticks[0];
        assert_eq!(tick.kind, TickKind::Index);
        assert_eq!(tick.last_price, 2_450_000);
        assert_eq!(tick.high, 2_460_000);
        assert_eq!(tick.open, 2_445_000);
        assert_eq!(tick.exchange_ts, 1_722_400_000);
    }

    #[test]
    fn multi_packet_frames_decode_each_packet() {
        let mut frame = FrameBuilder::new();
        frame.push_packet(ltp_packet(1, 100));
        frame.push_packet(ltp_packet(2, 200));
        frame.push_packet(ltp_packet(3, 300));
        let mut tokens = Vec::new();
        let n = parse_frame(&frame.build(), not_index, 0, |t| tokens.push(t.token));
        assert_eq!(n, 3);
        assert_eq!(tokens, vec![1, 2, 3]);
    }

    #[test]
    fn truncated_and_unknown_packets_are_skipped() {
        // Unknown length packet between two valid ones.
        let mut frame = FrameBuilder::new();
        frame.push_packet(ltp_packet(1, 100));
        frame.push_packet(vec![0u8; 13]);
        frame.push_packet(ltp_packet(2, 200));
        let mut tokens = Vec::new();
        parse_frame(&frame.build(), not_index, 0, |t| tokens.push(t.token));
        assert_eq!(tokens, vec![1, 2]);

        // Frame that claims more packets than it carries.
        let mut data = FrameBuilder::new().push_packet(ltp_packet(9, 1)).build();
        data[1] = 5; // lie about the packet count
        let mut count = 0;
        parse_frame(&data, not_index, 0, |_| count += 1);
        assert_eq!(count, 1);

        // Truncated payload.
        let whole = FrameBuilder::new().push_packet(ltp_packet(9, 1)).build();
        let mut none = 0;
        parse_frame(&whole[..whole.len() - 2], not_index, 0, |_| none += 1);
        assert_eq!(none, 0);

        // Degenerate short frame.
        assert_eq!(parse_frame(&[0u8, 1], not_index, 0, |_| {}), 0);
    }
}
