// src/venues/octane/wire.rs
//
// JSON feed decoder for the octane streams. Two subscriptions per symbol:
// depth deltas ({U,u,b,a}) and trades ({p,q,m}). Numeric fields arrive as
// strings and are rescaled into the internal fixed point. Messages may be
// wrapped in a combined-stream envelope ({"stream":…,"data":…}).

use serde_json::Value;

use crate::types::{price_from_f64, qty_from_f64, Price, Qty};

/// One depth delta covering the update-id interval `[first_update_id,
/// last_update_id]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    pub symbol: String,
    pub event_time: Option<i64>,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<(Price, Qty)>,
    pub asks: Vec<(Price, Qty)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeTick {
    pub price: Price,
    pub qty: Qty,
    /// True when the buyer was the maker, i.e. the aggressor sold.
    pub buyer_is_maker: bool,
}

/// REST depth snapshot: `{"lastUpdateId":…, "bids":[[p,q],…], "asks":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(Price, Qty)>,
    pub asks: Vec<(Price, Qty)>,
}

pub fn parse_depth_update(text: &str) -> Option<DepthUpdate> {
    let value: Value = serde_json::from_str(text).ok()?;
    let payload = value.get("data").unwrap_or(&value);
    if let Some(event) = payload.get("e").and_then(Value::as_str) {
        if event != "depthUpdate" {
            return None;
        }
    }
    Some(DepthUpdate {
        symbol: payload
            .get("s")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        event_time: payload.get("E").and_then(Value::as_i64),
        first_update_id: payload.get("U")?.as_u64()?,
        last_update_id: payload.get("u")?.as_u64()?,
        bids: parse_levels(payload.get("b")?)?,
        asks: parse_levels(payload.get("a")?)?,
    })
}

pub fn parse_trade(text: &str) -> Option<TradeTick> {
    let value: Value = serde_json::from_str(text).ok()?;
    let payload = value.get("data").unwrap_or(&value);
    if let Some(event) = payload.get("e").and_then(Value::as_str) {
        if event != "trade" {
            return None;
        }
    }
    Some(TradeTick {
        price: price_from_f64(parse_number(payload.get("p")?)?),
        qty: qty_from_f64(parse_number(payload.get("q")?)?),
        buyer_is_maker: payload.get("m")?.as_bool()?,
    })
}

pub fn parse_depth_snapshot(text: &str) -> Option<DepthSnapshot> {
    let value: Value = serde_json::from_str(text).ok()?;
    Some(DepthSnapshot {
        last_update_id: value.get("lastUpdateId")?.as_u64()?,
        bids: parse_levels(value.get("bids")?)?,
        asks: parse_levels(value.get("asks")?)?,
    })
}

fn parse_levels(value: &Value) -> Option<Vec<(Price, Qty)>> {
    let entries = value.as_array()?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry.as_array()?;
        if pair.len() < 2 {
            return None;
        }
        let price = price_from_f64(parse_number(&pair[0])?);
        let qty = qty_from_f64(parse_number(&pair[1])?);
        out.push((price, qty));
    }
    Some(out)
}

fn parse_number(value: &Value) -> Option<f64> {
    if let Some(v) = value.as_f64() {
        return Some(v);
    }
    value.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_update_parses_interval_and_levels() {
        let text = r#"{"e":"depthUpdate","E":1722400000123,"s":"LTCBTC",
            "U":157,"u":160,
            "b":[["0.0024","10"],["0.0022","0"]],
            "a":[["0.0026","100"]]}"#;
        let update = parse_depth_update(text).unwrap();
        assert_eq!(update.symbol, "LTCBTC");
        assert_eq!(update.first_update_id, 157);
        assert_eq!(update.last_update_id, 160);
        assert_eq!(update.event_time, Some(1722400000123));
        // 0.0024 -> 0 in a scale-100 representation would be lossy for
        // sub-cent venues; the decoder rounds to the nearest tick.
        assert_eq!(update.bids.len(), 2);
        assert_eq!(update.bids[1], (0, 0));
        assert_eq!(update.asks, vec![(0, 10_000)]);
    }

    #[test]
    fn combined_stream_envelope_is_unwrapped() {
        let text = r#"{"stream":"btcusdt@depth",
            "data":{"e":"depthUpdate","s":"BTCUSDT","U":5,"u":6,
                    "b":[["65000.10","0.5"]],"a":[]}}"#;
        let update = parse_depth_update(text).unwrap();
        assert_eq!(update.first_update_id, 5);
        assert_eq!(update.bids, vec![(6_500_010, 50)]);
    }

    #[test]
    fn trade_parses_maker_flag() {
        let text = r#"{"e":"trade","p":"100.50","q":"2","m":true}"#;
        let trade = parse_trade(text).unwrap();
        assert_eq!(trade.price, 10_050);
        assert_eq!(trade.qty, 200);
        assert!(trade.buyer_is_maker);

        let text = r#"{"e":"trade","p":"100.50","q":"2","m":false}"#;
        assert!(!parse_trade(text).unwrap().buyer_is_maker);
    }

    #[test]
    fn snapshot_parses() {
        let text = r#"{"lastUpdateId":1027024,
            "bids":[["4.00000000","431"]],
            "asks":[["4.00000200","12"]]}"#;
        let snapshot = parse_depth_snapshot(text).unwrap();
        assert_eq!(snapshot.last_update_id, 1027024);
        assert_eq!(snapshot.bids, vec![(400, 43_100)]);
        assert_eq!(snapshot.asks, vec![(400, 1_200)]);
    }

    #[test]
    fn wrong_event_kind_or_garbage_is_skipped() {
        assert!(parse_depth_update(r#"{"e":"trade","p":"1","q":"1","m":true}"#).is_none());
        assert!(parse_trade(r#"{"e":"depthUpdate","U":1,"u":2,"b":[],"a":[]}"#).is_none());
        assert!(parse_depth_update("not json").is_none());
        assert!(parse_depth_snapshot(r#"{"bids":[]}"#).is_none());
    }
}
