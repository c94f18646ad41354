//! Kestrel broker connector: big-endian binary market data over WebSocket,
//! JSON control frames, token-addressed subscriptions and a paper order
//! gateway.

pub mod adapter;
pub mod gateway;
pub mod wire;
pub mod ws;
