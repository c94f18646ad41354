//! Octane exchange connector: JSON depth-delta and trade streams over
//! WebSocket, a signed REST order API and the snapshot+delta book
//! synchronization protocol.

pub mod gateway;
pub mod md;
pub mod wire;
