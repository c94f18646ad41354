//! Tradelink: a latency-sensitive multi-venue trading adapter layer.
//!
//! The crate connects a generic internal trading engine to heterogeneous
//! external venues. Per venue it ingests market data, maintains
//! per-instrument order books consistent with the venue's own, translates
//! between an internal normalized event vocabulary and the venue wire
//! formats, and routes orders while surfacing lifecycle events back to the
//! engine.
//!
//! # Architecture
//!
//! - **Records** (`types`): fixed-size normalized market events, client
//!   requests and client responses that cross the engine boundary.
//! - **Queues** (`spsc`): three bounded lock-free single-producer /
//!   single-consumer rings form the engine <-> adapter contract: requests
//!   in, responses out, market events out.
//! - **Books** (`books`): the diff book reconstructs a feed of complete
//!   top-N snapshots into an ADD/MODIFY/CANCEL stream; the delta book
//!   applies sequenced deltas against a REST snapshot with gap detection.
//! - **Venues** (`venues`): the octane connector (JSON streams + signed
//!   REST orders) and the kestrel connector (binary feed + token
//!   subscriptions), each with a market-data pump and an order gateway,
//!   plus the shared paper-trading simulator.
//! - **Strategy** (`strategy`): the bracket-order liquidity-taker overlay
//!   that sits on the engine side of the queues.

pub mod auth;
pub mod books;
pub mod config;
pub mod instruments;
pub mod registry;
pub mod runtime;
pub mod spsc;
pub mod strategy;
pub mod types;
pub mod venues;

pub use config::SessionConfig;
pub use registry::VenueKind;
pub use runtime::ShutdownFlag;
pub use types::{
    ClientRequest, ClientRequestKind, ClientResponse, ClientResponseKind, MarketEvent,
    MarketEventKind, OrderId, Price, Qty, RejectReason, Side, TickerId,
};
