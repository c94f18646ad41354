//! Per-venue connectors: market-data ingestion, order gateways and the
//! shared paper-trading simulator.

pub mod kestrel;
pub mod octane;
pub mod paper;
