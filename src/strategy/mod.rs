//! Strategy overlays that sit on the engine side of the queues.

pub mod bracket;

pub use bracket::{BracketOrder, LiquidityTaker, MarketView, TakerParams, TickerParams};
