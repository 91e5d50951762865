//! Single-instrument gold scalping engine
//!
//! Aggregates a venue's tick stream into 5-second bars, derives RSI,
//! Stochastic, ATR and a slow-timeframe trend filter from them, and trades
//! four mean-reversion/continuation patterns with a layered risk ladder
//! (partial profit, time exit, adverse-excursion kill-switch, aggressive
//! loss limiter, break-even lock, ATR trailing). The engine is synchronous
//! and single-owner: one venue, one instrument, one pass per second.

pub mod bars;
pub mod config;
pub mod engine;
pub mod events;
pub mod indicators;
pub mod position;
pub mod reversal;
pub mod signal;
pub mod sim;
pub mod types;
pub mod venue;

pub use config::{Config, RISK_PCT_CEILING};
pub use engine::Engine;
pub use events::{Event, EventSink, RecordingSink, TracingSink};
pub use sim::SimVenue;
pub use types::{Bar, ClosureType, Quote, Side, Tick, TrendSlope};
pub use venue::{Venue, VenueError};
