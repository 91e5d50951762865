//! Execution venue abstraction
//!
//! The engine drives a single blocking venue connection; every call is a
//! round trip and the venue's own position list is the source of truth for
//! reconciliation. Live brokers and the in-process simulator both implement
//! this trait.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::types::{Bar, Deal, OrderRequest, OrderResult, Quote, SymbolMeta, Tick, VenuePosition};

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue rejected the request: {code}")]
    Rejected { code: String },

    #[error("venue unreachable: {0}")]
    Unreachable(String),

    #[error("no data available from venue")]
    NoData,
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Blocking venue interface, one instrument per engine
pub trait Venue {
    /// Static instrument metadata (point size, volume limits, stop level)
    fn symbol_meta(&self) -> VenueResult<SymbolMeta>;

    /// Current account equity in the account currency
    fn account_equity(&self) -> VenueResult<f64>;

    /// Latest top-of-book quote
    fn quote(&self) -> VenueResult<Quote>;

    /// Ticks strictly after `since`, oldest first; used for the startup
    /// backfill and the incremental per-cycle fetch
    fn recent_ticks(&self, since: DateTime<Utc>) -> VenueResult<Vec<Tick>>;

    /// Most recent `count` completed bars on the slow trend timeframe
    fn trend_bars(&self, count: usize) -> VenueResult<Vec<Bar>>;

    /// All currently open positions for the engine's instrument
    fn open_positions(&self) -> VenueResult<Vec<VenuePosition>>;

    /// Deal history inside the trailing `window`, oldest first
    fn recent_deals(&self, window: Duration) -> VenueResult<Vec<Deal>>;

    /// Place a market order with attached stop and target
    fn place_order(&mut self, request: &OrderRequest) -> VenueResult<OrderResult>;

    /// Replace the stop (and optionally target) on an open position
    fn modify_position(
        &mut self,
        ticket: u64,
        stop: Option<f64>,
        target: Option<f64>,
    ) -> VenueResult<()>;

    /// Close a position at market: the whole thing when `volume` is `None`,
    /// otherwise that much of it. `reason` travels as the order comment.
    fn close_position(&mut self, ticket: u64, volume: Option<f64>, reason: &str)
        -> VenueResult<()>;
}
