//! Core data types shared across the scalping engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for aggregated bars
#[derive(Debug, Error)]
pub enum BarValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },
}

/// A single quote update from the venue's tick stream.
///
/// Ticks are immutable and consumed exactly once; the aggregator drops
/// anything that arrives behind the last closed bar bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
}

impl Tick {
    /// Mid price used for bar construction
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Live top-of-book snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Spread expressed in price-increment units
    pub fn spread_points(&self, point: f64) -> f64 {
        if point == 0.0 {
            return 0.0;
        }
        (self.ask - self.bid) / point
    }
}

/// Fixed-interval OHLCV bar built from tick mid prices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Validate OHLC consistency
    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }
        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }
        if self.open < self.low || self.open > self.high {
            return Err(BarValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }
        if self.close < self.low || self.close > self.high {
            return Err(BarValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Slope classification of the slow-timeframe trend moving average
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendSlope {
    Up,
    Down,
    Flat,
    Unknown,
}

impl std::fmt::Display for TrendSlope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrendSlope::Up => write!(f, "UP"),
            TrendSlope::Down => write!(f, "DOWN"),
            TrendSlope::Flat => write!(f, "FLAT"),
            TrendSlope::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Best-effort classification of why a position left the venue's open list.
///
/// Inferred by comparing the closing deal price to the last-acknowledged
/// stop/target within a tolerance band; the raw P/L stays authoritative for
/// cooldown decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureType {
    TpHit,
    SlHit,
    PartialProfit,
    TimeExit,
    MaxAdverseExcursion,
    ManualOther,
}

impl std::fmt::Display for ClosureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClosureType::TpHit => write!(f, "TP_HIT"),
            ClosureType::SlHit => write!(f, "SL_HIT"),
            ClosureType::PartialProfit => write!(f, "PARTIAL_PROFIT"),
            ClosureType::TimeExit => write!(f, "TIME_EXIT"),
            ClosureType::MaxAdverseExcursion => write!(f, "MAX_ADVERSE_EXCURSION"),
            ClosureType::ManualOther => write!(f, "MANUAL_OTHER"),
        }
    }
}

/// How a deal relates to a position's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealEntry {
    /// Opening deal
    In,
    /// Full closure
    Out,
    /// Partial closure
    OutBy,
}

/// Historical deal record used for closure attribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub position_id: u64,
    pub price: f64,
    pub profit: f64,
    pub time: DateTime<Utc>,
    pub entry: DealEntry,
}

/// Instrument metadata reported by the venue
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolMeta {
    /// Smallest price increment (e.g. 0.01 for XAUUSD)
    pub point: f64,
    /// Units per 1.0 of volume
    pub contract_size: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    /// Broker minimum stop distance in points
    pub stop_level_points: f64,
}

/// An open position as the venue reports it. The venue's list is the source
/// of truth; local tracking is reconciled against it every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub ticket: u64,
    pub side: Side,
    pub entry_price: f64,
    pub volume: f64,
    pub stop: Option<f64>,
    pub target: Option<f64>,
    pub open_time: DateTime<Utc>,
}

/// Locally tracked state for a venue position, reconciled each cycle
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub ticket: u64,
    pub side: Side,
    pub entry_price: f64,
    pub volume: f64,
    pub stop: Option<f64>,
    pub target: Option<f64>,
    pub open_time: DateTime<Utc>,
    pub partial_taken: bool,
}

impl TrackedPosition {
    pub fn from_venue(pos: &VenuePosition) -> Self {
        Self {
            ticket: pos.ticket,
            side: pos.side,
            entry_price: pos.entry_price,
            volume: pos.volume,
            stop: pos.stop,
            target: pos.target,
            open_time: pos.open_time,
            partial_taken: false,
        }
    }

    /// Unrealized profit in points, measured against the closing price side
    pub fn profit_points(&self, quote: &Quote, point: f64) -> f64 {
        if point == 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Buy => (quote.bid - self.entry_price) / point,
            Side::Sell => (self.entry_price - quote.ask) / point,
        }
    }

    /// Current adverse excursion in points (positive when under water)
    pub fn adverse_points(&self, quote: &Quote, point: f64) -> f64 {
        -self.profit_points(quote, point)
    }
}

/// New-order request handed to the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    pub stop: f64,
    pub target: f64,
    pub comment: String,
}

/// Acknowledgement of a filled order
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderResult {
    pub ticket: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quote(bid: f64, ask: f64) -> Quote {
        Quote {
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            bid,
            ask,
        }
    }

    #[test]
    fn test_tick_mid() {
        let t = Tick {
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            bid: 2000.0,
            ask: 2000.4,
            volume: 1.0,
        };
        assert!((t.mid() - 2000.2).abs() < 1e-9);
    }

    #[test]
    fn test_spread_points() {
        let q = quote(2000.00, 2000.25);
        assert!((q.spread_points(0.01) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_bar_validation() {
        let bar = Bar {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            open: 10.0,
            high: 9.5,
            low: 8.0,
            close: 8.5,
            volume: 1.0,
        };
        assert!(matches!(
            bar.validate(),
            Err(BarValidationError::OpenOutOfRange { .. })
        ));
    }

    #[test]
    fn test_profit_and_adverse_points() {
        let pos = TrackedPosition {
            ticket: 1,
            side: Side::Buy,
            entry_price: 2000.0,
            volume: 0.1,
            stop: None,
            target: None,
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            partial_taken: false,
        };
        let q = quote(2001.0, 2001.3);
        assert!((pos.profit_points(&q, 0.01) - 100.0).abs() < 1e-6);
        assert!((pos.adverse_points(&q, 0.01) + 100.0).abs() < 1e-6);

        let short = TrackedPosition {
            side: Side::Sell,
            ..pos
        };
        // Short side is marked against the ask
        assert!((short.profit_points(&q, 0.01) + 130.0).abs() < 1e-6);
    }
}
