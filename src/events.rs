//! Engine event stream
//!
//! Every externally meaningful engine action is emitted as a structured
//! event. The default sink logs through `tracing`; tests swap in a recording
//! sink to assert on the sequence.

use serde::Serialize;
use tracing::{info, warn};

use crate::position::{CloseReason, StopRule};
use crate::signal::{EntrySignal, GateBlock};
use crate::types::{ClosureType, Side, TrendSlope};

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    EngineStarted {
        symbol: String,
        bars_primed: usize,
    },
    GateBlocked(GateBlock),
    SignalMatched(EntrySignal),
    OrderPlaced {
        ticket: u64,
        side: Side,
        price: f64,
        volume: f64,
        stop: f64,
        target: f64,
    },
    OrderRejected {
        side: Side,
        reason: String,
    },
    StopModified {
        ticket: u64,
        stop: f64,
        rule: StopRule,
    },
    PartialTaken {
        ticket: u64,
        volume: f64,
    },
    CloseIssued {
        ticket: u64,
        reason: CloseReason,
    },
    PositionClosed {
        ticket: u64,
        pnl: f64,
        points: f64,
        closure: ClosureType,
    },
    CooldownStarted {
        secs: u64,
    },
    CooldownLifted {
        side: Side,
    },
    ConfigReloaded,
    TrendRefreshed {
        ma: Option<f64>,
        slope: TrendSlope,
    },
    Snapshot {
        rsi: Option<f64>,
        stoch_k: Option<f64>,
        stoch_d: Option<f64>,
        atr: Option<f64>,
        trend_ma: Option<f64>,
        slope: TrendSlope,
        open_positions: usize,
    },
    CycleError {
        context: String,
        error: String,
    },
}

pub trait EventSink {
    fn emit(&mut self, event: Event);
}

/// Default sink: structured log lines via `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: Event) {
        match &event {
            Event::EngineStarted { symbol, bars_primed } => {
                info!(symbol = %symbol, bars_primed, "engine started")
            }
            Event::GateBlocked(block) => info!(?block, "entry blocked"),
            Event::SignalMatched(signal) => info!(
                side = %signal.side,
                pattern = ?signal.pattern,
                rsi = signal.rsi,
                stoch_k = signal.stoch_k,
                stoch_d = signal.stoch_d,
                "entry signal matched"
            ),
            Event::OrderPlaced {
                ticket,
                side,
                price,
                volume,
                stop,
                target,
            } => info!(ticket, side = %side, price, volume, stop, target, "order placed"),
            Event::OrderRejected { side, reason } => {
                warn!(side = %side, reason = %reason, "order rejected")
            }
            Event::StopModified { ticket, stop, rule } => {
                info!(ticket, stop, ?rule, "stop modified")
            }
            Event::PartialTaken { ticket, volume } => {
                info!(ticket, volume, "partial profit taken")
            }
            Event::CloseIssued { ticket, reason } => {
                info!(ticket, ?reason, "close issued")
            }
            Event::PositionClosed {
                ticket,
                pnl,
                points,
                closure,
            } => info!(ticket, pnl, points, closure = %closure, "position closed"),
            Event::CooldownStarted { secs } => info!(secs, "post-loss cooldown started"),
            Event::CooldownLifted { side } => {
                info!(side = %side, "cooldown lifted by confirmed reversal")
            }
            Event::ConfigReloaded => info!("configuration reloaded"),
            Event::TrendRefreshed { ma, slope } => {
                info!(?ma, slope = %slope, "trend refreshed")
            }
            Event::Snapshot {
                rsi,
                stoch_k,
                stoch_d,
                atr,
                trend_ma,
                slope,
                open_positions,
            } => info!(
                ?rsi,
                ?stoch_k,
                ?stoch_d,
                ?atr,
                ?trend_ma,
                slope = %slope,
                open_positions,
                "snapshot"
            ),
            Event::CycleError { context, error } => {
                warn!(context = %context, error = %error, "cycle step failed")
            }
        }
    }
}

/// Test sink capturing the full event sequence
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<Event>,
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: Event) {
        self.events.push(event);
    }
}
