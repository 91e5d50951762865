//! Open-position risk management
//!
//! One pass per cycle over each tracked position, walking the exit and
//! stop-adjustment rules in a fixed priority order. Closing rules own the
//! cycle outright; stop adjustments only ever tighten, so a stop can never
//! move away from price once set.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{Bar, Quote, Side, SymbolMeta, TrackedPosition};
use crate::Config;

/// Why the engine is closing a position itself (as opposed to the venue
/// filling a stop or target)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    TimeExit,
    MaxAdverseExcursion,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TimeExit => "time_exit",
            CloseReason::MaxAdverseExcursion => "max_adverse",
        }
    }
}

/// Which rule produced a stop adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopRule {
    AggressiveLimit,
    BreakEven,
    AtrTrail,
}

/// The actions the engine should take for one position this cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PositionIntent {
    PartialClose { ticket: u64, volume: f64 },
    Close { ticket: u64, reason: CloseReason },
    ModifyStop { ticket: u64, stop: f64, rule: StopRule },
}

/// Market state the rule ladder reads
pub struct MarketView<'a> {
    pub quote: &'a Quote,
    /// Latest ATR in price units, when available
    pub atr: Option<f64>,
    /// Completed bars, oldest first
    pub bars: &'a [Bar],
    pub meta: &'a SymbolMeta,
    pub now: DateTime<Utc>,
}

/// Snap a price to the instrument's increment grid
fn round_to_point(price: f64, point: f64) -> f64 {
    if point <= 0.0 {
        return price;
    }
    (price / point).round() * point
}

/// Would `candidate` tighten the stop relative to `current`?
fn tightens(side: Side, current: Option<f64>, candidate: f64) -> bool {
    match (side, current) {
        (_, None) => true,
        (Side::Buy, Some(stop)) => candidate > stop + 1e-9,
        (Side::Sell, Some(stop)) => candidate < stop - 1e-9,
    }
}

/// Pull a candidate stop inside the broker's minimum distance from price
fn respect_stop_level(side: Side, candidate: f64, quote: &Quote, meta: &SymbolMeta) -> f64 {
    let min_dist = meta.stop_level_points * meta.point;
    match side {
        Side::Buy => candidate.min(quote.bid - min_dist),
        Side::Sell => candidate.max(quote.ask + min_dist),
    }
}

/// Stop at entry plus the break-even buffer, on the profitable side
fn break_even_stop(position: &TrackedPosition, config: &Config, point: f64) -> f64 {
    let buffer = config.be_buffer_points * point;
    match position.side {
        Side::Buy => position.entry_price + buffer,
        Side::Sell => position.entry_price - buffer,
    }
}

/// Volume for the partial take: the configured fraction floored to the
/// instrument's volume step. Returns None when either the closed part or the
/// remainder would fall below the venue minimum.
fn partial_volume(position: &TrackedPosition, fraction: f64, meta: &SymbolMeta) -> Option<f64> {
    if meta.volume_step <= 0.0 {
        return None;
    }
    let raw = position.volume * fraction;
    let stepped = (raw / meta.volume_step).floor() * meta.volume_step;
    let remainder = position.volume - stepped;
    if stepped < meta.volume_min || remainder < meta.volume_min - 1e-9 {
        return None;
    }
    Some(stepped)
}

/// Evaluate the rule ladder for one position. At most one rule wins the
/// cycle; the partial take may carry a companion stop move for the
/// remainder.
pub fn manage(
    position: &TrackedPosition,
    view: &MarketView<'_>,
    config: &Config,
) -> Vec<PositionIntent> {
    let point = view.meta.point;
    let profit = position.profit_points(view.quote, point);
    let adverse = position.adverse_points(view.quote, point);

    // Rule 1: partial profit take; the remainder's stop moves to
    // break-even-plus-buffer when that tightens it
    if !position.partial_taken && profit >= config.partial_trigger_points {
        if let Some(volume) = partial_volume(position, config.partial_fraction, view.meta) {
            let mut intents = vec![PositionIntent::PartialClose {
                ticket: position.ticket,
                volume,
            }];
            let stop = round_to_point(
                respect_stop_level(
                    position.side,
                    break_even_stop(position, config, point),
                    view.quote,
                    view.meta,
                ),
                point,
            );
            if tightens(position.side, position.stop, stop) {
                intents.push(PositionIntent::ModifyStop {
                    ticket: position.ticket,
                    stop,
                    rule: StopRule::BreakEven,
                });
            }
            return intents;
        }
    }

    // Rule 2: time exit for positions that never got going
    let held_secs = (view.now - position.open_time).num_seconds();
    if held_secs >= config.max_hold_secs as i64 && profit <= 0.0 {
        return vec![PositionIntent::Close {
            ticket: position.ticket,
            reason: CloseReason::TimeExit,
        }];
    }

    // Rule 3: emergency close at the adverse-excursion ceiling; nothing
    // else runs this cycle
    if adverse >= config.max_adverse_points {
        return vec![PositionIntent::Close {
            ticket: position.ticket,
            reason: CloseReason::MaxAdverseExcursion,
        }];
    }

    // Rule 4: aggressive loss limiter. Fires on a modest adverse excursion
    // once the latest completed bar has closed beyond the trigger level,
    // and pulls the stop to a tight buffer under price, or past a breached
    // support/resistance level when that is tighter.
    let trigger_points =
        config.sl_points * config.aggressive_trigger_pct + config.aggressive_fixed_buffer_points;
    if adverse >= trigger_points {
        let trigger_level = match position.side {
            Side::Buy => position.entry_price - trigger_points * point,
            Side::Sell => position.entry_price + trigger_points * point,
        };
        let confirmed = view.bars.last().is_some_and(|bar| match position.side {
            Side::Buy => bar.close < trigger_level,
            Side::Sell => bar.close > trigger_level,
        });
        if confirmed {
            if let Some(stop) = aggressive_stop(position, view, config) {
                if tightens(position.side, position.stop, stop) {
                    return vec![PositionIntent::ModifyStop {
                        ticket: position.ticket,
                        stop,
                        rule: StopRule::AggressiveLimit,
                    }];
                }
            }
            return Vec::new();
        }
    }

    // Rule 5: break-even lock
    if profit >= config.be_trigger_points {
        let candidate = round_to_point(
            respect_stop_level(
                position.side,
                break_even_stop(position, config, point),
                view.quote,
                view.meta,
            ),
            point,
        );
        if tightens(position.side, position.stop, candidate) {
            return vec![PositionIntent::ModifyStop {
                ticket: position.ticket,
                stop: candidate,
                rule: StopRule::BreakEven,
            }];
        }
    }

    // Rule 6: ATR trailing stop in price units, past the break-even
    // trigger only, and never back behind the break-even level
    if profit > config.be_trigger_points {
        if let Some(atr) = view.atr {
            let distance = atr * config.atr_multiplier;
            let candidate = match position.side {
                Side::Buy => view.quote.bid - distance,
                Side::Sell => view.quote.ask + distance,
            };
            let candidate = round_to_point(
                respect_stop_level(position.side, candidate, view.quote, view.meta),
                point,
            );
            let be_level = break_even_stop(position, config, point);
            let past_be = match position.side {
                Side::Buy => candidate > be_level,
                Side::Sell => candidate < be_level,
            };
            if past_be && tightens(position.side, position.stop, candidate) {
                return vec![PositionIntent::ModifyStop {
                    ticket: position.ticket,
                    stop: candidate,
                    rule: StopRule::AtrTrail,
                }];
            }
        }
    }

    Vec::new()
}

/// Candidate stop for the aggressive limiter: a fixed buffer from the
/// current price, tightened further when price has actually broken the
/// nearest support (long) or resistance (short) over the lookback window.
fn aggressive_stop(
    position: &TrackedPosition,
    view: &MarketView<'_>,
    config: &Config,
) -> Option<f64> {
    let point = view.meta.point;
    let lookback = config.sr_lookback_bars.min(view.bars.len());
    if lookback == 0 {
        return None;
    }
    let window = &view.bars[view.bars.len() - lookback..];
    let breach = config.sr_breach_buffer_points * point;
    let dist = config
        .aggressive_min_distance_points
        .max(view.meta.stop_level_points + 5.0)
        * point;

    let candidate = match position.side {
        Side::Buy => {
            let support = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
            let from_price = view.quote.bid - dist;
            // The S/R candidate only counts once price has broken the level,
            // and then the tighter of the two wins
            if support.is_finite() && view.quote.bid < support {
                from_price.max(support - breach)
            } else {
                from_price
            }
        }
        Side::Sell => {
            let resistance = window
                .iter()
                .map(|b| b.high)
                .fold(f64::NEG_INFINITY, f64::max);
            let from_price = view.quote.ask + dist;
            if resistance.is_finite() && view.quote.ask > resistance {
                from_price.min(resistance + breach)
            } else {
                from_price
            }
        }
    };

    Some(round_to_point(candidate, point))
}
