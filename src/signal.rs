//! Entry signal evaluation
//!
//! Pure function of the latest two indicator snapshots, the latest two raw
//! bars, the live quote and the cooldown/concurrency state. Gates run in a
//! fixed order and the first failure short-circuits with a named reason;
//! entry patterns are mutually exclusive and the first match wins.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::indicators::IndicatorSnapshot;
use crate::types::{Bar, Quote, Side, TrendSlope};
use crate::Config;

/// Cooldown timers read by the evaluator, written by the engine on entry and
/// closure events.
#[derive(Debug, Clone, Default)]
pub struct CooldownState {
    pub last_loss_close: Option<DateTime<Utc>>,
    pub last_buy_entry: Option<DateTime<Utc>>,
    pub last_sell_entry: Option<DateTime<Utc>>,
}

impl CooldownState {
    pub fn record_entry(&mut self, side: Side, at: DateTime<Utc>) {
        match side {
            Side::Buy => self.last_buy_entry = Some(at),
            Side::Sell => self.last_sell_entry = Some(at),
        }
    }

    pub fn record_loss_close(&mut self, at: DateTime<Utc>) {
        self.last_loss_close = Some(at);
    }

    /// Lifted early by a confirmed reversal
    pub fn clear_loss_cooldown(&mut self) {
        self.last_loss_close = None;
    }

    pub fn loss_cooldown_remaining(&self, now: DateTime<Utc>, cooldown_secs: u64) -> f64 {
        remaining_secs(self.last_loss_close, now, cooldown_secs)
    }

    pub fn entry_cooldown_remaining(
        &self,
        side: Side,
        now: DateTime<Utc>,
        cooldown_secs: u64,
    ) -> f64 {
        let last = match side {
            Side::Buy => self.last_buy_entry,
            Side::Sell => self.last_sell_entry,
        };
        remaining_secs(last, now, cooldown_secs)
    }
}

fn remaining_secs(since: Option<DateTime<Utc>>, now: DateTime<Utc>, window_secs: u64) -> f64 {
    match since {
        Some(ts) => {
            let elapsed = (now - ts).num_milliseconds() as f64 / 1000.0;
            (window_secs as f64 - elapsed).max(0.0)
        }
        None => 0.0,
    }
}

/// Why no entry was attempted this cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GateBlock {
    SpreadTooWide {
        spread_points: f64,
        limit: f64,
    },
    CooldownActive {
        remaining_secs: f64,
    },
    EntryCooldown {
        side: Side,
        remaining_secs: f64,
    },
    ConcurrencyLimit {
        open: usize,
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryPattern {
    DipBuy,
    ContinuationBuy,
    RallySell,
    ContinuationSell,
}

impl EntryPattern {
    pub fn side(self) -> Side {
        match self {
            EntryPattern::DipBuy | EntryPattern::ContinuationBuy => Side::Buy,
            EntryPattern::RallySell | EntryPattern::ContinuationSell => Side::Sell,
        }
    }
}

/// A matched entry with the values that matched, for the event stream
#[derive(Debug, Clone, Serialize)]
pub struct EntrySignal {
    pub side: Side,
    pub pattern: EntryPattern,
    pub rsi: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub trend_ma: f64,
    pub mid_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub enum SignalDecision {
    Entry(EntrySignal),
    Blocked(GateBlock),
    NoMatch,
}

/// Everything the evaluator reads for one decision
pub struct SignalContext<'a> {
    pub current: &'a IndicatorSnapshot,
    pub previous: &'a IndicatorSnapshot,
    pub current_bar: &'a Bar,
    pub previous_bar: &'a Bar,
    pub quote: &'a Quote,
    pub spread_points: f64,
    pub open_positions: usize,
    pub cooldown: &'a CooldownState,
    pub now: DateTime<Utc>,
}

/// Strict sign-change crossover: the raw %K - %D difference must flip from
/// negative to positive (equality on either bar does not count as a cross).
fn crossed_above(prev_k: f64, prev_d: f64, k: f64, d: f64) -> bool {
    (prev_k - prev_d) < 0.0 && (k - d) > 0.0
}

fn crossed_below(prev_k: f64, prev_d: f64, k: f64, d: f64) -> bool {
    (prev_k - prev_d) > 0.0 && (k - d) < 0.0
}

pub fn evaluate(ctx: &SignalContext<'_>, config: &Config) -> SignalDecision {
    // Gate 1: spread ceiling
    if ctx.spread_points > config.max_spread_points {
        return SignalDecision::Blocked(GateBlock::SpreadTooWide {
            spread_points: ctx.spread_points,
            limit: config.max_spread_points,
        });
    }

    // Gate 2: post-loss cooldown (cleared early by a confirmed reversal,
    // which the engine applies before calling in here)
    let loss_remaining = ctx
        .cooldown
        .loss_cooldown_remaining(ctx.now, config.cooldown_secs);
    if loss_remaining > 0.0 {
        return SignalDecision::Blocked(GateBlock::CooldownActive {
            remaining_secs: loss_remaining,
        });
    }

    // Gate 3: per-side entry cooldown. A fully symmetric block only applies
    // when both sides are cooling; otherwise the matched pattern's side is
    // checked below.
    let buy_remaining =
        ctx.cooldown
            .entry_cooldown_remaining(Side::Buy, ctx.now, config.entry_cooldown_secs);
    let sell_remaining =
        ctx.cooldown
            .entry_cooldown_remaining(Side::Sell, ctx.now, config.entry_cooldown_secs);
    if buy_remaining > 0.0 && sell_remaining > 0.0 {
        let (side, remaining_secs) = if buy_remaining >= sell_remaining {
            (Side::Buy, buy_remaining)
        } else {
            (Side::Sell, sell_remaining)
        };
        return SignalDecision::Blocked(GateBlock::EntryCooldown {
            side,
            remaining_secs,
        });
    }

    // Gate 4: concurrency ceiling
    if ctx.open_positions >= config.max_concurrent {
        return SignalDecision::Blocked(GateBlock::ConcurrencyLimit {
            open: ctx.open_positions,
            limit: config.max_concurrent,
        });
    }

    let pattern = match match_pattern(ctx, config) {
        Some(p) => p,
        None => return SignalDecision::NoMatch,
    };

    let side_remaining = match pattern.side() {
        Side::Buy => buy_remaining,
        Side::Sell => sell_remaining,
    };
    if side_remaining > 0.0 {
        return SignalDecision::Blocked(GateBlock::EntryCooldown {
            side: pattern.side(),
            remaining_secs: side_remaining,
        });
    }

    // Gates and pattern all require these to be present
    let (rsi, k, d, ma) = match (
        ctx.current.rsi,
        ctx.current.stoch_k,
        ctx.current.stoch_d,
        ctx.current.trend_ma,
    ) {
        (Some(rsi), Some(k), Some(d), Some(ma)) => (rsi, k, d, ma),
        _ => return SignalDecision::NoMatch,
    };

    SignalDecision::Entry(EntrySignal {
        side: pattern.side(),
        pattern,
        rsi,
        stoch_k: k,
        stoch_d: d,
        trend_ma: ma,
        mid_price: ctx.quote.mid(),
    })
}

/// Ordered, mutually exclusive pattern list; first match wins
fn match_pattern(ctx: &SignalContext<'_>, config: &Config) -> Option<EntryPattern> {
    let ma = ctx.current.trend_ma?;
    let slope = ctx.current.trend_slope;
    let rsi = ctx.current.rsi?;
    let k = ctx.current.stoch_k?;
    let d = ctx.current.stoch_d?;
    let prev_k = ctx.previous.stoch_k?;
    let prev_d = ctx.previous.stoch_d?;

    let mid = ctx.quote.mid();
    let prev = ctx.previous_bar;
    let curr = ctx.current_bar;

    // Dip-buy in uptrend: price rides above a rising MA, RSI oversold,
    // %K crosses up near the oversold band, and the previous bar dipped
    // through the MA but closed back above it.
    if slope == TrendSlope::Up
        && mid > ma
        && rsi < config.rsi_oversold
        && crossed_above(prev_k, prev_d, k, d)
        && k < config.stoch_oversold + 5.0
        && prev.low <= ma
        && prev.close > ma
    {
        return Some(EntryPattern::DipBuy);
    }

    // Trend-continuation buy: neutral RSI, cross up, bearish pullback bar
    // engulfed by a bullish bar closing above the prior high.
    if slope == TrendSlope::Up
        && mid > ma
        && rsi > 40.0
        && rsi < 60.0
        && crossed_above(prev_k, prev_d, k, d)
        && prev.is_bearish()
        && curr.is_bullish()
        && curr.close > prev.high
    {
        return Some(EntryPattern::ContinuationBuy);
    }

    // Rally-sell in downtrend (mirror of the dip-buy)
    if slope == TrendSlope::Down
        && mid < ma
        && rsi > config.rsi_overbought
        && crossed_below(prev_k, prev_d, k, d)
        && k > config.stoch_overbought - 5.0
        && prev.high >= ma
        && prev.close < ma
    {
        return Some(EntryPattern::RallySell);
    }

    // Trend-continuation sell (mirror of the continuation buy)
    if slope == TrendSlope::Down
        && mid < ma
        && rsi > 40.0
        && rsi < 60.0
        && crossed_below(prev_k, prev_d, k, d)
        && prev.is_bullish()
        && curr.is_bearish()
        && curr.close < prev.low
    {
        return Some(EntryPattern::ContinuationSell);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            start: base_time(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn snapshot(rsi: f64, k: f64, d: f64, ma: f64, slope: TrendSlope) -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: Some(rsi),
            stoch_k: Some(k),
            stoch_d: Some(d),
            atr: Some(0.5),
            trend_ma: Some(ma),
            trend_slope: slope,
        }
    }

    struct Fixture {
        current: IndicatorSnapshot,
        previous: IndicatorSnapshot,
        current_bar: Bar,
        previous_bar: Bar,
        quote: Quote,
        cooldown: CooldownState,
        open_positions: usize,
        spread_points: f64,
    }

    impl Fixture {
        /// Everything lined up for a dip-buy
        fn dip_buy() -> Self {
            let ma = 2000.0;
            Fixture {
                current: snapshot(30.0, 22.0, 18.0, ma, TrendSlope::Up),
                previous: snapshot(32.0, 15.0, 18.0, ma, TrendSlope::Up),
                current_bar: bar(2000.5, 2001.2, 2000.2, 2001.0),
                previous_bar: bar(2000.3, 2000.8, 1999.5, 2000.4),
                quote: Quote {
                    time: base_time(),
                    bid: 2000.9,
                    ask: 2001.1,
                },
                cooldown: CooldownState::default(),
                open_positions: 0,
                spread_points: 20.0,
            }
        }

        fn ctx(&self) -> SignalContext<'_> {
            SignalContext {
                current: &self.current,
                previous: &self.previous,
                current_bar: &self.current_bar,
                previous_bar: &self.previous_bar,
                quote: &self.quote,
                spread_points: self.spread_points,
                open_positions: self.open_positions,
                cooldown: &self.cooldown,
                now: base_time(),
            }
        }
    }

    #[test]
    fn test_dip_buy_matches() {
        let fixture = Fixture::dip_buy();
        let decision = evaluate(&fixture.ctx(), &Config::default());
        match decision {
            SignalDecision::Entry(signal) => {
                assert_eq!(signal.pattern, EntryPattern::DipBuy);
                assert_eq!(signal.side, Side::Buy);
            }
            other => panic!("expected dip-buy entry, got {other:?}"),
        }
    }

    #[test]
    fn test_spread_gate_blocks_first() {
        let mut fixture = Fixture::dip_buy();
        fixture.spread_points = 100.0;
        // Also put a cooldown in place; the spread gate must win
        fixture.cooldown.record_loss_close(base_time());
        let decision = evaluate(&fixture.ctx(), &Config::default());
        assert!(matches!(
            decision,
            SignalDecision::Blocked(GateBlock::SpreadTooWide { .. })
        ));
    }

    #[test]
    fn test_loss_cooldown_blocks() {
        let mut fixture = Fixture::dip_buy();
        fixture
            .cooldown
            .record_loss_close(base_time() - Duration::seconds(10));
        let decision = evaluate(&fixture.ctx(), &Config::default());
        match decision {
            SignalDecision::Blocked(GateBlock::CooldownActive { remaining_secs }) => {
                assert!((remaining_secs - 50.0).abs() < 0.5);
            }
            other => panic!("expected cooldown block, got {other:?}"),
        }
    }

    #[test]
    fn test_cleared_cooldown_allows_entry() {
        let mut fixture = Fixture::dip_buy();
        fixture
            .cooldown
            .record_loss_close(base_time() - Duration::seconds(10));
        fixture.cooldown.clear_loss_cooldown();
        let decision = evaluate(&fixture.ctx(), &Config::default());
        assert!(matches!(decision, SignalDecision::Entry(_)));
    }

    #[test]
    fn test_per_side_entry_cooldown_blocks_matched_side() {
        let mut fixture = Fixture::dip_buy();
        fixture
            .cooldown
            .record_entry(Side::Buy, base_time() - Duration::seconds(3));
        let decision = evaluate(&fixture.ctx(), &Config::default());
        assert!(matches!(
            decision,
            SignalDecision::Blocked(GateBlock::EntryCooldown {
                side: Side::Buy,
                ..
            })
        ));
    }

    #[test]
    fn test_concurrency_gate() {
        let mut fixture = Fixture::dip_buy();
        let config = Config {
            max_concurrent: 2,
            ..Config::default()
        };
        fixture.open_positions = 2;
        let decision = evaluate(&fixture.ctx(), &config);
        assert!(matches!(
            decision,
            SignalDecision::Blocked(GateBlock::ConcurrencyLimit { open: 2, limit: 2 })
        ));
    }

    #[test]
    fn test_equality_is_not_a_cross() {
        let mut fixture = Fixture::dip_buy();
        // Previous bar %K exactly equal to %D: no strict sign change
        fixture.previous = snapshot(32.0, 18.0, 18.0, 2000.0, TrendSlope::Up);
        let decision = evaluate(&fixture.ctx(), &Config::default());
        assert!(matches!(decision, SignalDecision::NoMatch));
    }

    #[test]
    fn test_flat_slope_blocks_patterns() {
        let mut fixture = Fixture::dip_buy();
        fixture.current.trend_slope = TrendSlope::Flat;
        let decision = evaluate(&fixture.ctx(), &Config::default());
        assert!(matches!(decision, SignalDecision::NoMatch));
    }

    #[test]
    fn test_unavailable_indicator_is_a_hard_block() {
        let mut fixture = Fixture::dip_buy();
        fixture.current.rsi = None;
        let decision = evaluate(&fixture.ctx(), &Config::default());
        assert!(matches!(decision, SignalDecision::NoMatch));
    }

    #[test]
    fn test_continuation_buy() {
        let ma = 2000.0;
        let fixture = Fixture {
            current: snapshot(50.0, 55.0, 50.0, ma, TrendSlope::Up),
            previous: snapshot(48.0, 45.0, 50.0, ma, TrendSlope::Up),
            // Bearish pullback bar, then a bullish bar closing above its high
            previous_bar: bar(2001.0, 2001.3, 2000.6, 2000.8),
            current_bar: bar(2000.8, 2001.8, 2000.7, 2001.6),
            quote: Quote {
                time: base_time(),
                bid: 2001.5,
                ask: 2001.7,
            },
            cooldown: CooldownState::default(),
            open_positions: 0,
            spread_points: 20.0,
        };
        let decision = evaluate(&fixture.ctx(), &Config::default());
        match decision {
            SignalDecision::Entry(signal) => {
                assert_eq!(signal.pattern, EntryPattern::ContinuationBuy)
            }
            other => panic!("expected continuation buy, got {other:?}"),
        }
    }

    #[test]
    fn test_rally_sell_mirror() {
        let ma = 2000.0;
        let fixture = Fixture {
            current: snapshot(70.0, 78.0, 82.0, ma, TrendSlope::Down),
            previous: snapshot(68.0, 85.0, 82.0, ma, TrendSlope::Down),
            // Previous bar poked above the MA and closed back below
            previous_bar: bar(1999.8, 2000.4, 1999.5, 1999.7),
            current_bar: bar(1999.7, 1999.9, 1999.0, 1999.2),
            quote: Quote {
                time: base_time(),
                bid: 1999.1,
                ask: 1999.3,
            },
            cooldown: CooldownState::default(),
            open_positions: 0,
            spread_points: 20.0,
        };
        let decision = evaluate(&fixture.ctx(), &Config::default());
        match decision {
            SignalDecision::Entry(signal) => {
                assert_eq!(signal.pattern, EntryPattern::RallySell);
                assert_eq!(signal.side, Side::Sell);
            }
            other => panic!("expected rally sell, got {other:?}"),
        }
    }

    #[test]
    fn test_continuation_sell_mirror() {
        let ma = 2000.0;
        let fixture = Fixture {
            current: snapshot(50.0, 45.0, 50.0, ma, TrendSlope::Down),
            previous: snapshot(52.0, 55.0, 50.0, ma, TrendSlope::Down),
            // Bullish rally bar, then a bearish bar closing below its low
            previous_bar: bar(1999.0, 1999.5, 1998.8, 1999.4),
            current_bar: bar(1999.4, 1999.5, 1998.3, 1998.5),
            quote: Quote {
                time: base_time(),
                bid: 1998.4,
                ask: 1998.6,
            },
            cooldown: CooldownState::default(),
            open_positions: 0,
            spread_points: 20.0,
        };
        let decision = evaluate(&fixture.ctx(), &Config::default());
        match decision {
            SignalDecision::Entry(signal) => {
                assert_eq!(signal.pattern, EntryPattern::ContinuationSell)
            }
            other => panic!("expected continuation sell, got {other:?}"),
        }
    }
}
