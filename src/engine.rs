//! Strategy loop orchestration
//!
//! `Engine` owns every piece of mutable state (bar window, tracked
//! positions, cooldown timers, reversal watch, config snapshot, iteration
//! counter) and drives one venue through synchronous cycles. One call to
//! `cycle` is one full pass: refresh inputs, reconcile against venue truth,
//! evaluate an entry, manage the open book. A cycle that fails leaves state
//! to be re-synchronized on the next successful reconcile.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::bars::BarAggregator;
use crate::config::Config;
use crate::events::{Event, EventSink};
use crate::indicators::{self, IndicatorSnapshot};
use crate::position::{self, CloseReason, MarketView, PositionIntent};
use crate::reversal::{ReversalWatch, WatchOutcome};
use crate::signal::{self, CooldownState, EntrySignal, SignalContext, SignalDecision};
use crate::types::{
    ClosureType, Deal, DealEntry, OrderRequest, Quote, Side, SymbolMeta, TrackedPosition,
    TrendSlope,
};
use crate::venue::Venue;

/// How far back closure attribution looks for deals
const DEAL_LOOKBACK_MINUTES: i64 = 30;
/// Tolerance when matching a closing price against a stop/target level
const CLASSIFY_TOLERANCE_POINTS: f64 = 5.0;

pub struct Engine<V: Venue, S: EventSink> {
    venue: V,
    sink: S,
    config: Config,
    config_path: Option<PathBuf>,
    meta: SymbolMeta,
    aggregator: BarAggregator,
    cooldown: CooldownState,
    reversal: ReversalWatch,
    tracked: HashMap<u64, TrackedPosition>,
    pending_close: HashMap<u64, CloseReason>,
    trend_ma: Option<f64>,
    trend_slope: TrendSlope,
    iteration: u64,
}

impl<V: Venue, S: EventSink> Engine<V, S> {
    /// Connect to the venue, prime the bar window from tick history and take
    /// the first trend reading.
    pub fn new(
        venue: V,
        sink: S,
        config: Config,
        config_path: Option<PathBuf>,
    ) -> Result<Self> {
        let meta = venue
            .symbol_meta()
            .context("failed to fetch symbol metadata")?;
        let aggregator = BarAggregator::new(
            config.bar_interval_secs,
            config.history_bars_needed(),
        );

        let mut engine = Self {
            venue,
            sink,
            config,
            config_path,
            meta,
            aggregator,
            cooldown: CooldownState::default(),
            reversal: ReversalWatch::new(),
            tracked: HashMap::new(),
            pending_close: HashMap::new(),
            trend_ma: None,
            trend_slope: TrendSlope::Unknown,
            iteration: 0,
        };

        engine.prime_bars()?;
        engine.refresh_trend();
        engine.sink.emit(Event::EngineStarted {
            symbol: engine.config.symbol.clone(),
            bars_primed: engine.aggregator.len(),
        });
        Ok(engine)
    }

    pub fn venue(&self) -> &V {
        &self.venue
    }

    pub fn venue_mut(&mut self) -> &mut V {
        &mut self.venue
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn open_position_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn tracked_position(&self, ticket: u64) -> Option<&TrackedPosition> {
        self.tracked.get(&ticket)
    }

    fn prime_bars(&mut self) -> Result<()> {
        let now = match self.venue.quote() {
            Ok(quote) => quote.time,
            Err(_) => return Ok(()), // no market data yet; backfill on first cycle
        };
        let since = now - Duration::minutes(self.config.history_minutes() as i64);
        let ticks = self
            .venue
            .recent_ticks(since)
            .context("failed to backfill tick history")?;
        self.aggregator.ingest(&ticks);
        Ok(())
    }

    /// One full strategy pass. Errors bubble to the loop boundary where they
    /// are logged; the next cycle starts from venue truth again.
    pub fn cycle(&mut self) -> Result<()> {
        self.iteration += 1;

        // 1. Periodic config reload
        if self.iteration % self.config.config_reload_every == 0 {
            self.reload_config();
        }

        // 2. Fold new ticks into bars
        let quote = self.venue.quote().context("failed to fetch quote")?;
        let now = quote.time;
        let since = self
            .aggregator
            .last_tick_time()
            .unwrap_or_else(|| now - Duration::minutes(self.config.history_minutes() as i64));
        let ticks = self
            .venue
            .recent_ticks(since)
            .context("failed to fetch ticks")?;
        let new_bars = self.aggregator.ingest(&ticks);

        // 3. Periodic trend refresh
        if self.iteration == 1 || self.iteration % self.config.trend_refresh_every == 0 {
            self.refresh_trend();
        }

        // 4. Reconcile against the venue's open-position list
        self.reconcile(now)
            .context("failed to reconcile positions")?;

        // 5. Step the reversal watch with each newly completed bar
        for bar in &new_bars {
            if let WatchOutcome::Confirmed(side) =
                self.reversal.step(bar, self.config.reversal_confirmation_bars)
            {
                self.cooldown.clear_loss_cooldown();
                self.sink.emit(Event::CooldownLifted { side });
            }
        }

        // 6-7. Entry evaluation once the window is warm
        let snapshot = self.evaluate_entry(&quote, now);

        // 8. Risk-manage the open book
        self.manage_positions(&quote, snapshot.as_ref().map(|(current, _)| current), now);

        // 9. Periodic snapshot event
        let current = snapshot.map(|(current, _)| current);
        self.sink.emit(Event::Snapshot {
            rsi: current.and_then(|s| s.rsi),
            stoch_k: current.and_then(|s| s.stoch_k),
            stoch_d: current.and_then(|s| s.stoch_d),
            atr: current.and_then(|s| s.atr),
            trend_ma: self.trend_ma,
            slope: self.trend_slope,
            open_positions: self.tracked.len(),
        });

        Ok(())
    }

    fn reload_config(&mut self) {
        let path = match &self.config_path {
            Some(path) => path.clone(),
            None => return,
        };
        match Config::from_file(&path) {
            Ok(mut fresh) => {
                // The instrument is fixed for the life of the engine
                fresh.symbol = self.config.symbol.clone();
                self.config = fresh;
                self.sink.emit(Event::ConfigReloaded);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config reload failed, keeping previous");
                self.sink.emit(Event::CycleError {
                    context: "config_reload".to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    fn refresh_trend(&mut self) {
        let count = self.config.trend_ma_period + self.config.ma_slope_lookback + 2;
        match self.venue.trend_bars(count) {
            Ok(bars) => {
                let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
                let ma_series = indicators::sma(&closes, self.config.trend_ma_period);
                self.trend_ma = ma_series.last().copied().flatten();
                self.trend_slope =
                    indicators::trend_slope(&ma_series, self.config.ma_slope_lookback);
                self.sink.emit(Event::TrendRefreshed {
                    ma: self.trend_ma,
                    slope: self.trend_slope,
                });
            }
            Err(err) => {
                warn!(error = %err, "trend refresh failed, keeping previous reading");
                self.sink.emit(Event::CycleError {
                    context: "trend_refresh".to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    /// Diff the tracked book against the venue's list. New tickets are
    /// adopted; vanished tickets get their closure attributed from recent
    /// deals; surviving tickets take the venue's stop/target/volume as truth.
    fn reconcile(&mut self, now: DateTime<Utc>) -> Result<()> {
        let venue_positions = self
            .venue
            .open_positions()
            .context("failed to list open positions")?;

        let mut live: HashMap<u64, ()> = HashMap::new();
        for vp in &venue_positions {
            live.insert(vp.ticket, ());
            match self.tracked.get_mut(&vp.ticket) {
                Some(tracked) => {
                    tracked.volume = vp.volume;
                    tracked.stop = vp.stop;
                    tracked.target = vp.target;
                }
                None => {
                    debug!(ticket = vp.ticket, "adopting externally opened position");
                    self.tracked.insert(vp.ticket, TrackedPosition::from_venue(vp));
                }
            }
        }

        let gone: Vec<u64> = self
            .tracked
            .keys()
            .filter(|t| !live.contains_key(t))
            .copied()
            .collect();
        if gone.is_empty() {
            return Ok(());
        }

        let deals = self
            .venue
            .recent_deals(Duration::minutes(DEAL_LOOKBACK_MINUTES))
            .unwrap_or_default();
        for ticket in gone {
            if let Some(position) = self.tracked.remove(&ticket) {
                self.attribute_closure(position, &deals, now);
            }
        }
        Ok(())
    }

    fn attribute_closure(&mut self, position: TrackedPosition, deals: &[Deal], now: DateTime<Utc>) {
        let ticket = position.ticket;
        let own: Vec<&Deal> = deals.iter().filter(|d| d.position_id == ticket).collect();
        let pnl: f64 = own
            .iter()
            .filter(|d| d.entry != DealEntry::In)
            .map(|d| d.profit)
            .sum();
        let closing = own.iter().rev().find(|d| d.entry != DealEntry::In);

        let close_price = closing.map(|d| d.price).unwrap_or(position.entry_price);
        let points = if self.meta.point > 0.0 {
            match position.side {
                Side::Buy => (close_price - position.entry_price) / self.meta.point,
                Side::Sell => (position.entry_price - close_price) / self.meta.point,
            }
        } else {
            0.0
        };

        let closure = self.classify_closure(&position, closing);
        self.sink.emit(Event::PositionClosed {
            ticket,
            pnl,
            points,
            closure,
        });

        // Raw P/L is authoritative for cooldown, whatever the classification
        let lost = pnl < -self.config.loss_threshold_usd
            || points < -self.config.loss_threshold_points;
        if lost {
            self.cooldown.record_loss_close(now);
            self.sink.emit(Event::CooldownStarted {
                secs: self.config.cooldown_secs,
            });
            if closure == ClosureType::SlHit {
                if let Some(ma) = self.trend_ma {
                    self.reversal.arm(position.side, ma, now);
                }
            }
        } else if pnl > 0.0 {
            // A winner voids any pending reversal confirmation
            self.reversal.disarm();
        }
    }

    /// Best effort: the engine's own pending close reason wins, then the
    /// deal-entry kind, then price proximity to the last-acknowledged levels.
    fn classify_closure(
        &mut self,
        position: &TrackedPosition,
        closing: Option<&&Deal>,
    ) -> ClosureType {
        if let Some(reason) = self.pending_close.remove(&position.ticket) {
            return match reason {
                CloseReason::TimeExit => ClosureType::TimeExit,
                CloseReason::MaxAdverseExcursion => ClosureType::MaxAdverseExcursion,
            };
        }
        let closing = match closing {
            Some(deal) => deal,
            None => return ClosureType::ManualOther,
        };
        if closing.entry == DealEntry::OutBy {
            return ClosureType::PartialProfit;
        }
        let tolerance = CLASSIFY_TOLERANCE_POINTS * self.meta.point;
        if let Some(stop) = position.stop {
            if (closing.price - stop).abs() <= tolerance {
                return ClosureType::SlHit;
            }
        }
        if let Some(target) = position.target {
            if (closing.price - target).abs() <= tolerance {
                return ClosureType::TpHit;
            }
        }
        ClosureType::ManualOther
    }

    fn evaluate_entry(
        &mut self,
        quote: &Quote,
        now: DateTime<Utc>,
    ) -> Option<(IndicatorSnapshot, IndicatorSnapshot)> {
        let bars = self.aggregator.bars();
        if bars.len() < self.config.min_bars_for_signals() {
            return None;
        }
        let (current, previous) = indicators::compute_snapshot_pair(
            bars,
            &self.config,
            self.trend_ma,
            self.trend_slope,
        )?;

        let current_bar = &bars[bars.len() - 1];
        let previous_bar = &bars[bars.len() - 2];
        let ctx = SignalContext {
            current: &current,
            previous: &previous,
            current_bar,
            previous_bar,
            quote,
            spread_points: quote.spread_points(self.meta.point),
            open_positions: self.tracked.len(),
            cooldown: &self.cooldown,
            now,
        };

        match signal::evaluate(&ctx, &self.config) {
            SignalDecision::Entry(entry) => {
                let atr = current.atr;
                self.place_entry(entry, quote, atr, now);
            }
            SignalDecision::Blocked(block) => self.sink.emit(Event::GateBlocked(block)),
            SignalDecision::NoMatch => {}
        }

        Some((current, previous))
    }

    fn place_entry(
        &mut self,
        entry: EntrySignal,
        quote: &Quote,
        atr: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let side = entry.side;
        let equity = match self.venue.account_equity() {
            Ok(equity) => equity,
            Err(err) => {
                self.sink.emit(Event::CycleError {
                    context: "account_equity".to_string(),
                    error: err.to_string(),
                });
                return;
            }
        };

        let volume = self.size_volume(equity);
        let point = self.meta.point;
        let price = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        let sl_dist = self.config.sl_points * point;
        let tp_points = atr
            .map(|atr| {
                (atr / point * self.config.tp_atr_multiplier)
                    .clamp(self.config.min_tp_points, self.config.max_tp_points)
            })
            .unwrap_or(self.config.tp_points);
        let tp_dist = tp_points * point;
        let (stop, target) = match side {
            Side::Buy => (price - sl_dist, price + tp_dist),
            Side::Sell => (price + sl_dist, price - tp_dist),
        };
        let stop = round_price(stop, point);
        let target = round_price(target, point);

        self.sink.emit(Event::SignalMatched(entry));

        let request = OrderRequest {
            side,
            price,
            volume,
            stop,
            target,
            comment: format!("scalp_{side}").to_lowercase(),
        };
        match self.venue.place_order(&request) {
            Ok(result) => {
                self.cooldown.record_entry(side, now);
                // A fresh position makes any reversal confirmation moot
                self.reversal.disarm();
                self.tracked.insert(
                    result.ticket,
                    TrackedPosition {
                        ticket: result.ticket,
                        side,
                        entry_price: price,
                        volume,
                        stop: Some(stop),
                        target: Some(target),
                        open_time: now,
                        partial_taken: false,
                    },
                );
                self.sink.emit(Event::OrderPlaced {
                    ticket: result.ticket,
                    side,
                    price,
                    volume,
                    stop,
                    target,
                });
            }
            Err(err) => {
                self.sink.emit(Event::OrderRejected {
                    side,
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Fixed-fraction sizing: risk `risk_pct` of equity against the initial
    /// stop distance, floored to the venue's volume step.
    fn size_volume(&self, equity: f64) -> f64 {
        let risk_usd = equity * self.config.risk_pct;
        let per_unit = self.config.sl_points * self.meta.point * self.meta.contract_size;
        if per_unit <= 0.0 || self.meta.volume_step <= 0.0 {
            return self.meta.volume_min;
        }
        let raw = risk_usd / per_unit;
        let stepped = (raw / self.meta.volume_step).floor() * self.meta.volume_step;
        stepped.clamp(self.meta.volume_min, self.meta.volume_max)
    }

    fn manage_positions(
        &mut self,
        quote: &Quote,
        snapshot: Option<&IndicatorSnapshot>,
        now: DateTime<Utc>,
    ) {
        let mut tickets: Vec<u64> = self.tracked.keys().copied().collect();
        tickets.sort_unstable();

        let atr = snapshot.and_then(|s| s.atr);
        for ticket in tickets {
            let position = match self.tracked.get(&ticket) {
                Some(position) => position.clone(),
                None => continue,
            };
            let view = MarketView {
                quote,
                atr,
                bars: self.aggregator.bars(),
                meta: &self.meta,
                now,
            };
            let intents = position::manage(&position, &view, &self.config);
            for intent in intents {
                self.dispatch(intent);
            }
        }
    }

    fn dispatch(&mut self, intent: PositionIntent) {
        match intent {
            PositionIntent::PartialClose { ticket, volume } => {
                match self.venue.close_position(ticket, Some(volume), "partial_profit") {
                    Ok(()) => {
                        if let Some(tracked) = self.tracked.get_mut(&ticket) {
                            tracked.partial_taken = true;
                            tracked.volume -= volume;
                        }
                        self.sink.emit(Event::PartialTaken { ticket, volume });
                    }
                    Err(err) => self.sink.emit(Event::CycleError {
                        context: format!("partial_close:{ticket}"),
                        error: err.to_string(),
                    }),
                }
            }
            PositionIntent::Close { ticket, reason } => {
                self.pending_close.insert(ticket, reason);
                match self.venue.close_position(ticket, None, reason.as_str()) {
                    Ok(()) => self.sink.emit(Event::CloseIssued { ticket, reason }),
                    Err(err) => {
                        self.pending_close.remove(&ticket);
                        self.sink.emit(Event::CycleError {
                            context: format!("close:{ticket}"),
                            error: err.to_string(),
                        });
                    }
                }
            }
            PositionIntent::ModifyStop { ticket, stop, rule } => {
                // Idempotence: never re-send an acknowledged level
                let acknowledged = self
                    .tracked
                    .get(&ticket)
                    .and_then(|t| t.stop)
                    .is_some_and(|current| (current - stop).abs() <= 1e-9);
                if acknowledged {
                    return;
                }
                match self.venue.modify_position(ticket, Some(stop), None) {
                    Ok(()) => {
                        if let Some(tracked) = self.tracked.get_mut(&ticket) {
                            tracked.stop = Some(stop);
                        }
                        self.sink.emit(Event::StopModified { ticket, stop, rule });
                    }
                    Err(err) => self.sink.emit(Event::CycleError {
                        context: format!("modify:{ticket}"),
                        error: err.to_string(),
                    }),
                }
            }
        }
    }
}

fn round_price(price: f64, point: f64) -> f64 {
    if point <= 0.0 {
        return price;
    }
    (price / point).round() * point
}
