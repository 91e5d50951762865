//! In-process simulated venue
//!
//! Backs paper trading and the integration tests. The simulator is fed
//! ticks and trend bars explicitly, fills market orders at the touch, and
//! keeps the same position/deal bookkeeping shape a live broker reports, so
//! the engine cannot tell the difference.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::types::{
    Bar, Deal, DealEntry, OrderRequest, OrderResult, Quote, Side, SymbolMeta, Tick, VenuePosition,
};
use crate::venue::{Venue, VenueError, VenueResult};

/// Simulated venue with scripted market data and call counters
#[derive(Debug)]
pub struct SimVenue {
    meta: SymbolMeta,
    equity: f64,
    ticks: Vec<Tick>,
    trend: Vec<Bar>,
    positions: HashMap<u64, VenuePosition>,
    deals: Vec<Deal>,
    next_ticket: u64,
    reject_next_order: Option<String>,

    pub order_calls: u64,
    pub modify_calls: u64,
    pub close_calls: u64,
}

impl SimVenue {
    pub fn new(meta: SymbolMeta, equity: f64) -> Self {
        Self {
            meta,
            equity,
            ticks: Vec::new(),
            trend: Vec::new(),
            positions: HashMap::new(),
            deals: Vec::new(),
            next_ticket: 1,
            reject_next_order: None,
            order_calls: 0,
            modify_calls: 0,
            close_calls: 0,
        }
    }

    /// Defaults matching a typical gold contract
    pub fn gold_defaults() -> SymbolMeta {
        SymbolMeta {
            point: 0.01,
            contract_size: 100.0,
            volume_min: 0.01,
            volume_max: 100.0,
            volume_step: 0.01,
            stop_level_points: 0.0,
        }
    }

    /// Append scripted ticks; they become visible to `recent_ticks` and the
    /// latest one drives `quote`
    pub fn push_ticks(&mut self, ticks: &[Tick]) {
        self.ticks.extend_from_slice(ticks);
    }

    /// Replace the scripted slow-timeframe bar series
    pub fn set_trend_bars(&mut self, bars: Vec<Bar>) {
        self.trend = bars;
    }

    pub fn set_equity(&mut self, equity: f64) {
        self.equity = equity;
    }

    /// Make the next `place_order` call fail with a rejection
    pub fn reject_next_order(&mut self, reason: impl Into<String>) {
        self.reject_next_order = Some(reason.into());
    }

    pub fn position(&self, ticket: u64) -> Option<&VenuePosition> {
        self.positions.get(&ticket)
    }

    fn last_quote(&self) -> VenueResult<Quote> {
        self.ticks
            .last()
            .map(|t| Quote {
                time: t.time,
                bid: t.bid,
                ask: t.ask,
            })
            .ok_or(VenueError::NoData)
    }

    fn close_price(&self, side: Side) -> VenueResult<f64> {
        let quote = self.last_quote()?;
        Ok(match side {
            Side::Buy => quote.bid,
            Side::Sell => quote.ask,
        })
    }

    fn profit_usd(&self, pos: &VenuePosition, close_price: f64, volume: f64) -> f64 {
        let diff = match pos.side {
            Side::Buy => close_price - pos.entry_price,
            Side::Sell => pos.entry_price - close_price,
        };
        diff * volume * self.meta.contract_size
    }

    fn record_deal(&mut self, ticket: u64, price: f64, profit: f64, entry: DealEntry) {
        let time = self.ticks.last().map(|t| t.time).unwrap_or_else(Utc::now);
        self.deals.push(Deal {
            position_id: ticket,
            price,
            profit,
            time,
            entry,
        });
    }

    fn close_at(&mut self, ticket: u64, price: f64) -> VenueResult<()> {
        let pos = self
            .positions
            .remove(&ticket)
            .ok_or_else(|| VenueError::Rejected {
                code: format!("unknown ticket {ticket}"),
            })?;
        let profit = self.profit_usd(&pos, price, pos.volume);
        self.equity += profit;
        self.record_deal(ticket, price, profit, DealEntry::Out);
        Ok(())
    }

    /// Simulate the venue filling a position's stop. Closes at the stop
    /// price exactly, the way the engine later observes a stop-loss hit.
    pub fn fill_stop(&mut self, ticket: u64) -> VenueResult<()> {
        let stop = self
            .positions
            .get(&ticket)
            .and_then(|p| p.stop)
            .ok_or_else(|| VenueError::Rejected {
                code: format!("ticket {ticket} has no stop"),
            })?;
        self.close_at(ticket, stop)
    }

    /// Simulate the venue filling a position's target
    pub fn fill_target(&mut self, ticket: u64) -> VenueResult<()> {
        let target = self
            .positions
            .get(&ticket)
            .and_then(|p| p.target)
            .ok_or_else(|| VenueError::Rejected {
                code: format!("ticket {ticket} has no target"),
            })?;
        self.close_at(ticket, target)
    }
}

impl Venue for SimVenue {
    fn symbol_meta(&self) -> VenueResult<SymbolMeta> {
        Ok(self.meta)
    }

    fn account_equity(&self) -> VenueResult<f64> {
        Ok(self.equity)
    }

    fn quote(&self) -> VenueResult<Quote> {
        self.last_quote()
    }

    fn recent_ticks(&self, since: DateTime<Utc>) -> VenueResult<Vec<Tick>> {
        Ok(self
            .ticks
            .iter()
            .filter(|t| t.time > since)
            .copied()
            .collect())
    }

    fn trend_bars(&self, count: usize) -> VenueResult<Vec<Bar>> {
        let start = self.trend.len().saturating_sub(count);
        Ok(self.trend[start..].to_vec())
    }

    fn open_positions(&self) -> VenueResult<Vec<VenuePosition>> {
        let mut positions: Vec<VenuePosition> = self.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.ticket);
        Ok(positions)
    }

    fn recent_deals(&self, window: Duration) -> VenueResult<Vec<Deal>> {
        let now = self.ticks.last().map(|t| t.time).unwrap_or_else(Utc::now);
        let cutoff = now - window;
        Ok(self
            .deals
            .iter()
            .filter(|d| d.time >= cutoff)
            .cloned()
            .collect())
    }

    fn place_order(&mut self, request: &OrderRequest) -> VenueResult<OrderResult> {
        self.order_calls += 1;
        if let Some(code) = self.reject_next_order.take() {
            return Err(VenueError::Rejected { code });
        }
        if request.volume < self.meta.volume_min || request.volume > self.meta.volume_max {
            return Err(VenueError::Rejected {
                code: format!(
                    "volume {} outside [{}, {}]",
                    request.volume, self.meta.volume_min, self.meta.volume_max
                ),
            });
        }
        let quote = self.last_quote()?;
        let fill = match request.side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.positions.insert(
            ticket,
            VenuePosition {
                ticket,
                side: request.side,
                entry_price: fill,
                volume: request.volume,
                stop: Some(request.stop),
                target: Some(request.target),
                open_time: quote.time,
            },
        );
        self.record_deal(ticket, fill, 0.0, DealEntry::In);
        Ok(OrderResult { ticket })
    }

    fn modify_position(
        &mut self,
        ticket: u64,
        stop: Option<f64>,
        target: Option<f64>,
    ) -> VenueResult<()> {
        self.modify_calls += 1;
        let pos = self
            .positions
            .get_mut(&ticket)
            .ok_or_else(|| VenueError::Rejected {
                code: format!("unknown ticket {ticket}"),
            })?;
        if let Some(stop) = stop {
            pos.stop = Some(stop);
        }
        if let Some(target) = target {
            pos.target = Some(target);
        }
        Ok(())
    }

    fn close_position(
        &mut self,
        ticket: u64,
        volume: Option<f64>,
        _reason: &str,
    ) -> VenueResult<()> {
        self.close_calls += 1;
        let pos = self
            .positions
            .get(&ticket)
            .cloned()
            .ok_or_else(|| VenueError::Rejected {
                code: format!("unknown ticket {ticket}"),
            })?;

        match volume {
            Some(volume) if volume < pos.volume => {
                let price = self.close_price(pos.side)?;
                let profit = self.profit_usd(&pos, price, volume);
                self.equity += profit;
                self.record_deal(ticket, price, profit, DealEntry::OutBy);
                if let Some(open) = self.positions.get_mut(&ticket) {
                    open.volume -= volume;
                }
                Ok(())
            }
            _ => {
                let price = self.close_price(pos.side)?;
                self.close_at(ticket, price)
            }
        }
    }
}
