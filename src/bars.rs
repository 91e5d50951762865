//! Tick-to-bar aggregation
//!
//! Folds the venue's tick stream into fixed-interval OHLCV bars keyed by the
//! floor of the tick time to the interval boundary. A bucket closes (and is
//! emitted) the moment a tick from a later bucket arrives; closed buckets are
//! never reopened, and ticks behind the last closed bucket are dropped.

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::types::{Bar, Tick};

#[derive(Debug, Clone)]
struct PendingBar {
    start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    /// Newest tick time folded into this bucket; older arrivals are stale
    last_tick_time: DateTime<Utc>,
}

impl PendingBar {
    fn new(start: DateTime<Utc>, tick: &Tick) -> Self {
        let mid = tick.mid();
        Self {
            start,
            open: mid,
            high: mid,
            low: mid,
            close: mid,
            volume: tick.volume,
            last_tick_time: tick.time,
        }
    }

    fn apply(&mut self, tick: &Tick) {
        let mid = tick.mid();
        self.high = self.high.max(mid);
        self.low = self.low.min(mid);
        self.close = mid;
        self.volume += tick.volume;
        self.last_tick_time = tick.time;
    }

    fn finish(self) -> Bar {
        Bar {
            start: self.start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Stateful tick-stream aggregator with a bounded rolling bar window
#[derive(Debug)]
pub struct BarAggregator {
    interval_secs: i64,
    capacity: usize,
    window: Vec<Bar>,
    pending: Option<PendingBar>,
    last_tick: Option<Tick>,
    dropped: u64,
}

impl BarAggregator {
    /// `capacity` is the number of completed bars retained; older bars are
    /// evicted from the front of the window.
    pub fn new(interval_secs: u64, capacity: usize) -> Self {
        Self {
            interval_secs: interval_secs.max(1) as i64,
            capacity: capacity.max(2),
            window: Vec::new(),
            pending: None,
            last_tick: None,
            dropped: 0,
        }
    }

    /// Bucket start for a tick time: floor to the interval boundary
    fn bucket_of(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let secs = time.timestamp().div_euclid(self.interval_secs) * self.interval_secs;
        Utc.timestamp_opt(secs, 0).single().unwrap_or(time)
    }

    /// Fold a batch of ticks, returning bars completed by this batch in time
    /// order. An empty or undersized batch yields no bars; that is a normal
    /// "no data yet" outcome, not an error.
    pub fn ingest(&mut self, ticks: &[Tick]) -> Vec<Bar> {
        let mut completed = Vec::new();

        for tick in ticks {
            // Duplicate delivery: identical tick seen back to back
            if self.last_tick.as_ref() == Some(tick) {
                continue;
            }

            let bucket = self.bucket_of(tick.time);

            // Out of causal order relative to already-closed buckets
            let floor = match (&self.pending, self.window.last()) {
                (Some(pending), _) => Some(pending.start),
                (None, Some(last)) => Some(last.start + chrono::Duration::seconds(self.interval_secs)),
                (None, None) => None,
            };
            if let Some(floor) = floor {
                if bucket < floor {
                    self.dropped += 1;
                    debug!(
                        tick_time = %tick.time,
                        bucket = %bucket,
                        "dropping tick behind the working bucket"
                    );
                    continue;
                }
            }

            match self.pending.as_mut() {
                Some(pending) if pending.start == bucket => {
                    // Late or redelivered tick inside the open bucket: the
                    // close must stay the mid of the newest tick
                    if tick.time < pending.last_tick_time {
                        self.dropped += 1;
                        debug!(
                            tick_time = %tick.time,
                            cursor = %pending.last_tick_time,
                            "dropping tick behind the working bucket cursor"
                        );
                        continue;
                    }
                    pending.apply(tick);
                }
                Some(_) => {
                    // A later bucket supersedes the working one: close it out
                    let finished = self
                        .pending
                        .take()
                        .map(PendingBar::finish)
                        .filter(|bar| bar.validate().is_ok());
                    if let Some(bar) = finished {
                        self.window.push(bar.clone());
                        completed.push(bar);
                    }
                    self.pending = Some(PendingBar::new(bucket, tick));
                }
                None => self.pending = Some(PendingBar::new(bucket, tick)),
            }

            self.last_tick = Some(*tick);
        }

        if self.window.len() > self.capacity {
            let excess = self.window.len() - self.capacity;
            self.window.drain(..excess);
        }

        completed
    }

    /// Completed bars, oldest first
    pub fn bars(&self) -> &[Bar] {
        &self.window
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.window.last()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Timestamp of the newest tick folded so far (used as the incremental
    /// fetch cursor)
    pub fn last_tick_time(&self) -> Option<DateTime<Utc>> {
        self.last_tick.map(|t| t.time)
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped
    }
}
