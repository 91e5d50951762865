//! Post-stop-loss reversal confirmation
//!
//! After a stop-loss closure the entry gates go quiet for the cooldown
//! window, but a genuine reversal should not have to wait it out. The watch
//! records the trend MA at the moment of the stop-out and counts completed
//! bars closing on the far side of it; reaching the configured streak lifts
//! the cooldown early. Any bar failing to close on the confirming side
//! breaks the pattern and deactivates the watch, as does a profitable
//! closure or a fresh entry.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{Bar, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// No watch armed
    Idle,
    /// Armed, confirmation streak not yet complete
    Pending { streak: u32, required: u32 },
    /// Streak complete: the cooldown may be lifted; the watch has reset
    Confirmed(Side),
}

#[derive(Debug, Clone, Copy)]
struct ActiveWatch {
    /// Side being confirmed (opposite of the side that stopped out)
    side: Side,
    /// Trend MA value recorded when the stop-loss hit
    ma_level: f64,
    streak: u32,
    armed_at: DateTime<Utc>,
}

/// Confirmation state machine, stepped once per newly completed bar
#[derive(Debug, Clone, Default)]
pub struct ReversalWatch {
    active: Option<ActiveWatch>,
    last_bar_start: Option<DateTime<Utc>>,
}

impl ReversalWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm after a stop-loss closure, recording the trend MA at the trigger.
    /// The watched direction is the opposite of the side that just lost;
    /// re-arming replaces any prior watch.
    pub fn arm(&mut self, losing_side: Side, ma_level: f64, at: DateTime<Utc>) {
        let side = losing_side.opposite();
        self.active = Some(ActiveWatch {
            side,
            ma_level,
            streak: 0,
            armed_at: at,
        });
        self.last_bar_start = None;
        debug!(watch_side = %side, ma_level, "reversal watch armed");
    }

    /// Forced back to inactive (profitable closure, new entry)
    pub fn disarm(&mut self) {
        *self = Self::default();
    }

    pub fn is_armed(&self) -> bool {
        self.active.is_some()
    }

    /// Step the watch with a completed bar against the required streak
    /// length. Bars that opened before the watch was armed, and bars already
    /// seen, carry no information. A close strictly on the confirming side of
    /// the recorded MA extends the streak; any other close (back on the
    /// stopped-out side, or exactly on the MA) breaks the pattern and
    /// deactivates the watch. A confirmed outcome resets the watch.
    pub fn step(&mut self, bar: &Bar, required: u32) -> WatchOutcome {
        let mut watch = match self.active {
            Some(watch) => watch,
            None => return WatchOutcome::Idle,
        };
        let required = required.max(1);

        let stale = bar.start < watch.armed_at
            || self.last_bar_start.is_some_and(|last| bar.start <= last);
        if !stale {
            self.last_bar_start = Some(bar.start);
            let confirming = match watch.side {
                Side::Buy => bar.close > watch.ma_level,
                Side::Sell => bar.close < watch.ma_level,
            };
            if !confirming {
                debug!(
                    side = %watch.side,
                    close = bar.close,
                    ma_level = watch.ma_level,
                    "reversal watch broken"
                );
                self.disarm();
                return WatchOutcome::Idle;
            }
            watch.streak += 1;
        }

        if watch.streak >= required {
            debug!(side = %watch.side, streak = watch.streak, "reversal confirmed");
            self.disarm();
            WatchOutcome::Confirmed(watch.side)
        } else {
            self.active = Some(watch);
            WatchOutcome::Pending {
                streak: watch.streak,
                required,
            }
        }
    }
}
