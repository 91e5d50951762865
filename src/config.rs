//! Configuration management
//!
//! Loads the strategy parameters from a JSON file and clamps everything to
//! safe bounds at load time. Out-of-range values are corrected, never
//! rejected; the running loop periodically re-reads the file and swaps in a
//! fresh immutable snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Hard ceiling on per-trade risk, applied regardless of the configured value
pub const RISK_PCT_CEILING: f64 = 0.05;

/// Strategy configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instrument symbol (single-instrument engine)
    pub symbol: String,

    /// Tick-bar interval in seconds
    pub bar_interval_secs: u64,

    /// RSI period on tick bars
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,

    /// Stochastic %K period
    pub k_period: usize,
    /// Stochastic %D period (SMA of %K)
    pub d_period: usize,
    pub stoch_oversold: f64,
    pub stoch_overbought: f64,

    /// ATR period on tick bars
    pub atr_period: usize,
    /// ATR multiplier for the trailing stop distance
    pub atr_multiplier: f64,

    /// Initial stop distance in points
    pub sl_points: f64,
    /// Fallback take-profit distance in points when ATR is unavailable
    pub tp_points: f64,
    /// Dynamic TP distance = ATR (points) x this multiplier
    pub tp_atr_multiplier: f64,
    pub min_tp_points: f64,
    pub max_tp_points: f64,

    /// Fraction of equity risked per trade (clamped to RISK_PCT_CEILING)
    pub risk_pct: f64,

    /// Profit in points to move the stop to break-even
    pub be_trigger_points: f64,
    /// Buffer past entry for the break-even stop
    pub be_buffer_points: f64,

    /// Aggressive limiter trigger = sl_points x this + fixed buffer
    pub aggressive_trigger_pct: f64,
    pub aggressive_fixed_buffer_points: f64,
    /// Minimum distance from current price for the aggressive stop
    pub aggressive_min_distance_points: f64,

    /// Bars of lookback for the support/resistance window
    pub sr_lookback_bars: usize,
    /// Buffer in points past a breached S/R level
    pub sr_breach_buffer_points: f64,

    /// Emergency full-close ceiling on adverse excursion, in points
    pub max_adverse_points: f64,

    /// Profit in points that triggers a partial close
    pub partial_trigger_points: f64,
    /// Fraction of volume closed by the partial take (clamped to [0, 1])
    pub partial_fraction: f64,

    /// Maximum spread in points to allow a new entry
    pub max_spread_points: f64,
    /// Maximum hold time before an unprofitable position is closed
    pub max_hold_secs: u64,
    /// Maximum concurrently open positions
    pub max_concurrent: usize,

    /// Cooldown after a loss-making closure
    pub cooldown_secs: u64,
    /// Cooldown between entries of the same side
    pub entry_cooldown_secs: u64,
    /// Monetary loss that activates the post-loss cooldown
    pub loss_threshold_usd: f64,
    /// Price-based loss (points) that activates the post-loss cooldown
    pub loss_threshold_points: f64,

    /// Trend MA period on the slow timeframe
    pub trend_ma_period: usize,
    /// Bars back to compare for the MA slope
    pub ma_slope_lookback: usize,
    /// Consecutive confirming bars required to lift the cooldown early
    pub reversal_confirmation_bars: u32,

    /// Reload the config file every N loop iterations
    pub config_reload_every: u64,
    /// Refresh the slow-timeframe trend MA every N loop iterations
    pub trend_refresh_every: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "XAUUSD".to_string(),
            bar_interval_secs: 5,
            rsi_period: 14,
            rsi_oversold: 35.0,
            rsi_overbought: 65.0,
            k_period: 14,
            d_period: 3,
            stoch_oversold: 25.0,
            stoch_overbought: 75.0,
            atr_period: 14,
            atr_multiplier: 1.0,
            sl_points: 150.0,
            tp_points: 500.0,
            tp_atr_multiplier: 2.0,
            min_tp_points: 50.0,
            max_tp_points: 1000.0,
            risk_pct: 0.03,
            be_trigger_points: 75.0,
            be_buffer_points: 22.0,
            aggressive_trigger_pct: 0.20,
            aggressive_fixed_buffer_points: 5.0,
            aggressive_min_distance_points: 5.0,
            sr_lookback_bars: 30,
            sr_breach_buffer_points: 3.0,
            max_adverse_points: 200.0,
            partial_trigger_points: 150.0,
            partial_fraction: 0.50,
            max_spread_points: 35.0,
            max_hold_secs: 120,
            max_concurrent: 50,
            cooldown_secs: 60,
            entry_cooldown_secs: 10,
            loss_threshold_usd: 0.01,
            loss_threshold_points: 5.0,
            trend_ma_period: 100,
            ma_slope_lookback: 2,
            reversal_confirmation_bars: 1,
            config_reload_every: 30,
            trend_refresh_every: 5,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, clamping to safe bounds
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.clamp();
        Ok(config)
    }

    /// Enforce safety bounds on all parameters. Invalid values are clamped,
    /// not rejected, so a bad edit to the file cannot halt the loop.
    pub fn clamp(&mut self) {
        self.risk_pct = self.risk_pct.clamp(0.0, RISK_PCT_CEILING);
        self.partial_fraction = self.partial_fraction.clamp(0.0, 1.0);
        self.aggressive_trigger_pct = self.aggressive_trigger_pct.clamp(0.0, 1.0);

        self.rsi_period = self.rsi_period.max(1);
        self.k_period = self.k_period.max(1);
        self.d_period = self.d_period.max(1);
        self.atr_period = self.atr_period.max(1);
        self.trend_ma_period = self.trend_ma_period.max(1);
        self.ma_slope_lookback = self.ma_slope_lookback.max(1);
        self.sr_lookback_bars = self.sr_lookback_bars.max(1);
        self.bar_interval_secs = self.bar_interval_secs.max(1);
        self.config_reload_every = self.config_reload_every.max(1);
        self.trend_refresh_every = self.trend_refresh_every.max(1);
        self.reversal_confirmation_bars = self.reversal_confirmation_bars.max(1);

        self.sl_points = self.sl_points.max(0.0);
        self.tp_points = self.tp_points.max(0.0);
        self.min_tp_points = self.min_tp_points.max(0.0);
        self.max_tp_points = self.max_tp_points.max(self.min_tp_points);
        self.be_trigger_points = self.be_trigger_points.max(0.0);
        self.be_buffer_points = self.be_buffer_points.max(0.0);
        self.max_adverse_points = self.max_adverse_points.max(0.0);
        self.partial_trigger_points = self.partial_trigger_points.max(0.0);
        self.max_spread_points = self.max_spread_points.max(0.0);
        self.loss_threshold_points = self.loss_threshold_points.max(0.0);
    }

    /// Bars retained in the rolling window: longest indicator lookback with
    /// a safety margin, plus slope lookback.
    pub fn history_bars_needed(&self) -> usize {
        self.rsi_period
            .max(self.atr_period)
            .max(self.sr_lookback_bars)
            .max(self.k_period + self.d_period)
            * 2
            + 5
            + self.ma_slope_lookback
    }

    /// Minimum bars before any entry decision is attempted
    pub fn min_bars_for_signals(&self) -> usize {
        self.rsi_period
            .max(self.atr_period)
            .max(self.sr_lookback_bars)
            .max(self.k_period + self.d_period)
            + 2
    }

    /// Minutes of tick history requested to prime the bar window at startup
    pub fn history_minutes(&self) -> u64 {
        let minutes = self.history_bars_needed() as u64 * self.bar_interval_secs / 60 + 5;
        minutes.max(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_within_bounds() {
        let mut config = Config::default();
        let before = format!("{config:?}");
        config.clamp();
        assert_eq!(before, format!("{config:?}"));
    }

    #[test]
    fn test_risk_pct_clamped_to_ceiling() {
        let mut config = Config {
            risk_pct: 0.50,
            ..Config::default()
        };
        config.clamp();
        assert_eq!(config.risk_pct, RISK_PCT_CEILING);
    }

    #[test]
    fn test_degenerate_periods_clamped() {
        let mut config = Config {
            rsi_period: 0,
            partial_fraction: 1.7,
            max_tp_points: 10.0,
            min_tp_points: 50.0,
            ..Config::default()
        };
        config.clamp();
        assert_eq!(config.rsi_period, 1);
        assert_eq!(config.partial_fraction, 1.0);
        assert!(config.max_tp_points >= config.min_tp_points);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"rsi_oversold": 30.0, "max_spread_points": 20.0}"#).unwrap();
        assert_eq!(parsed.rsi_oversold, 30.0);
        assert_eq!(parsed.max_spread_points, 20.0);
        assert_eq!(parsed.rsi_period, 14);
    }

    #[test]
    fn test_history_window_formula() {
        let config = Config::default();
        // max(14, 14, 30, 17) * 2 + 5 + 2
        assert_eq!(config.history_bars_needed(), 67);
        assert_eq!(config.history_minutes(), 30);
    }
}
