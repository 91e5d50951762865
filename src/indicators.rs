//! Technical indicators
//!
//! All series functions return one value per input bar, with `None` until the
//! lookback is fully satisfied. `None` means "unavailable" and callers must
//! treat it as a hard block on decisions, never substitute a default.

use crate::types::{Bar, TrendSlope};
use crate::Config;

/// Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if period == 0 || i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Wilder-style exponential smoothing: an EWMA with center of mass
/// period - 1 (alpha = 1/period), recursing from the first value. Output is
/// masked until `period` observations have been seen.
pub fn wilder_ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let alpha = 1.0 / period as f64;
    let mut smoothed = values[0];

    for (i, &value) in values.iter().enumerate() {
        if i > 0 {
            smoothed += alpha * (value - smoothed);
        }
        if i + 1 >= period {
            result.push(Some(smoothed));
        } else {
            result.push(None);
        }
    }

    result
}

/// Relative Strength Index with Wilder smoothing of gains and losses.
///
/// A window with no losses yields RSI = 100 by definition, not an error.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut gains = Vec::with_capacity(closes.len());
    let mut losses = Vec::with_capacity(closes.len());

    if closes.is_empty() {
        return Vec::new();
    }

    gains.push(0.0);
    losses.push(0.0);

    for i in 1..closes.len() {
        let change = closes[i] - closes[i - 1];
        gains.push(if change > 0.0 { change } else { 0.0 });
        losses.push(if change < 0.0 { -change } else { 0.0 });
    }

    let avg_gains = wilder_ema(&gains, period);
    let avg_losses = wilder_ema(&losses, period);

    let mut result = Vec::with_capacity(closes.len());

    for i in 0..closes.len() {
        // Require `period` actual price changes, not just `period` bars
        if i < period {
            result.push(None);
            continue;
        }
        match (avg_gains[i], avg_losses[i]) {
            (Some(avg_gain), Some(avg_loss)) => {
                let value = if avg_loss == 0.0 {
                    100.0
                } else {
                    let rs = avg_gain / avg_loss;
                    100.0 - (100.0 / (1.0 + rs))
                };
                result.push(Some(value.clamp(0.0, 100.0)));
            }
            _ => result.push(None),
        }
    }

    result
}

/// Stochastic Oscillator %K and %D.
///
/// %K = 100 x (close - lowest low) / (highest high - lowest low) over the %K
/// window. A zero range carries the last valid %K forward (50 when none
/// exists yet, the flat-market convention). %D is the SMA of %K.
pub fn stochastic(
    bars: &[Bar],
    k_period: usize,
    d_period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut percent_k: Vec<Option<f64>> = Vec::with_capacity(bars.len());
    let mut last_valid_k: Option<f64> = None;

    for i in 0..bars.len() {
        if k_period == 0 || i + 1 < k_period {
            percent_k.push(None);
            continue;
        }

        let window = &bars[i + 1 - k_period..=i];
        let lowest_low = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let highest_high = window
            .iter()
            .map(|b| b.high)
            .fold(f64::NEG_INFINITY, f64::max);
        let range = highest_high - lowest_low;

        let value = if range > 0.0 {
            let k = 100.0 * (bars[i].close - lowest_low) / range;
            last_valid_k = Some(k.clamp(0.0, 100.0));
            last_valid_k
        } else {
            // Flat window: forward-fill, never zero-fill
            Some(last_valid_k.unwrap_or(50.0))
        };

        percent_k.push(value);
    }

    let mut percent_d: Vec<Option<f64>> = Vec::with_capacity(bars.len());

    for i in 0..bars.len() {
        if d_period == 0 || i + 1 < d_period {
            percent_d.push(None);
            continue;
        }
        let window = &percent_k[i + 1 - d_period..=i];
        if window.iter().all(|k| k.is_some()) {
            let sum: f64 = window.iter().map(|k| k.unwrap_or(0.0)).sum();
            percent_d.push(Some(sum / d_period as f64));
        } else {
            percent_d.push(None);
        }
    }

    (percent_k, percent_d)
}

/// True Range series
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(bars.len());

    for i in 0..bars.len() {
        let value = if i == 0 {
            bars[i].high - bars[i].low
        } else {
            let hl = bars[i].high - bars[i].low;
            let hc = (bars[i].high - bars[i - 1].close).abs();
            let lc = (bars[i].low - bars[i - 1].close).abs();
            hl.max(hc).max(lc)
        };
        tr.push(value);
    }

    tr
}

/// Average True Range: Wilder-smoothed EWMA of the true range
pub fn atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    wilder_ema(&true_range(bars), period)
}

/// Classify the slope of an MA series by comparing the latest value with the
/// value `lookback` entries earlier.
pub fn trend_slope(ma: &[Option<f64>], lookback: usize) -> TrendSlope {
    if ma.len() < lookback + 1 {
        return TrendSlope::Unknown;
    }
    let end = match ma[ma.len() - 1] {
        Some(v) => v,
        None => return TrendSlope::Unknown,
    };
    let start = match ma[ma.len() - 1 - lookback] {
        Some(v) => v,
        None => return TrendSlope::Unknown,
    };

    if end > start {
        TrendSlope::Up
    } else if end < start {
        TrendSlope::Down
    } else {
        TrendSlope::Flat
    }
}

/// Per-bar indicator values. `None` means the lookback is not yet satisfied.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSnapshot {
    pub rsi: Option<f64>,
    pub stoch_k: Option<f64>,
    pub stoch_d: Option<f64>,
    pub atr: Option<f64>,
    pub trend_ma: Option<f64>,
    pub trend_slope: TrendSlope,
}

impl IndicatorSnapshot {
    /// All oscillator inputs the entry patterns need are available
    pub fn entry_inputs_available(&self) -> bool {
        self.rsi.is_some() && self.stoch_k.is_some() && self.stoch_d.is_some()
    }
}

/// Compute snapshots for the latest and the previous bar. Each snapshot is
/// derived only from bars up to and including its own bar; the slow-timeframe
/// trend values are attached as-is (they update on their own schedule).
pub fn compute_snapshot_pair(
    bars: &[Bar],
    config: &Config,
    trend_ma: Option<f64>,
    slope: TrendSlope,
) -> Option<(IndicatorSnapshot, IndicatorSnapshot)> {
    if bars.len() < 2 {
        return None;
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let rsi_series = rsi(&closes, config.rsi_period);
    let (k_series, d_series) = stochastic(bars, config.k_period, config.d_period);
    let atr_series = atr(bars, config.atr_period);

    let at = |i: usize| IndicatorSnapshot {
        rsi: rsi_series.get(i).copied().flatten(),
        stoch_k: k_series.get(i).copied().flatten(),
        stoch_d: d_series.get(i).copied().flatten(),
        atr: atr_series.get(i).copied().flatten(),
        trend_ma,
        trend_slope: slope,
    };

    let last = bars.len() - 1;
    Some((at(last), at(last - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                start: start + Duration::seconds(5 * i as i64),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_sma() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);
        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        assert_eq!(result[4], Some(4.0));
    }

    #[test]
    fn test_wilder_ema_masks_warmup() {
        let values = vec![10.0, 11.0, 12.0, 13.0];
        let result = wilder_ema(&values, 3);
        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert!(result[2].is_some());
        // alpha = 1/3: 10 -> 10.333.. -> 10.888..
        assert_relative_eq!(result[2].unwrap(), 10.888888888888888, epsilon = 1e-9);
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let result = rsi(&closes, 14);
        let last = result.last().copied().flatten().unwrap();
        assert_relative_eq!(last, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rsi_bounds_and_warmup() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + ((i * 7) % 5) as f64 - 2.0)
            .collect();
        let result = rsi(&closes, 14);
        for value in result.iter().take(14) {
            assert_eq!(*value, None);
        }
        for value in result.iter().flatten() {
            assert!(*value >= 0.0 && *value <= 100.0);
        }
    }

    #[test]
    fn test_stochastic_zero_range_forward_fills() {
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.1).collect();
        closes.extend(std::iter::repeat(102.0).take(20));
        let mut bars = bars_from_closes(&closes);
        // Flatten the tail completely so the %K window range collapses
        for bar in bars.iter_mut().skip(20) {
            bar.high = 102.0;
            bar.low = 102.0;
            bar.open = 102.0;
        }
        let (k, _) = stochastic(&bars, 14, 3);
        let last = k.last().copied().flatten().unwrap();
        let prior = k[32].unwrap();
        // Carried forward from the last non-degenerate window
        assert_relative_eq!(last, prior, epsilon = 1e-9);
    }

    #[test]
    fn test_stochastic_flat_from_start_defaults_to_50() {
        let bars: Vec<Bar> = bars_from_closes(&vec![100.0; 20])
            .into_iter()
            .map(|mut b| {
                b.high = 100.0;
                b.low = 100.0;
                b
            })
            .collect();
        let (k, d) = stochastic(&bars, 14, 3);
        assert_eq!(k.last().copied().flatten(), Some(50.0));
        assert_eq!(d.last().copied().flatten(), Some(50.0));
    }

    #[test]
    fn test_stochastic_bounds() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let bars = bars_from_closes(&closes);
        let (k, d) = stochastic(&bars, 14, 3);
        for value in k.iter().chain(d.iter()).flatten() {
            assert!(*value >= 0.0 && *value <= 100.0);
        }
    }

    #[test]
    fn test_atr_non_negative() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.3).cos()).collect();
        let bars = bars_from_closes(&closes);
        for value in atr(&bars, 14).iter().flatten() {
            assert!(*value >= 0.0);
        }
    }

    #[test]
    fn test_trend_slope_classification() {
        let rising: Vec<Option<f64>> = vec![Some(1.0), Some(1.1), Some(1.2)];
        assert_eq!(trend_slope(&rising, 2), TrendSlope::Up);

        let falling: Vec<Option<f64>> = vec![Some(1.2), Some(1.1), Some(1.0)];
        assert_eq!(trend_slope(&falling, 2), TrendSlope::Down);

        let flat: Vec<Option<f64>> = vec![Some(1.0), Some(1.3), Some(1.0)];
        assert_eq!(trend_slope(&flat, 2), TrendSlope::Flat);

        let short: Vec<Option<f64>> = vec![Some(1.0)];
        assert_eq!(trend_slope(&short, 2), TrendSlope::Unknown);

        let gappy: Vec<Option<f64>> = vec![None, Some(1.1), Some(1.2)];
        assert_eq!(trend_slope(&gappy, 2), TrendSlope::Unknown);
    }

    #[test]
    fn test_snapshot_pair_causality() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.05).collect();
        let bars = bars_from_closes(&closes);
        let config = Config::default();
        let (current, previous) =
            compute_snapshot_pair(&bars, &config, Some(99.0), TrendSlope::Up).unwrap();
        assert!(current.entry_inputs_available());
        assert!(previous.entry_inputs_available());

        // The previous snapshot must equal a fresh computation over the
        // truncated series (no dependence on the final bar).
        let truncated = &bars[..bars.len() - 1];
        let (recomputed, _) =
            compute_snapshot_pair(truncated, &config, Some(99.0), TrendSlope::Up).unwrap();
        assert_relative_eq!(
            previous.rsi.unwrap(),
            recomputed.rsi.unwrap(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            previous.stoch_k.unwrap(),
            recomputed.stoch_k.unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_unavailable_under_lookback() {
        let closes: Vec<f64> = (0..5).map(|i| 100.0 + i as f64).collect();
        let bars = bars_from_closes(&closes);
        let config = Config::default();
        let (current, _) =
            compute_snapshot_pair(&bars, &config, None, TrendSlope::Unknown).unwrap();
        assert!(current.rsi.is_none());
        assert!(current.stoch_k.is_none());
        assert!(!current.entry_inputs_available());
    }
}
