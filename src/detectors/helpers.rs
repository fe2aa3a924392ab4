//! Shared geometry helpers for chart-pattern detection
//!
//! Volume averages, extremes, least-squares fits, touch counting and pivot
//! extraction used by every detector module.

use tracing::{debug, warn};

use crate::{
    indicators::EnrichedCandle, Direction, PatternKind, PatternSignal, Timeframe, TradeLevels,
    OHLCV,
};

// ============================================================
// THRESHOLDS
// ============================================================

/// Fewest candles any builtin detector looks at
pub const MIN_DETECTION_BARS: usize = 20;
/// Bars averaged at each end of a run when comparing volume
pub const VOLUME_EDGE_BARS: usize = 3;
/// Price tolerance for counting a bar as touching a level
pub const TOUCH_TOLERANCE: f64 = 0.005;

// ============================================================
// AVERAGES AND EXTREMES
// ============================================================

#[inline]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[inline]
pub fn avg_volume<T: OHLCV>(bars: &[T]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    bars.iter().map(OHLCV::volume).sum::<f64>() / bars.len() as f64
}

/// Average volume of the last `n` bars over the first `n` bars.
///
/// Returns 0.0 when the leading bars carry no volume.
pub fn edge_volume_ratio<T: OHLCV>(bars: &[T], n: usize) -> f64 {
    let n = n.min(bars.len());
    if n == 0 {
        return 0.0;
    }
    let first = avg_volume(&bars[..n]);
    let last = avg_volume(&bars[bars.len() - n..]);
    if first <= 0.0 {
        return 0.0;
    }
    last / first
}

#[inline]
pub fn highest_high<T: OHLCV>(bars: &[T]) -> f64 {
    bars.iter().map(OHLCV::high).fold(f64::NEG_INFINITY, f64::max)
}

#[inline]
pub fn lowest_low<T: OHLCV>(bars: &[T]) -> f64 {
    bars.iter().map(OHLCV::low).fold(f64::INFINITY, f64::min)
}

/// Fractional change from `from` to `to`
#[inline]
pub fn pct_change(from: f64, to: f64) -> f64 {
    if from == 0.0 {
        return 0.0;
    }
    (to - from) / from
}

/// Split `len` into `parts` contiguous ranges. The last range absorbs any remainder.
pub fn segments(len: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    if parts == 0 || len < parts {
        return Vec::new();
    }
    let size = len / parts;
    (0..parts)
        .map(|i| {
            let end = if i + 1 == parts { len } else { (i + 1) * size };
            i * size..end
        })
        .collect()
}

// ============================================================
// FITS AND LEVELS
// ============================================================

/// Least-squares fit of `values` against their index: `(slope, intercept)`.
pub fn linear_regression(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n < 2 {
        return (0.0, values.first().copied().unwrap_or(0.0));
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = mean(values);
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    let slope = if den == 0.0 { 0.0 } else { num / den };
    (slope, y_mean - slope * x_mean)
}

/// Number of values within `tolerance` (fraction of `level`) of `level`
pub fn count_touches(values: &[f64], level: f64, tolerance: f64) -> usize {
    let band = level.abs() * tolerance;
    values.iter().filter(|v| (*v - level).abs() <= band).count()
}

/// Level touched by the most values, as the mean of that cluster.
///
/// Ties keep the earliest candidate.
pub fn most_touched_level(values: &[f64], tolerance: f64) -> Option<(f64, usize)> {
    let mut best: Option<(f64, usize)> = None;
    for &candidate in values {
        let band = candidate.abs() * tolerance;
        let cluster: Vec<f64> = values
            .iter()
            .copied()
            .filter(|v| (v - candidate).abs() <= band)
            .collect();
        if best.map_or(true, |(_, touches)| cluster.len() > touches) {
            best = Some((mean(&cluster), cluster.len()));
        }
    }
    best
}

/// Mean of the `n` largest values
pub fn mean_of_top(values: &[f64], n: usize) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    sorted.truncate(n);
    mean(&sorted)
}

/// Mean of the `n` smallest values
pub fn mean_of_bottom(values: &[f64], n: usize) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.truncate(n);
    mean(&sorted)
}

// ============================================================
// PIVOTS
// ============================================================

/// Indices whose high is strictly above the `span` highs on each side
pub fn pivot_highs<T: OHLCV>(bars: &[T], span: usize) -> Vec<usize> {
    pivots(bars, span, |b| b.high(), |center, other| center > other)
}

/// Indices whose low is strictly below the `span` lows on each side
pub fn pivot_lows<T: OHLCV>(bars: &[T], span: usize) -> Vec<usize> {
    pivots(bars, span, |b| b.low(), |center, other| center < other)
}

fn pivots<T, F, C>(bars: &[T], span: usize, price: F, beats: C) -> Vec<usize>
where
    T: OHLCV,
    F: Fn(&T) -> f64,
    C: Fn(f64, f64) -> bool,
{
    if span == 0 || bars.len() < 2 * span + 1 {
        return Vec::new();
    }
    (span..bars.len() - span)
        .filter(|&i| {
            let center = price(&bars[i]);
            (i - span..=i + span)
                .filter(|&j| j != i)
                .all(|j| beats(center, price(&bars[j])))
        })
        .collect()
}

// ============================================================
// SIGNAL CONSTRUCTION
// ============================================================

/// Turn a candidate into an unscored signal.
///
/// Invalid geometry is logged at `warn` and dropped. A valid setup whose
/// risk-reward falls below `min_risk_reward` is dropped at `debug`.
pub fn build_signal(
    symbol: &str,
    timeframe: Timeframe,
    pattern: PatternKind,
    direction: Direction,
    levels: TradeLevels,
    window: &[EnrichedCandle],
    min_risk_reward: f64,
) -> Option<PatternSignal> {
    let pattern_type = pattern.pattern_type();
    match PatternSignal::new(symbol, timeframe, pattern, direction, levels, window) {
        Ok(signal) if signal.risk_reward_ratio >= min_risk_reward => Some(signal),
        Ok(signal) => {
            debug!(
                symbol,
                %timeframe,
                pattern = %pattern_type,
                rr = signal.risk_reward_ratio,
                "discarding candidate below risk-reward floor"
            );
            None
        },
        Err(err) => {
            warn!(symbol, %timeframe, pattern = %pattern_type, %err, "discarding candidate");
            None
        },
    }
}
