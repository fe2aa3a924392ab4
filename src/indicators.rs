//! Indicator engine: EMA, RSI and ATR over a candle sequence.
//!
//! Values are written into a fresh [`EnrichedCandle`] next to each untouched
//! [`Candle`]. Every value depends only on the bars up to and including its
//! own index, so enriching a prefix gives the same numbers as enriching the
//! whole series and truncating.

use serde::{Deserialize, Serialize};

use crate::{Candle, OHLCV};

pub const EMA_PERIODS: [usize; 5] = [7, 20, 50, 100, 200];
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;

/// Indicator readings at one bar. `None` until enough history exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValues {
    pub ema7: Option<f64>,
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub ema100: Option<f64>,
    pub ema200: Option<f64>,
    pub rsi14: Option<f64>,
    pub atr14: Option<f64>,
}

impl IndicatorValues {
    /// EMAs shortest period first, skipping the unset ones
    pub fn emas(&self) -> Vec<f64> {
        [self.ema7, self.ema20, self.ema50, self.ema100, self.ema200]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// A candle paired with the indicators computed at its index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnrichedCandle {
    pub candle: Candle,
    pub indicators: IndicatorValues,
}

impl OHLCV for EnrichedCandle {
    #[inline]
    fn open(&self) -> f64 {
        self.candle.open
    }

    #[inline]
    fn high(&self) -> f64 {
        self.candle.high
    }

    #[inline]
    fn low(&self) -> f64 {
        self.candle.low
    }

    #[inline]
    fn close(&self) -> f64 {
        self.candle.close
    }

    #[inline]
    fn volume(&self) -> f64 {
        self.candle.volume as f64
    }
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(prev);
    for i in period..values.len() {
        prev = (values[i] - prev) * k + prev;
        out[i] = Some(prev);
    }
    out
}

/// Relative strength index with Wilder smoothing.
///
/// The first value lands at index `period`, seeded from the first `period`
/// close-to-close changes.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }
    let p = period as f64;
    let (mut avg_gain, mut avg_loss) = (0.0, 0.0);
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= p;
    avg_loss /= p;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in period + 1..closes.len() {
        let delta = closes[i] - closes[i - 1];
        avg_gain = (avg_gain * (p - 1.0) + delta.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-delta).max(0.0)) / p;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

#[inline]
fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// True range per bar. The first bar has no previous close and uses `high - low`.
pub fn true_range<T: OHLCV>(bars: &[T]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let hl = bar.high() - bar.low();
            if i == 0 {
                return hl;
            }
            let prev_close = bars[i - 1].close();
            hl.max((bar.high() - prev_close).abs())
                .max((bar.low() - prev_close).abs())
        })
        .collect()
}

/// Average true range seeded with the mean of the first `period` true ranges
/// (value at index `period - 1`), then Wilder-smoothed.
pub fn atr<T: OHLCV>(bars: &[T], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }
    let tr = true_range(bars);
    let p = period as f64;
    let mut prev = tr[..period].iter().sum::<f64>() / p;
    out[period - 1] = Some(prev);
    for i in period..bars.len() {
        prev = (prev * (p - 1.0) + tr[i]) / p;
        out[i] = Some(prev);
    }
    out
}

/// Enrich every candle with the standard indicator set.
pub fn compute(candles: &[Candle]) -> Vec<EnrichedCandle> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let [e7, e20, e50, e100, e200] = EMA_PERIODS.map(|p| ema(&closes, p));
    let rsi14 = rsi(&closes, RSI_PERIOD);
    let atr14 = atr(candles, ATR_PERIOD);

    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| EnrichedCandle {
            candle: *candle,
            indicators: IndicatorValues {
                ema7: e7[i],
                ema20: e20[i],
                ema50: e50[i],
                ema100: e100[i],
                ema200: e200[i],
                rsi14: rsi14[i],
                atr14: atr14[i],
            },
        })
        .collect()
}
