//! Channel breakouts.
//!
//! The trailing window before the current bar is classified as a horizontal,
//! ascending or descending channel from the regression slope of its highs and
//! lows. The current bar breaks out when it closes beyond a boundary by more
//! than the breakout buffer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::helpers::{
    avg_volume, build_signal, linear_regression, mean, most_touched_level, MIN_DETECTION_BARS,
};
use crate::{
    params::{check_params, get_multiple, get_period, get_ratio, ParamMeta, ParameterizedDetector},
    ChannelType, Direction, EnrichedCandle, PatternDetector, PatternError, PatternKind,
    PatternSignal, Period, Ratio, Result, Timeframe, TradeLevels, OHLCV,
};

/// Measurements taken from a channel breakout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub breakout_type: ChannelType,
    pub upper: f64,
    pub lower: f64,
    /// Average boundary slope per bar, percent of mean close
    pub slope_pct: f64,
    pub upper_touches: usize,
    pub lower_touches: usize,
    /// Close beyond the broken boundary, percent
    pub breakout_pct: f64,
    /// Breakout bar volume over the channel's average volume
    pub volume_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub window: Period,
    pub touch_tolerance: Ratio,
    /// |slope| below this (percent per bar) is horizontal
    pub horizontal_slope_pct: f64,
    /// |slope| above this (percent per bar) is a sloped channel
    pub sloped_slope_pct: f64,
    pub breakout_buffer: Ratio,
    /// Stop distance inside the broken boundary, fraction of channel height
    pub stop_fraction: Ratio,
    pub min_risk_reward: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            window: Period::new_const(20),
            touch_tolerance: Ratio::new_const(0.005),
            horizontal_slope_pct: 0.05,
            sloped_slope_pct: 0.1,
            breakout_buffer: Ratio::new_const(0.01),
            stop_fraction: Ratio::new_const(0.1),
            min_risk_reward: 2.0,
        }
    }
}

static CHANNEL_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("window", 20.0, (15.0, 60.0, 5.0), "Candles forming the channel"),
    ParamMeta::ratio("touch_tolerance", 0.005, (0.001, 0.02, 0.001), "Boundary touch tolerance"),
    ParamMeta::multiple(
        "horizontal_slope_pct",
        0.05,
        (0.01, 0.1, 0.01),
        "Slope below which a channel is horizontal",
    ),
    ParamMeta::multiple(
        "sloped_slope_pct",
        0.1,
        (0.05, 0.5, 0.05),
        "Slope above which a channel is ascending or descending",
    ),
    ParamMeta::ratio("breakout_buffer", 0.01, (0.0, 0.05, 0.005), "Close beyond boundary"),
    ParamMeta::ratio("stop_fraction", 0.1, (0.0, 0.5, 0.05), "Stop inside boundary"),
    ParamMeta::multiple("min_risk_reward", 2.0, (1.0, 5.0, 0.5), "Risk-reward floor"),
];

impl ParameterizedDetector for ChannelConfig {
    fn param_meta() -> &'static [ParamMeta] {
        CHANNEL_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        check_params(params, CHANNEL_PARAMS)?;
        Ok(Self {
            window: get_period(params, "window", 20)?,
            touch_tolerance: get_ratio(params, "touch_tolerance", 0.005)?,
            horizontal_slope_pct: get_multiple(params, "horizontal_slope_pct", 0.05)?,
            sloped_slope_pct: get_multiple(params, "sloped_slope_pct", 0.1)?,
            breakout_buffer: get_ratio(params, "breakout_buffer", 0.01)?,
            stop_fraction: get_ratio(params, "stop_fraction", 0.1)?,
            min_risk_reward: get_multiple(params, "min_risk_reward", 2.0)?,
        })
    }

    fn detector_key() -> &'static str {
        "channel_breakout"
    }
}

#[derive(Debug, Clone, Copy)]
struct Boundaries {
    upper: f64,
    lower: f64,
    upper_touches: usize,
    lower_touches: usize,
}

/// Breakouts from horizontal, ascending and descending channels, either way
#[derive(Debug, Clone, Default)]
pub struct ChannelBreakoutDetector {
    pub config: ChannelConfig,
}

impl ChannelBreakoutDetector {
    pub fn with_config(config: ChannelConfig) -> Self {
        Self { config }
    }

    fn classify(&self, slope_pct: f64) -> Option<ChannelType> {
        let cfg = &self.config;
        if slope_pct.abs() < cfg.horizontal_slope_pct {
            Some(ChannelType::Horizontal)
        } else if slope_pct > cfg.sloped_slope_pct {
            Some(ChannelType::Ascending)
        } else if slope_pct < -cfg.sloped_slope_pct {
            Some(ChannelType::Descending)
        } else {
            None
        }
    }

    fn boundaries(&self, kind: ChannelType, highs: &[f64], lows: &[f64]) -> Option<Boundaries> {
        let tolerance = self.config.touch_tolerance.get();
        match kind {
            ChannelType::Horizontal => {
                let (upper, upper_touches) = most_touched_level(highs, tolerance)?;
                let (lower, lower_touches) = most_touched_level(lows, tolerance)?;
                Some(Boundaries {
                    upper,
                    lower,
                    upper_touches,
                    lower_touches,
                })
            },
            ChannelType::Ascending | ChannelType::Descending => {
                let (upper, upper_touches) = envelope(highs, tolerance, f64::max);
                let (lower, lower_touches) = envelope(lows, tolerance, f64::min);
                Some(Boundaries {
                    upper,
                    lower,
                    upper_touches,
                    lower_touches,
                })
            },
        }
    }
}

/// Regression line shifted to the outermost residual, projected one bar
/// past the window. Returns the projection and how many values sit on the
/// shifted line.
fn envelope(values: &[f64], tolerance: f64, outer: fn(f64, f64) -> f64) -> (f64, usize) {
    let (slope, intercept) = linear_regression(values);
    let fitted = |i: usize| slope * i as f64 + intercept;
    let offset = values
        .iter()
        .enumerate()
        .map(|(i, v)| v - fitted(i))
        .reduce(outer)
        .unwrap_or(0.0);
    let touches = values
        .iter()
        .enumerate()
        .filter(|(i, v)| {
            let line = fitted(*i) + offset;
            (*v - line).abs() <= line.abs() * tolerance
        })
        .count();
    (fitted(values.len()) + offset, touches)
}

impl PatternDetector for ChannelBreakoutDetector {
    fn name(&self) -> &'static str {
        "channel_breakout"
    }

    fn min_bars(&self) -> usize {
        (self.config.window.get() + 1).max(MIN_DETECTION_BARS)
    }

    fn detect(
        &self,
        symbol: &str,
        candles: &[EnrichedCandle],
        timeframe: Timeframe,
    ) -> Vec<PatternSignal> {
        if candles.len() < self.min_bars() {
            return Vec::new();
        }
        let cfg = &self.config;
        let full = &candles[candles.len() - cfg.window.get() - 1..];
        let Some((current, channel)) = full.split_last() else {
            return Vec::new();
        };

        let highs: Vec<f64> = channel.iter().map(OHLCV::high).collect();
        let lows: Vec<f64> = channel.iter().map(OHLCV::low).collect();
        let closes: Vec<f64> = channel.iter().map(OHLCV::close).collect();
        let mean_close = mean(&closes);
        if mean_close <= 0.0 {
            return Vec::new();
        }
        let (high_slope, _) = linear_regression(&highs);
        let (low_slope, _) = linear_regression(&lows);
        let slope_pct = (high_slope + low_slope) / 2.0 / mean_close * 100.0;

        let Some(breakout_type) = self.classify(slope_pct) else {
            return Vec::new();
        };
        let Some(b) = self.boundaries(breakout_type, &highs, &lows) else {
            return Vec::new();
        };
        let height = b.upper - b.lower;
        if !height.is_finite() || height <= 0.0 {
            return Vec::new();
        }

        let close = current.close();
        let buffer = cfg.breakout_buffer.get();
        let stop_offset = cfg.stop_fraction.get() * height;
        let (direction, levels, breakout_pct) = if close > b.upper * (1.0 + buffer) {
            (
                Direction::Bullish,
                TradeLevels {
                    entry: close,
                    target: close + height,
                    stop: b.upper - stop_offset,
                },
                (close / b.upper - 1.0) * 100.0,
            )
        } else if close < b.lower * (1.0 - buffer) {
            (
                Direction::Bearish,
                TradeLevels {
                    entry: close,
                    target: close - height,
                    stop: b.lower + stop_offset,
                },
                (1.0 - close / b.lower) * 100.0,
            )
        } else {
            return Vec::new();
        };

        let channel_volume = avg_volume(channel);
        let volume_ratio = if channel_volume > 0.0 {
            current.volume() / channel_volume
        } else {
            0.0
        };

        let stats = ChannelStats {
            breakout_type,
            upper: b.upper,
            lower: b.lower,
            slope_pct,
            upper_touches: b.upper_touches,
            lower_touches: b.lower_touches,
            breakout_pct,
            volume_ratio,
        };

        build_signal(
            symbol,
            timeframe,
            PatternKind::ChannelBreakout(stats),
            direction,
            levels,
            full,
            cfg.min_risk_reward,
        )
        .into_iter()
        .collect()
    }

    fn validate_config(&self) -> Result<()> {
        let cfg = &self.config;
        if cfg.horizontal_slope_pct > cfg.sloped_slope_pct {
            return Err(PatternError::InvalidConfig(
                "horizontal_slope_pct must not exceed sloped_slope_pct".into(),
            ));
        }
        if cfg.window.get() < 2 {
            return Err(PatternError::InvalidConfig(
                "channel window needs at least 2 candles".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{indicators, Candle};
    use chrono::{Duration, TimeZone, Utc};

    /// Flat channel between ~100 and ~105 followed by a breakout bar
    fn channel_candles(breakout_close: f64, breakout_volume: u64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut out: Vec<Candle> = (0..20)
            .map(|i| {
                let at = start + Duration::hours(i);
                if i % 2 == 0 {
                    Candle::new(at, 101.0, 105.0, 100.0, 104.0, 1_000)
                } else {
                    Candle::new(at, 104.0, 104.9, 100.1, 101.0, 1_000)
                }
            })
            .collect();
        out.push(Candle::new(
            start + Duration::hours(20),
            104.0,
            breakout_close.max(104.0) + 0.3,
            breakout_close.min(104.0) - 0.1,
            breakout_close,
            breakout_volume,
        ));
        out
    }

    #[test]
    fn test_horizontal_breakout() {
        let close = 104.95 * 1.015;
        let enriched = indicators::compute(&channel_candles(close, 1_600));
        let signals = ChannelBreakoutDetector::default().detect("SPY", &enriched, Timeframe::H1);
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.direction, Direction::Bullish);
        let PatternKind::ChannelBreakout(stats) = &signal.pattern else {
            panic!("unexpected pattern {:?}", signal.pattern);
        };
        assert_eq!(stats.breakout_type, ChannelType::Horizontal);
        assert!((stats.upper - 104.95).abs() < 1e-9);
        assert!((stats.lower - 100.05).abs() < 1e-9);
        assert!((stats.volume_ratio - 1.6).abs() < 1e-9);
        assert!((signal.target_price - (close + 4.9)).abs() < 1e-9);
        assert!((signal.stop_loss - (104.95 - 0.49)).abs() < 1e-9);
        assert_eq!(signal.window.len(), 21);
    }

    #[test]
    fn test_close_inside_channel() {
        let enriched = indicators::compute(&channel_candles(104.5, 1_600));
        assert!(ChannelBreakoutDetector::default()
            .detect("SPY", &enriched, Timeframe::H1)
            .is_empty());
    }

    #[test]
    fn test_needs_window_plus_current_bar() {
        let candles = channel_candles(106.5, 1_600);
        let enriched = indicators::compute(&candles[1..]);
        assert!(ChannelBreakoutDetector::default()
            .detect("SPY", &enriched, Timeframe::H1)
            .is_empty());
    }

    #[test]
    fn test_rising_channel_is_ascending() {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut candles: Vec<Candle> = (0..20)
            .map(|i| {
                let base = 100.0 + 0.5 * i as f64;
                let (open, close) = if i % 2 == 0 {
                    (base + 1.0, base + 4.0)
                } else {
                    (base + 4.0, base + 1.0)
                };
                Candle::new(start + Duration::hours(i), open, base + 5.0, base, close, 1_000)
            })
            .collect();
        // Projected upper at x = 20 is 115; break it by 2%
        let close = 115.0 * 1.02;
        candles.push(Candle::new(
            start + Duration::hours(20),
            114.0,
            close + 0.2,
            113.5,
            close,
            2_000,
        ));

        let enriched = indicators::compute(&candles);
        let signals = ChannelBreakoutDetector::default().detect("SPY", &enriched, Timeframe::H1);
        // Height 5 against a stop 0.5 under 115 gives rr = 5 / 2.8
        assert!(signals.is_empty());

        let loose = ChannelBreakoutDetector::with_config(ChannelConfig {
            min_risk_reward: 1.5,
            ..ChannelConfig::default()
        });
        let signals = loose.detect("SPY", &enriched, Timeframe::H1);
        assert_eq!(signals.len(), 1);
        let PatternKind::ChannelBreakout(stats) = &signals[0].pattern else {
            panic!("unexpected pattern");
        };
        assert_eq!(stats.breakout_type, ChannelType::Ascending);
        assert!((stats.upper - 115.0).abs() < 1e-6);
        assert_eq!(stats.upper_touches, 20);
    }

    #[test]
    fn test_falling_channel_breaks_down() {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut candles: Vec<Candle> = (0..20)
            .map(|i| {
                let base = 120.0 - 0.5 * i as f64;
                let (open, close) = if i % 2 == 0 {
                    (base + 4.0, base + 1.0)
                } else {
                    (base + 1.0, base + 4.0)
                };
                Candle::new(start + Duration::hours(i), open, base + 5.0, base, close, 1_000)
            })
            .collect();
        // Projected lower at x = 20 is 110; break it by 2%
        let close = 110.0 * 0.98;
        candles.push(Candle::new(
            start + Duration::hours(20),
            108.5,
            109.0,
            close - 0.2,
            close,
            2_000,
        ));

        let enriched = indicators::compute(&candles);
        let loose = ChannelBreakoutDetector::with_config(ChannelConfig {
            min_risk_reward: 1.5,
            ..ChannelConfig::default()
        });
        let signals = loose.detect("SPY", &enriched, Timeframe::H1);
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.direction, Direction::Bearish);
        let PatternKind::ChannelBreakout(stats) = &signal.pattern else {
            panic!("unexpected pattern");
        };
        assert_eq!(stats.breakout_type, ChannelType::Descending);
        assert!((stats.lower - 110.0).abs() < 1e-6);
        assert!((stats.upper - 115.0).abs() < 1e-6);
        assert!((signal.entry_price - close).abs() < 1e-9);
        assert!((signal.target_price - (close - 5.0)).abs() < 1e-6);
        assert!((signal.stop_loss - 110.5).abs() < 1e-6);
    }
}
