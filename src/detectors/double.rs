//! Double tops and double bottoms from pivot extrema.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::helpers::{
    avg_volume, build_signal, highest_high, lowest_low, pivot_highs, pivot_lows,
    MIN_DETECTION_BARS,
};
use crate::{
    params::{check_params, get_multiple, get_period, get_ratio, ParamMeta, ParameterizedDetector},
    Direction, EnrichedCandle, PatternDetector, PatternError, PatternKind, PatternSignal, Period,
    Ratio, Result, Timeframe, TradeLevels, OHLCV,
};

/// Measurements taken from a double top or bottom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleStats {
    pub first_extreme: f64,
    pub second_extreme: f64,
    /// Trough between two tops, or peak between two bottoms
    pub middle_extreme: f64,
    /// Indices into the signal window
    pub first_index: usize,
    pub second_index: usize,
    pub depth_pct: f64,
    /// Close beyond the second extreme, percent
    pub continuation_pct: f64,
    /// Average volume since the second extreme over the window average
    pub volume_ratio: f64,
}

impl DoubleStats {
    /// Relative gap between the two extremes, percent
    pub fn extreme_diff_pct(&self) -> f64 {
        let outer = self.first_extreme.max(self.second_extreme);
        (self.first_extreme - self.second_extreme).abs() / outer * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubleConfig {
    pub lookback: Period,
    pub pivot_span: Period,
    pub max_extreme_diff: Ratio,
    pub min_separation: Period,
    pub min_depth: Ratio,
    pub min_continuation: Ratio,
    pub level_buffer: Ratio,
    pub min_risk_reward: f64,
}

impl Default for DoubleConfig {
    fn default() -> Self {
        Self {
            lookback: Period::new_const(40),
            pivot_span: Period::new_const(2),
            max_extreme_diff: Ratio::new_const(0.02),
            min_separation: Period::new_const(5),
            min_depth: Ratio::new_const(0.03),
            min_continuation: Ratio::new_const(0.01),
            level_buffer: Ratio::new_const(0.01),
            min_risk_reward: 2.0,
        }
    }
}

static DOUBLE_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("lookback", 40.0, (20.0, 120.0, 10.0), "Candles searched for pivots"),
    ParamMeta::period("pivot_span", 2.0, (1.0, 5.0, 1.0), "Bars each side of a pivot"),
    ParamMeta::ratio("max_extreme_diff", 0.02, (0.005, 0.05, 0.005), "Extremes match within"),
    ParamMeta::period("min_separation", 5.0, (3.0, 20.0, 1.0), "Bars between extremes"),
    ParamMeta::ratio("min_depth", 0.03, (0.01, 0.10, 0.01), "Middle extreme distance"),
    ParamMeta::ratio("min_continuation", 0.01, (0.0, 0.05, 0.005), "Close past second extreme"),
    ParamMeta::ratio("level_buffer", 0.01, (0.0, 0.05, 0.005), "Stop offset"),
    ParamMeta::multiple("min_risk_reward", 2.0, (1.0, 5.0, 0.5), "Risk-reward floor"),
];

impl ParameterizedDetector for DoubleConfig {
    fn param_meta() -> &'static [ParamMeta] {
        DOUBLE_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        check_params(params, DOUBLE_PARAMS)?;
        Ok(Self {
            lookback: get_period(params, "lookback", 40)?,
            pivot_span: get_period(params, "pivot_span", 2)?,
            max_extreme_diff: get_ratio(params, "max_extreme_diff", 0.02)?,
            min_separation: get_period(params, "min_separation", 5)?,
            min_depth: get_ratio(params, "min_depth", 0.03)?,
            min_continuation: get_ratio(params, "min_continuation", 0.01)?,
            level_buffer: get_ratio(params, "level_buffer", 0.01)?,
            min_risk_reward: get_multiple(params, "min_risk_reward", 2.0)?,
        })
    }

    fn detector_key() -> &'static str {
        "double_extreme"
    }
}

/// Double tops when `direction` is bearish, double bottoms when bullish
#[derive(Debug, Clone)]
pub struct DoubleExtremeDetector {
    pub direction: Direction,
    pub config: DoubleConfig,
}

impl DoubleExtremeDetector {
    pub fn top() -> Self {
        Self {
            direction: Direction::Bearish,
            config: DoubleConfig::default(),
        }
    }

    pub fn bottom() -> Self {
        Self {
            direction: Direction::Bullish,
            config: DoubleConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DoubleConfig) -> Self {
        self.config = config;
        self
    }

    /// Most recent qualifying pair of extrema in `window`
    fn find(&self, window: &[EnrichedCandle]) -> Option<(DoubleStats, TradeLevels)> {
        let cfg = &self.config;
        let is_top = self.direction.is_bearish();
        let price = |c: &EnrichedCandle| if is_top { c.high() } else { c.low() };
        let pivots = if is_top {
            pivot_highs(window, cfg.pivot_span.get())
        } else {
            pivot_lows(window, cfg.pivot_span.get())
        };
        let close = window.last()?.close();

        for (j, &second) in pivots.iter().enumerate().rev() {
            for &first in pivots[..j].iter().rev() {
                if second - first < cfg.min_separation.get() {
                    continue;
                }
                let (p1, p2) = (price(&window[first]), price(&window[second]));
                let outer = if is_top { p1.max(p2) } else { p1.min(p2) };
                if (p1 - p2).abs() / p1.max(p2) > cfg.max_extreme_diff.get() {
                    continue;
                }

                let between = &window[first + 1..second];
                let middle = if is_top {
                    lowest_low(between)
                } else {
                    highest_high(between)
                };
                let inner = if is_top { p1.min(p2) } else { p1.max(p2) };
                let depth = (inner - middle).abs() / inner;
                if depth < cfg.min_depth.get() {
                    continue;
                }

                // Nothing after the second extreme may exceed the pattern
                let after = &window[second + 1..];
                let invalidated = if is_top {
                    !after.is_empty() && highest_high(after) > outer
                } else {
                    !after.is_empty() && lowest_low(after) < outer
                };
                if invalidated {
                    continue;
                }

                let continuation = if is_top {
                    (p2 - close) / p2
                } else {
                    (close - p2) / p2
                };
                if continuation < cfg.min_continuation.get() {
                    continue;
                }

                let height = (outer - middle).abs();
                let buffer = cfg.level_buffer.get();
                let levels = if is_top {
                    TradeLevels {
                        entry: close,
                        target: close - height,
                        stop: outer * (1.0 + buffer),
                    }
                } else {
                    TradeLevels {
                        entry: close,
                        target: close + height,
                        stop: outer * (1.0 - buffer),
                    }
                };

                let window_volume = avg_volume(window);
                let volume_ratio = if window_volume > 0.0 {
                    avg_volume(&window[second..]) / window_volume
                } else {
                    0.0
                };

                let stats = DoubleStats {
                    first_extreme: p1,
                    second_extreme: p2,
                    middle_extreme: middle,
                    first_index: first,
                    second_index: second,
                    depth_pct: depth * 100.0,
                    continuation_pct: continuation * 100.0,
                    volume_ratio,
                };
                return Some((stats, levels));
            }
        }
        None
    }
}

impl PatternDetector for DoubleExtremeDetector {
    fn name(&self) -> &'static str {
        match self.direction {
            Direction::Bearish => "double_top",
            Direction::Bullish => "double_bottom",
        }
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
        let lookback = self.config.lookback.get().min(candles.len());
        let window = &candles[candles.len() - lookback..];
        let Some((stats, levels)) = self.find(window) else {
            return Vec::new();
        };
        let pattern = match self.direction {
            Direction::Bearish => PatternKind::DoubleTop(stats),
            Direction::Bullish => PatternKind::DoubleBottom(stats),
        };

        build_signal(
            symbol,
            timeframe,
            pattern,
            self.direction,
            levels,
            window,
            self.config.min_risk_reward,
        )
        .into_iter()
        .collect()
    }

    fn validate_config(&self) -> Result<()> {
        let cfg = &self.config;
        if cfg.lookback.get() < MIN_DETECTION_BARS {
            return Err(PatternError::InvalidConfig(format!(
                "double extreme lookback must cover at least {MIN_DETECTION_BARS} candles"
            )));
        }
        if cfg.min_separation.get() <= cfg.pivot_span.get() {
            return Err(PatternError::InvalidConfig(
                "min_separation must exceed pivot_span".into(),
            ));
        }
        Ok(())
    }
}
