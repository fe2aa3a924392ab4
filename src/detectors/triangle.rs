//! Ascending and descending triangles.
//!
//! One boundary is flat and touched repeatedly, the other converges on it
//! segment by segment.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::helpers::{
    avg_volume, build_signal, count_touches, highest_high, lowest_low, mean_of_bottom,
    mean_of_top, segments, MIN_DETECTION_BARS,
};
use crate::{
    params::{check_params, get_multiple, get_period, get_ratio, ParamMeta, ParameterizedDetector},
    Direction, EnrichedCandle, PatternDetector, PatternError, PatternKind, PatternSignal, Period,
    Ratio, Result, Timeframe, TradeLevels, OHLCV,
};

/// Bars averaged to place the flat boundary
const BOUNDARY_SAMPLES: usize = 3;

/// Measurements taken from a triangle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangleStats {
    /// Flat resistance (ascending) or support (descending)
    pub boundary: f64,
    pub touches: usize,
    pub height: f64,
    /// Consecutive segment pairs moving toward the boundary
    pub monotonic_pairs: usize,
    /// Average volume of the last quarter over the first three quarters
    pub volume_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangleConfig {
    pub window: Period,
    pub segments: Period,
    pub touch_tolerance: Ratio,
    pub min_touches: Period,
    pub min_monotonic_pairs: Period,
    pub level_buffer: Ratio,
    pub min_risk_reward: f64,
}

impl Default for TriangleConfig {
    fn default() -> Self {
        Self {
            window: Period::new_const(20),
            segments: Period::new_const(4),
            touch_tolerance: Ratio::new_const(0.005),
            min_touches: Period::new_const(3),
            min_monotonic_pairs: Period::new_const(2),
            level_buffer: Ratio::new_const(0.01),
            min_risk_reward: 2.0,
        }
    }
}

static TRIANGLE_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("window", 20.0, (20.0, 60.0, 5.0), "Candles in the triangle"),
    ParamMeta::period("segments", 4.0, (3.0, 6.0, 1.0), "Segments for the sloping side"),
    ParamMeta::ratio("touch_tolerance", 0.005, (0.001, 0.02, 0.001), "Boundary touch tolerance"),
    ParamMeta::period("min_touches", 3.0, (2.0, 6.0, 1.0), "Minimum boundary touches"),
    ParamMeta::period(
        "min_monotonic_pairs",
        2.0,
        (1.0, 5.0, 1.0),
        "Minimum segment pairs converging on the boundary",
    ),
    ParamMeta::ratio("level_buffer", 0.01, (0.0, 0.05, 0.005), "Entry/stop offset"),
    ParamMeta::multiple("min_risk_reward", 2.0, (1.0, 5.0, 0.5), "Risk-reward floor"),
];

impl ParameterizedDetector for TriangleConfig {
    fn param_meta() -> &'static [ParamMeta] {
        TRIANGLE_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        check_params(params, TRIANGLE_PARAMS)?;
        Ok(Self {
            window: get_period(params, "window", 20)?,
            segments: get_period(params, "segments", 4)?,
            touch_tolerance: get_ratio(params, "touch_tolerance", 0.005)?,
            min_touches: get_period(params, "min_touches", 3)?,
            min_monotonic_pairs: get_period(params, "min_monotonic_pairs", 2)?,
            level_buffer: get_ratio(params, "level_buffer", 0.01)?,
            min_risk_reward: get_multiple(params, "min_risk_reward", 2.0)?,
        })
    }

    fn detector_key() -> &'static str {
        "triangle"
    }
}

/// Ascending triangles when `direction` is bullish, descending when bearish
#[derive(Debug, Clone)]
pub struct TriangleDetector {
    pub direction: Direction,
    pub config: TriangleConfig,
}

impl TriangleDetector {
    pub fn ascending() -> Self {
        Self {
            direction: Direction::Bullish,
            config: TriangleConfig::default(),
        }
    }

    pub fn descending() -> Self {
        Self {
            direction: Direction::Bearish,
            config: TriangleConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TriangleConfig) -> Self {
        self.config = config;
        self
    }
}

impl PatternDetector for TriangleDetector {
    fn name(&self) -> &'static str {
        match self.direction {
            Direction::Bullish => "ascending_triangle",
            Direction::Bearish => "descending_triangle",
        }
    }

    fn min_bars(&self) -> usize {
        self.config.window.get().max(MIN_DETECTION_BARS)
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
        let window = &candles[candles.len() - cfg.window.get()..];
        let parts = segments(window.len(), cfg.segments.get());
        let Some(last_part) = parts.last() else {
            return Vec::new();
        };

        // Flat side
        let flat: Vec<f64> = match self.direction {
            Direction::Bullish => window.iter().map(OHLCV::high).collect(),
            Direction::Bearish => window.iter().map(OHLCV::low).collect(),
        };
        let boundary = match self.direction {
            Direction::Bullish => mean_of_top(&flat, BOUNDARY_SAMPLES),
            Direction::Bearish => mean_of_bottom(&flat, BOUNDARY_SAMPLES),
        };
        let touches = count_touches(&flat, boundary, cfg.touch_tolerance.get());
        if touches < cfg.min_touches.get() {
            return Vec::new();
        }

        // Sloping side: rising segment lows or falling segment highs
        let extremes: Vec<f64> = parts
            .iter()
            .map(|r| match self.direction {
                Direction::Bullish => lowest_low(&window[r.clone()]),
                Direction::Bearish => highest_high(&window[r.clone()]),
            })
            .collect();
        let monotonic_pairs = extremes
            .windows(2)
            .filter(|pair| match self.direction {
                Direction::Bullish => pair[1] > pair[0],
                Direction::Bearish => pair[1] < pair[0],
            })
            .count();
        if monotonic_pairs < cfg.min_monotonic_pairs.get() {
            return Vec::new();
        }

        let last_segment = &window[last_part.clone()];
        let buffer = cfg.level_buffer.get();
        let (height, levels) = match self.direction {
            Direction::Bullish => {
                let height = boundary - lowest_low(window);
                let entry = boundary * (1.0 + buffer);
                (
                    height,
                    TradeLevels {
                        entry,
                        target: entry + height,
                        stop: lowest_low(last_segment) * (1.0 - buffer),
                    },
                )
            },
            Direction::Bearish => {
                let height = highest_high(window) - boundary;
                let entry = boundary * (1.0 - buffer);
                (
                    height,
                    TradeLevels {
                        entry,
                        target: entry - height,
                        stop: highest_high(last_segment) * (1.0 + buffer),
                    },
                )
            },
        };

        let split = window.len() - window.len() / 4;
        let early = avg_volume(&window[..split]);
        let volume_ratio = if early > 0.0 {
            avg_volume(&window[split..]) / early
        } else {
            0.0
        };

        let stats = TriangleStats {
            boundary,
            touches,
            height,
            monotonic_pairs,
            volume_ratio,
        };
        let pattern = match self.direction {
            Direction::Bullish => PatternKind::AscendingTriangle(stats),
            Direction::Bearish => PatternKind::DescendingTriangle(stats),
        };

        build_signal(
            symbol,
            timeframe,
            pattern,
            self.direction,
            levels,
            window,
            cfg.min_risk_reward,
        )
        .into_iter()
        .collect()
    }

    fn validate_config(&self) -> Result<()> {
        let cfg = &self.config;
        if cfg.segments.get() < 2 || cfg.segments.get() > cfg.window.get() {
            return Err(PatternError::InvalidConfig(
                "triangle needs at least 2 segments and no more segments than candles".into(),
            ));
        }
        if cfg.min_monotonic_pairs.get() >= cfg.segments.get() {
            return Err(PatternError::InvalidConfig(
                "min_monotonic_pairs must be below the segment count".into(),
            ));
        }
        Ok(())
    }
}
