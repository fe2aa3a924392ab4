//! Bull and bear flags: a sharp directional pole followed by a tight,
//! quieting consolidation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::helpers::{
    build_signal, edge_volume_ratio, highest_high, lowest_low, pct_change, MIN_DETECTION_BARS,
    VOLUME_EDGE_BARS,
};
use crate::{
    params::{check_params, get_multiple, get_period, get_ratio, ParamMeta, ParameterizedDetector},
    Direction, EnrichedCandle, OHLCVExt, PatternDetector, PatternError, PatternKind,
    PatternSignal, Period, Ratio, Result, Timeframe, TradeLevels, OHLCV,
};

/// Measurements taken from a flag formation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagStats {
    /// Signed pole move in percent
    pub pole_move_pct: f64,
    pub pole_height: f64,
    /// Share of pole candles closing in the pole's direction
    pub pole_agreement: f64,
    pub pole_volume_ratio: f64,
    pub flag_high: f64,
    pub flag_low: f64,
    pub flag_range_pct: f64,
    pub flag_volume_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagConfig {
    pub pole_len: Period,
    pub flag_len: Period,
    pub min_pole_move: Ratio,
    pub min_pole_agreement: Ratio,
    pub max_flag_range: Ratio,
    pub max_flag_volume_ratio: Ratio,
    /// Offset applied to the flag boundaries for entry and stop
    pub level_buffer: Ratio,
    pub min_risk_reward: f64,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            pole_len: Period::new_const(10),
            flag_len: Period::new_const(10),
            min_pole_move: Ratio::new_const(0.05),
            min_pole_agreement: Ratio::new_const(0.6),
            max_flag_range: Ratio::new_const(0.10),
            max_flag_volume_ratio: Ratio::new_const(0.8),
            level_buffer: Ratio::new_const(0.01),
            min_risk_reward: 2.0,
        }
    }
}

static FLAG_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("pole_len", 10.0, (5.0, 20.0, 1.0), "Candles in the pole"),
    ParamMeta::period("flag_len", 10.0, (5.0, 20.0, 1.0), "Candles in the consolidation"),
    ParamMeta::ratio("min_pole_move", 0.05, (0.02, 0.20, 0.01), "Minimum pole move"),
    ParamMeta::ratio(
        "min_pole_agreement",
        0.6,
        (0.5, 1.0, 0.05),
        "Minimum share of pole candles moving with the pole",
    ),
    ParamMeta::ratio("max_flag_range", 0.10, (0.02, 0.20, 0.01), "Maximum flag height over its low"),
    ParamMeta::ratio(
        "max_flag_volume_ratio",
        0.8,
        (0.3, 1.0, 0.05),
        "Maximum late/early volume ratio inside the flag",
    ),
    ParamMeta::ratio("level_buffer", 0.01, (0.0, 0.05, 0.005), "Entry/stop offset"),
    ParamMeta::multiple("min_risk_reward", 2.0, (1.0, 5.0, 0.5), "Risk-reward floor"),
];

impl ParameterizedDetector for FlagConfig {
    fn param_meta() -> &'static [ParamMeta] {
        FLAG_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        check_params(params, FLAG_PARAMS)?;
        Ok(Self {
            pole_len: get_period(params, "pole_len", 10)?,
            flag_len: get_period(params, "flag_len", 10)?,
            min_pole_move: get_ratio(params, "min_pole_move", 0.05)?,
            min_pole_agreement: get_ratio(params, "min_pole_agreement", 0.6)?,
            max_flag_range: get_ratio(params, "max_flag_range", 0.10)?,
            max_flag_volume_ratio: get_ratio(params, "max_flag_volume_ratio", 0.8)?,
            level_buffer: get_ratio(params, "level_buffer", 0.01)?,
            min_risk_reward: get_multiple(params, "min_risk_reward", 2.0)?,
        })
    }

    fn detector_key() -> &'static str {
        "flag"
    }
}

/// Detects a flag in one direction
#[derive(Debug, Clone)]
pub struct FlagDetector {
    pub direction: Direction,
    pub config: FlagConfig,
}

impl FlagDetector {
    pub fn bull() -> Self {
        Self {
            direction: Direction::Bullish,
            config: FlagConfig::default(),
        }
    }

    pub fn bear() -> Self {
        Self {
            direction: Direction::Bearish,
            config: FlagConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FlagConfig) -> Self {
        self.config = config;
        self
    }

    fn span(&self) -> usize {
        self.config.pole_len.get() + self.config.flag_len.get()
    }
}

impl PatternDetector for FlagDetector {
    fn name(&self) -> &'static str {
        match self.direction {
            Direction::Bullish => "bull_flag",
            Direction::Bearish => "bear_flag",
        }
    }

    fn min_bars(&self) -> usize {
        self.span().max(MIN_DETECTION_BARS)
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
        let window = &candles[candles.len() - self.span()..];
        let (pole, flag) = window.split_at(cfg.pole_len.get());
        let (Some(pole_start), Some(pole_end)) = (pole.first(), pole.last()) else {
            return Vec::new();
        };

        let sign = self.direction.sign();
        let pole_move = pct_change(pole_start.open(), pole_end.close());
        if pole_move * sign < cfg.min_pole_move.get() {
            return Vec::new();
        }

        let agreeing = pole
            .iter()
            .filter(|c| match self.direction {
                Direction::Bullish => c.is_bullish(),
                Direction::Bearish => c.is_bearish(),
            })
            .count();
        let pole_agreement = agreeing as f64 / pole.len() as f64;
        if pole_agreement < cfg.min_pole_agreement.get() {
            return Vec::new();
        }

        let pole_volume_ratio = edge_volume_ratio(pole, VOLUME_EDGE_BARS);
        if pole_volume_ratio < 1.0 {
            return Vec::new();
        }

        let flag_high = highest_high(flag);
        let flag_low = lowest_low(flag);
        let flag_range = (flag_high - flag_low) / flag_low;
        if flag_range >= cfg.max_flag_range.get() {
            return Vec::new();
        }

        let flag_volume_ratio = edge_volume_ratio(flag, VOLUME_EDGE_BARS);
        if flag_volume_ratio > cfg.max_flag_volume_ratio.get() {
            return Vec::new();
        }

        let pole_height = (pole_end.close() - pole_start.open()).abs();
        let buffer = cfg.level_buffer.get();
        let levels = match self.direction {
            Direction::Bullish => {
                let entry = flag_high * (1.0 + buffer);
                TradeLevels {
                    entry,
                    target: entry + pole_height,
                    stop: flag_low * (1.0 - buffer),
                }
            },
            Direction::Bearish => {
                let entry = flag_low * (1.0 - buffer);
                TradeLevels {
                    entry,
                    target: entry - pole_height,
                    stop: flag_high * (1.0 + buffer),
                }
            },
        };

        let stats = FlagStats {
            pole_move_pct: pole_move * 100.0,
            pole_height,
            pole_agreement,
            pole_volume_ratio,
            flag_high,
            flag_low,
            flag_range_pct: flag_range * 100.0,
            flag_volume_ratio,
        };
        let pattern = match self.direction {
            Direction::Bullish => PatternKind::BullFlag(stats),
            Direction::Bearish => PatternKind::BearFlag(stats),
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
        if self.config.pole_len.get() < VOLUME_EDGE_BARS
            || self.config.flag_len.get() < VOLUME_EDGE_BARS
        {
            return Err(PatternError::InvalidConfig(format!(
                "flag segments need at least {VOLUME_EDGE_BARS} candles"
            )));
        }
        let rr = self.config.min_risk_reward;
        if !rr.is_finite() || rr <= 0.0 {
            return Err(PatternError::InvalidValue("min_risk_reward must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{indicators, Candle};
    use chrono::{Duration, TimeZone, Utc};

    fn bull_flag_candles() -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut out = Vec::new();
        for i in 0..10 {
            let open = 100.0 + 0.8 * i as f64;
            let close = open + 0.8;
            out.push(Candle::new(
                start + Duration::hours(i),
                open,
                close + 0.1,
                open - 0.1,
                close,
                1_000 + 100 * i as u64,
            ));
        }
        for i in 0..10 {
            let (open, close) = if i % 2 == 0 { (108.0, 108.1) } else { (108.1, 108.0) };
            out.push(Candle::new(
                start + Duration::hours(10 + i),
                open,
                108.3,
                107.8,
                close,
                1_500 - 100 * i as u64,
            ));
        }
        out
    }

    #[test]
    fn test_bull_flag_levels() {
        let enriched = indicators::compute(&bull_flag_candles());
        let signals = FlagDetector::bull().detect("AAPL", &enriched, Timeframe::H1);
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert!((signal.entry_price - 108.3 * 1.01).abs() < 1e-9);
        assert!((signal.target_price - (108.3 * 1.01 + 8.0)).abs() < 1e-6);
        assert!((signal.stop_loss - 107.8 * 0.99).abs() < 1e-9);
        assert!(signal.risk_reward_ratio > 2.9);
        assert_eq!(signal.window.len(), 20);
    }

    /// Price-mirrored copy: the pole falls 116 -> 108, the flag spans 107.7..108.2
    fn bear_flag_candles() -> Vec<Candle> {
        bull_flag_candles()
            .into_iter()
            .map(|c| {
                Candle::new(
                    c.timestamp,
                    216.0 - c.open,
                    216.0 - c.low,
                    216.0 - c.high,
                    216.0 - c.close,
                    c.volume,
                )
            })
            .collect()
    }

    #[test]
    fn test_bear_flag_levels() {
        let enriched = indicators::compute(&bear_flag_candles());
        let signals = FlagDetector::bear().detect("AAPL", &enriched, Timeframe::H1);
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.direction, Direction::Bearish);
        assert!(matches!(signal.pattern, PatternKind::BearFlag(_)));
        assert!((signal.entry_price - 107.7 * 0.99).abs() < 1e-9);
        assert!((signal.target_price - (107.7 * 0.99 - 8.0)).abs() < 1e-6);
        assert!((signal.stop_loss - 108.2 * 1.01).abs() < 1e-9);
        assert!(FlagDetector::bull()
            .detect("AAPL", &enriched, Timeframe::H1)
            .is_empty());
    }

    #[test]
    fn test_bear_flag_ignores_rising_pole() {
        let enriched = indicators::compute(&bull_flag_candles());
        assert!(FlagDetector::bear()
            .detect("AAPL", &enriched, Timeframe::H1)
            .is_empty());
    }

    #[test]
    fn test_too_few_candles() {
        let enriched = indicators::compute(&bull_flag_candles()[..19]);
        assert!(FlagDetector::bull()
            .detect("AAPL", &enriched, Timeframe::H1)
            .is_empty());
    }

    #[test]
    fn test_loud_flag_rejected() {
        let mut candles = bull_flag_candles();
        for c in &mut candles[17..] {
            c.volume = 5_000;
        }
        let enriched = indicators::compute(&candles);
        assert!(FlagDetector::bull()
            .detect("AAPL", &enriched, Timeframe::H1)
            .is_empty());
    }

    #[test]
    fn test_with_params() {
        let mut params = HashMap::new();
        params.insert("min_pole_move", 0.1);
        let config = FlagConfig::with_params(&params).unwrap();
        assert_eq!(config.min_pole_move.get(), 0.1);
        assert_eq!(config.pole_len.get(), 10);

        params.insert("min_pole_move", 0.5);
        assert!(FlagConfig::with_params(&params).is_err());
    }
}
