//! Confidence scoring.
//!
//! A signal's score starts from its family's base, collects bonuses and
//! penalties for the evidence around it, is weighted by timeframe and is
//! clamped to `0..=100`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    detectors::helpers::linear_regression, performance::PatternPerformance, Direction,
    EnrichedCandle, PatternError, PatternFamily, PatternKind, PatternSignal, Result, Timeframe,
    OHLCV,
};

/// Bars fitted when projecting the trendline the last close must break
pub const TRENDLINE_BARS: usize = 10;
/// Backtested trades a pattern type needs before calibration moves its base
pub const CALIBRATION_MIN_TRADES: usize = 5;

// ============================================================
// WEIGHTS
// ============================================================

/// Every tunable number the scorer uses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub base_breakout: f64,
    pub base_flag: f64,
    pub base_triangle: f64,
    pub base_double: f64,
    /// Calibrated per-pattern bases keyed by pattern name; override the family base
    pub pattern_base: BTreeMap<String, f64>,

    pub quality_bonus: f64,
    pub strength_bonus: f64,
    pub volume_bonus: f64,
    pub multi_timeframe_bonus: f64,
    pub trendline_bonus: f64,
    pub ema_aligned: f64,
    pub ema_mixed: f64,
    pub ema_opposed: f64,

    /// Extra volume (fraction above 1.0) that counts as confirmation, per family
    pub breakout_volume: f64,
    pub triangle_volume: f64,
    pub flag_volume: f64,
    pub double_volume: f64,

    pub flag_quality_pole_pct: f64,
    pub flag_strength_agreement: f64,
    pub triangle_quality_touches: usize,
    pub triangle_strength_pairs: usize,
    pub channel_quality_touches: usize,
    pub strong_breakout_pct: f64,
    pub double_quality_depth_pct: f64,
    pub double_strength_diff_pct: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base_breakout: 50.0,
            base_flag: 55.0,
            base_triangle: 50.0,
            base_double: 50.0,
            pattern_base: BTreeMap::new(),
            quality_bonus: 15.0,
            strength_bonus: 10.0,
            volume_bonus: 10.0,
            multi_timeframe_bonus: 15.0,
            trendline_bonus: 10.0,
            ema_aligned: 10.0,
            ema_mixed: -5.0,
            ema_opposed: -10.0,
            breakout_volume: 0.5,
            triangle_volume: 0.3,
            flag_volume: 0.2,
            double_volume: 0.15,
            flag_quality_pole_pct: 8.0,
            flag_strength_agreement: 0.8,
            triangle_quality_touches: 4,
            triangle_strength_pairs: 3,
            channel_quality_touches: 2,
            strong_breakout_pct: 2.0,
            double_quality_depth_pct: 5.0,
            double_strength_diff_pct: 1.0,
        }
    }
}

impl ScoringWeights {
    pub fn family_base(&self, family: PatternFamily) -> f64 {
        match family {
            PatternFamily::Breakout => self.base_breakout,
            PatternFamily::Flag => self.base_flag,
            PatternFamily::Triangle => self.base_triangle,
            PatternFamily::DoubleExtreme => self.base_double,
        }
    }

    fn volume_threshold(&self, family: PatternFamily) -> f64 {
        match family {
            PatternFamily::Breakout => self.breakout_volume,
            PatternFamily::Flag => self.flag_volume,
            PatternFamily::Triangle => self.triangle_volume,
            PatternFamily::DoubleExtreme => self.double_volume,
        }
    }

    /// Base for one pattern, preferring a calibrated value
    pub fn base_for(&self, pattern: &PatternKind) -> f64 {
        let pattern_type = pattern.pattern_type();
        self.pattern_base
            .get(pattern_type.as_str())
            .copied()
            .unwrap_or_else(|| self.family_base(pattern_type.family()))
    }

    /// Nudge each pattern's base by its backtested win rate:
    /// `base + (win_rate - 0.5) * 20`, kept within 30..=70.
    ///
    /// Patterns with fewer than [`CALIBRATION_MIN_TRADES`] trades keep their base.
    pub fn calibrated(&self, by_pattern: &[PatternPerformance]) -> Self {
        let mut weights = self.clone();
        for perf in by_pattern {
            if perf.metrics.total_trades < CALIBRATION_MIN_TRADES {
                continue;
            }
            let family_base = self.family_base(perf.pattern_type.family());
            let base = (family_base + (perf.metrics.win_rate - 0.5) * 20.0).clamp(30.0, 70.0);
            weights
                .pattern_base
                .insert(perf.pattern_type.as_str().to_string(), base);
        }
        weights
    }

    pub fn validate(&self) -> Result<()> {
        let bases = [
            self.base_breakout,
            self.base_flag,
            self.base_triangle,
            self.base_double,
        ];
        for base in bases.into_iter().chain(self.pattern_base.values().copied()) {
            if !(0.0..=100.0).contains(&base) {
                return Err(PatternError::OutOfRange {
                    field: "base score",
                    value: base,
                    min: 0.0,
                    max: 100.0,
                });
            }
        }
        let deltas = [
            self.quality_bonus,
            self.strength_bonus,
            self.volume_bonus,
            self.multi_timeframe_bonus,
            self.trendline_bonus,
            self.ema_aligned,
            self.ema_mixed,
            self.ema_opposed,
            self.flag_quality_pole_pct,
            self.flag_strength_agreement,
            self.strong_breakout_pct,
            self.double_quality_depth_pct,
            self.double_strength_diff_pct,
        ];
        if deltas.iter().any(|d| !d.is_finite()) {
            return Err(PatternError::InvalidValue("scoring weights must be finite"));
        }
        let thresholds = [
            self.breakout_volume,
            self.triangle_volume,
            self.flag_volume,
            self.double_volume,
        ];
        if thresholds.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(PatternError::InvalidValue(
                "volume thresholds must be non-negative",
            ));
        }
        Ok(())
    }
}

// ============================================================
// CONFIRMATIONS
// ============================================================

/// How the EMA stack lines up with a signal's direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmaAlignment {
    Aligned,
    Mixed,
    Opposed,
    /// Fewer than two EMAs available
    #[default]
    Unknown,
}

/// Evidence gathered around a signal, separate from the pattern itself
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Confirmations {
    /// Lowest higher timeframe with a same-direction signal
    pub higher_timeframe: Option<Timeframe>,
    pub trendline_break: bool,
    pub ema_alignment: EmaAlignment,
}

impl Confirmations {
    /// Read trendline and EMA evidence from the candles a signal was found on.
    pub fn observe(direction: Direction, candles: &[EnrichedCandle]) -> Self {
        Self {
            higher_timeframe: None,
            trendline_break: trendline_break(direction, candles),
            ema_alignment: ema_alignment(direction, candles),
        }
    }

    pub fn with_higher_timeframe(mut self, timeframe: Option<Timeframe>) -> Self {
        self.higher_timeframe = timeframe;
        self
    }
}

/// Last close beyond the regression line of the previous highs (bullish) or
/// lows (bearish), projected to the last bar.
fn trendline_break(direction: Direction, candles: &[EnrichedCandle]) -> bool {
    let Some((last, before)) = candles.split_last() else {
        return false;
    };
    if before.len() < TRENDLINE_BARS {
        return false;
    }
    let recent = &before[before.len() - TRENDLINE_BARS..];
    let values: Vec<f64> = match direction {
        Direction::Bullish => recent.iter().map(OHLCV::high).collect(),
        Direction::Bearish => recent.iter().map(OHLCV::low).collect(),
    };
    let (slope, intercept) = linear_regression(&values);
    let projected = slope * TRENDLINE_BARS as f64 + intercept;
    match direction {
        Direction::Bullish => last.close() > projected,
        Direction::Bearish => last.close() < projected,
    }
}

fn ema_alignment(direction: Direction, candles: &[EnrichedCandle]) -> EmaAlignment {
    let Some(last) = candles.last() else {
        return EmaAlignment::Unknown;
    };
    let emas = last.indicators.emas();
    if emas.len() < 2 {
        return EmaAlignment::Unknown;
    }
    let mut stack = Vec::with_capacity(emas.len() + 1);
    stack.push(last.close());
    stack.extend(emas);

    let descending = stack.windows(2).all(|w| w[0] > w[1]);
    let ascending = stack.windows(2).all(|w| w[0] < w[1]);
    match (direction, descending, ascending) {
        (Direction::Bullish, true, _) | (Direction::Bearish, _, true) => EmaAlignment::Aligned,
        (Direction::Bullish, _, true) | (Direction::Bearish, true, _) => EmaAlignment::Opposed,
        _ => EmaAlignment::Mixed,
    }
}

// ============================================================
// SCORER
// ============================================================

/// Per-factor contributions behind a score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub quality: f64,
    pub strength: f64,
    pub volume: f64,
    pub multi_timeframe: f64,
    pub trendline: f64,
    pub ema: f64,
    pub timeframe_weight: f64,
    pub score: u8,
}

impl ScoreBreakdown {
    /// Sum before the timeframe weight
    pub fn raw(&self) -> f64 {
        self.base
            + self.quality
            + self.strength
            + self.volume
            + self.multi_timeframe
            + self.trendline
            + self.ema
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    weights: ScoringWeights,
}

impl ConfidenceScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn score(&self, signal: &PatternSignal, confirmations: &Confirmations) -> u8 {
        self.score_breakdown(signal, confirmations).score
    }

    /// Score `signal` and record its multi-timeframe confirmation.
    pub fn apply(&self, signal: &mut PatternSignal, confirmations: &Confirmations) {
        signal.confidence_score = self.score(signal, confirmations);
        signal.multi_timeframe_confirmed = confirmations.higher_timeframe.is_some();
        signal.confirming_timeframe = confirmations.higher_timeframe;
    }

    pub fn score_breakdown(
        &self,
        signal: &PatternSignal,
        confirmations: &Confirmations,
    ) -> ScoreBreakdown {
        let w = &self.weights;
        let (quality, strength) = self.quality_and_strength(&signal.pattern);
        let family = signal.pattern_type().family();
        let volume_confirmed = signal.pattern.volume_ratio() >= 1.0 + w.volume_threshold(family);

        let bonus = |hit: bool, value: f64| if hit { value } else { 0.0 };
        let mut breakdown = ScoreBreakdown {
            base: w.base_for(&signal.pattern),
            quality: bonus(quality, w.quality_bonus),
            strength: bonus(strength, w.strength_bonus),
            volume: bonus(volume_confirmed, w.volume_bonus),
            multi_timeframe: bonus(
                confirmations.higher_timeframe.is_some(),
                w.multi_timeframe_bonus,
            ),
            trendline: bonus(confirmations.trendline_break, w.trendline_bonus),
            ema: match confirmations.ema_alignment {
                EmaAlignment::Aligned => w.ema_aligned,
                EmaAlignment::Mixed => w.ema_mixed,
                EmaAlignment::Opposed => w.ema_opposed,
                EmaAlignment::Unknown => 0.0,
            },
            timeframe_weight: signal.timeframe.weight(),
            score: 0,
        };
        let weighted = (breakdown.raw() * breakdown.timeframe_weight).round();
        breakdown.score = weighted.clamp(0.0, 100.0) as u8;
        breakdown
    }

    fn quality_and_strength(&self, pattern: &PatternKind) -> (bool, bool) {
        let w = &self.weights;
        match pattern {
            PatternKind::BullFlag(s) | PatternKind::BearFlag(s) => (
                s.pole_move_pct.abs() >= w.flag_quality_pole_pct,
                s.pole_agreement >= w.flag_strength_agreement,
            ),
            PatternKind::AscendingTriangle(s) | PatternKind::DescendingTriangle(s) => (
                s.touches >= w.triangle_quality_touches,
                s.monotonic_pairs >= w.triangle_strength_pairs,
            ),
            PatternKind::ChannelBreakout(s) => (
                s.upper_touches >= w.channel_quality_touches
                    && s.lower_touches >= w.channel_quality_touches,
                s.breakout_pct >= w.strong_breakout_pct,
            ),
            PatternKind::DoubleTop(s) | PatternKind::DoubleBottom(s) => (
                s.depth_pct >= w.double_quality_depth_pct,
                s.extreme_diff_pct() <= w.double_strength_diff_pct,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detectors::FlagStats, indicators, performance::PerformanceMetrics, Candle,
        PatternType, SignalStatus,
    };
    use chrono::{Duration, TimeZone, Utc};

    fn flag_signal(timeframe: Timeframe, pole_move_pct: f64, volume_ratio: f64) -> PatternSignal {
        PatternSignal {
            id: "T".into(),
            symbol: "T".into(),
            pattern: PatternKind::BullFlag(FlagStats {
                pole_move_pct,
                pole_height: 8.0,
                pole_agreement: 1.0,
                pole_volume_ratio: volume_ratio,
                flag_high: 108.3,
                flag_low: 107.8,
                flag_range_pct: 0.46,
                flag_volume_ratio: 0.5,
            }),
            direction: Direction::Bullish,
            timeframe,
            entry_price: 109.0,
            target_price: 117.0,
            stop_loss: 106.0,
            risk_reward_ratio: 8.0 / 3.0,
            potential_profit_pct: 7.3,
            confidence_score: 0,
            multi_timeframe_confirmed: false,
            confirming_timeframe: None,
            detected_at: Utc::now(),
            window: Vec::new(),
            status: SignalStatus::Active,
        }
    }

    fn rising(n: usize) -> Vec<EnrichedCandle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Steady climb, then a last bar closing above the trend of recent highs
        let candles: Vec<Candle> = (0..n)
            .map(|i| {
                let at = start + Duration::days(i as i64);
                let base = 100.0 + i as f64;
                if i + 1 == n {
                    Candle::new(at, base, base + 3.0, base - 0.5, base + 2.5, 10)
                } else {
                    Candle::new(at, base, base + 1.0, base - 0.5, base + 0.8, 10)
                }
            })
            .collect();
        indicators::compute(&candles)
    }

    #[test]
    fn test_breakdown_sums_bonuses() {
        let scorer = ConfidenceScorer::default();
        let signal = flag_signal(Timeframe::D1, 8.0, 1.6);
        let confirmations = Confirmations {
            higher_timeframe: Some(Timeframe::W1),
            trendline_break: true,
            ema_alignment: EmaAlignment::Aligned,
        };
        let breakdown = scorer.score_breakdown(&signal, &confirmations);
        // 55 + 15 + 10 + 10 + 15 + 10 + 10 = 125, x0.9 = 112.5 -> clamped
        assert_eq!(breakdown.raw(), 125.0);
        assert_eq!(breakdown.score, 100);
    }

    #[test]
    fn test_timeframe_weight_and_penalty() {
        let scorer = ConfidenceScorer::default();
        let signal = flag_signal(Timeframe::M1, 6.0, 1.0);
        let confirmations = Confirmations {
            ema_alignment: EmaAlignment::Opposed,
            ..Confirmations::default()
        };
        // (55 + 10 strength - 10 opposed) * 0.6 = 33
        assert_eq!(scorer.score(&signal, &confirmations), 33);
    }

    #[test]
    fn test_multi_timeframe_is_bonus_only() {
        let scorer = ConfidenceScorer::default();
        let mut signal = flag_signal(Timeframe::H1, 6.0, 1.0);
        let plain = scorer.score(&signal, &Confirmations::default());
        let confirmed = Confirmations::default().with_higher_timeframe(Some(Timeframe::H4));
        scorer.apply(&mut signal, &confirmed);
        assert!(signal.confidence_score > plain);
        assert!(signal.multi_timeframe_confirmed);
        assert_eq!(signal.confirming_timeframe, Some(Timeframe::H4));
    }

    #[test]
    fn test_observe_rising_market() {
        let candles = rising(30);
        let bullish = Confirmations::observe(Direction::Bullish, &candles);
        assert!(bullish.trendline_break);
        assert_eq!(bullish.ema_alignment, EmaAlignment::Aligned);

        let bearish = Confirmations::observe(Direction::Bearish, &candles);
        assert!(!bearish.trendline_break);
        assert_eq!(bearish.ema_alignment, EmaAlignment::Opposed);

        let short = Confirmations::observe(Direction::Bullish, &candles[..5]);
        assert_eq!(short.ema_alignment, EmaAlignment::Unknown);
        assert!(!short.trendline_break);
    }

    #[test]
    fn test_calibration_moves_base() {
        let metrics = |win_rate: f64, total_trades: usize| PerformanceMetrics {
            total_trades,
            win_rate,
            ..PerformanceMetrics::default()
        };
        let by_pattern = vec![
            PatternPerformance {
                pattern_type: PatternType::BullFlag,
                metrics: metrics(0.75, 20),
            },
            PatternPerformance {
                pattern_type: PatternType::DoubleTop,
                metrics: metrics(0.0, 2),
            },
        ];
        let weights = ScoringWeights::default().calibrated(&by_pattern);
        assert_eq!(weights.pattern_base.get("bull_flag"), Some(&60.0));
        assert!(!weights.pattern_base.contains_key("double_top"));
        assert!(weights.validate().is_ok());
    }
}
