//! Statistics over backtest results.
//!
//! Metrics are recomputed from a result set on demand and never stored.
//! Only resolved results (those with an exit) count as trades.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{backtest::BacktestResult, PatternError, PatternType, Result, Timeframe};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Fraction of trades with positive P/L, 0..=1
    pub win_rate: f64,
    /// Gross gain over gross loss. Infinite with wins and no losses; written
    /// as `null` in JSON.
    #[serde(with = "profit_factor_serde")]
    pub profit_factor: f64,
    /// Mean P/L per trade, percent
    pub expectancy: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub total_return_pct: f64,
    pub consistency_score: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub target_hit_rate: f64,
    pub stop_loss_hit_rate: f64,
    pub timeout_exit_rate: f64,
    pub avg_days_to_exit: f64,
    pub avg_max_drawdown_pct: f64,
}

mod profit_factor_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            s.serialize_some(value)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternPerformance {
    pub pattern_type: PatternType,
    pub metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframePerformance {
    pub timeframe: Timeframe,
    pub metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub overall: PerformanceMetrics,
    pub by_pattern: Vec<PatternPerformance>,
    pub by_timeframe: Vec<TimeframePerformance>,
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population standard deviation
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// `100 - stddev / (|mean| + 0.1) * 10`, clamped to 0..=100
pub fn consistency_score(pnl: &[f64]) -> f64 {
    let score = 100.0 - std_dev(pnl) / (mean(pnl).abs() + 0.1) * 10.0;
    score.clamp(0.0, 100.0)
}

/// Longest runs of wins and losses, in the order given. Breakeven trades end
/// both runs.
fn streaks(pnl: impl Iterator<Item = f64>) -> (usize, usize) {
    let (mut wins, mut losses) = (0usize, 0usize);
    let (mut max_wins, mut max_losses) = (0usize, 0usize);
    for p in pnl {
        if p > 0.0 {
            wins += 1;
            losses = 0;
        } else if p < 0.0 {
            losses += 1;
            wins = 0;
        } else {
            wins = 0;
            losses = 0;
        }
        max_wins = max_wins.max(wins);
        max_losses = max_losses.max(losses);
    }
    (max_wins, max_losses)
}

/// Aggregate statistics over `results`.
///
/// Fails with [`PatternError::EmptyAggregationInput`] when no result has an
/// exit, rather than reporting a zero-valued metrics object.
pub fn aggregate(results: &[BacktestResult]) -> Result<PerformanceMetrics> {
    aggregate_iter(results)
}

/// [`aggregate`] over borrowed results from any source
pub fn aggregate_iter<'a>(
    results: impl IntoIterator<Item = &'a BacktestResult>,
) -> Result<PerformanceMetrics> {
    let mut unresolved = 0usize;
    let mut trades: Vec<&BacktestResult> = results
        .into_iter()
        .filter(|r| {
            unresolved += usize::from(!r.is_resolved());
            r.is_resolved()
        })
        .collect();
    if trades.is_empty() {
        return Err(PatternError::EmptyAggregationInput);
    }
    if unresolved > 0 {
        debug!(skipped = unresolved, "ignoring unresolved results");
    }
    trades.sort_by_key(|r| r.entry_date);

    let total = trades.len();
    let pnl: Vec<f64> = trades.iter().map(|r| r.profit_loss_pct).collect();
    let gains: Vec<f64> = pnl.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnl.iter().copied().filter(|p| *p < 0.0).collect();

    let gross_gain: f64 = gains.iter().sum();
    let gross_loss: f64 = losses.iter().sum::<f64>().abs();
    let profit_factor = if gains.is_empty() {
        0.0
    } else if losses.is_empty() {
        f64::INFINITY
    } else {
        gross_gain / gross_loss
    };

    let win_rate = rate(gains.len(), total);
    let avg_win_pct = mean(&gains);
    let avg_loss_pct = mean(&losses).abs();
    let (max_consecutive_wins, max_consecutive_losses) = streaks(pnl.iter().copied());

    let days: Vec<f64> = trades
        .iter()
        .filter_map(|r| r.days_to_exit)
        .map(|d| d as f64)
        .collect();
    let drawdowns: Vec<f64> = trades.iter().map(|r| r.max_drawdown_pct).collect();

    Ok(PerformanceMetrics {
        total_trades: total,
        wins: gains.len(),
        losses: losses.len(),
        win_rate,
        profit_factor,
        expectancy: win_rate * avg_win_pct - rate(losses.len(), total) * avg_loss_pct,
        avg_win_pct,
        avg_loss_pct,
        total_return_pct: pnl.iter().sum(),
        consistency_score: consistency_score(&pnl),
        max_consecutive_wins,
        max_consecutive_losses,
        target_hit_rate: rate(trades.iter().filter(|r| r.hit_target).count(), total),
        stop_loss_hit_rate: rate(trades.iter().filter(|r| r.hit_stop_loss).count(), total),
        timeout_exit_rate: rate(trades.iter().filter(|r| r.timeout_exit).count(), total),
        avg_days_to_exit: mean(&days),
        avg_max_drawdown_pct: mean(&drawdowns),
    })
}

/// Group `results` by `key` and aggregate each group. Groups with no resolved
/// trade are left out. Sorted by win rate, best first.
fn grouped<K: Ord + Copy>(
    results: &[BacktestResult],
    key: impl Fn(&BacktestResult) -> K,
) -> Vec<(K, PerformanceMetrics)> {
    let mut groups: BTreeMap<K, Vec<&BacktestResult>> = BTreeMap::new();
    for r in results {
        groups.entry(key(r)).or_default().push(r);
    }
    let mut out: Vec<(K, PerformanceMetrics)> = groups
        .into_iter()
        .filter_map(|(k, rs)| aggregate_iter(rs).ok().map(|m| (k, m)))
        .collect();
    out.sort_by(|a, b| b.1.win_rate.total_cmp(&a.1.win_rate));
    out
}

pub fn by_pattern_type(results: &[BacktestResult]) -> Vec<PatternPerformance> {
    grouped(results, |r| r.pattern_type)
        .into_iter()
        .map(|(pattern_type, metrics)| PatternPerformance {
            pattern_type,
            metrics,
        })
        .collect()
}

pub fn by_timeframe(results: &[BacktestResult]) -> Vec<TimeframePerformance> {
    grouped(results, |r| r.timeframe)
        .into_iter()
        .map(|(timeframe, metrics)| TimeframePerformance { timeframe, metrics })
        .collect()
}

/// Overall metrics plus per-pattern and per-timeframe breakdowns
pub fn analyze(results: &[BacktestResult]) -> Result<PerformanceReport> {
    Ok(PerformanceReport {
        overall: aggregate(results)?,
        by_pattern: by_pattern_type(results),
        by_timeframe: by_timeframe(results),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use chrono::{Duration, TimeZone, Utc};

    fn result(day: i64, pattern: PatternType, pnl: f64) -> BacktestResult {
        let entry = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap() + Duration::days(day);
        BacktestResult {
            signal_id: format!("s{day}"),
            symbol: "SPY".into(),
            pattern_type: pattern,
            timeframe: Timeframe::D1,
            direction: Direction::Bullish,
            confidence_score: 60,
            entry_date: entry,
            entry_price: 100.0,
            exit_date: Some(entry + Duration::days(3)),
            exit_price: Some(100.0 + pnl),
            hit_target: pnl > 0.0,
            hit_stop_loss: pnl < 0.0,
            timeout_exit: pnl == 0.0,
            profit_loss_pct: pnl,
            max_drawdown_pct: 2.0,
            days_to_exit: Some(3),
        }
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(matches!(aggregate(&[]), Err(PatternError::EmptyAggregationInput)));
    }

    #[test]
    fn test_equal_win_and_loss() {
        let rs = [
            result(0, PatternType::BullFlag, 10.0),
            result(1, PatternType::BullFlag, -10.0),
        ];
        let m = aggregate(&rs).unwrap();
        assert_eq!(m.total_trades, 2);
        assert!((m.profit_factor - 1.0).abs() < 1e-9);
        assert!((m.win_rate - 0.5).abs() < 1e-9);
        assert!(m.expectancy.abs() < 1e-9);
        assert_eq!(m.consistency_score, 0.0);
    }

    #[test]
    fn test_profit_factor_edges() {
        let wins = [result(0, PatternType::BullFlag, 5.0)];
        assert!(aggregate(&wins).unwrap().profit_factor.is_infinite());
        let losses = [result(0, PatternType::BullFlag, -5.0)];
        assert_eq!(aggregate(&losses).unwrap().profit_factor, 0.0);
    }

    #[test]
    fn test_streaks_follow_entry_date() {
        // Given out of order: by date it is W W L L L W
        let rs = [
            result(5, PatternType::DoubleTop, 1.0),
            result(2, PatternType::DoubleTop, -1.0),
            result(0, PatternType::DoubleTop, 1.0),
            result(4, PatternType::DoubleTop, -1.0),
            result(1, PatternType::DoubleTop, 1.0),
            result(3, PatternType::DoubleTop, -1.0),
        ];
        let m = aggregate(&rs).unwrap();
        assert_eq!(m.max_consecutive_wins, 2);
        assert_eq!(m.max_consecutive_losses, 3);
    }

    #[test]
    fn test_aggregate_over_borrowed_subset() {
        let mut open = result(9, PatternType::BullFlag, 0.0);
        open.exit_price = None;
        let rs = [
            result(0, PatternType::BullFlag, 4.0),
            result(1, PatternType::DoubleTop, -2.0),
            open,
            result(2, PatternType::BullFlag, -1.0),
        ];
        let flags = aggregate_iter(rs.iter().filter(|r| r.pattern_type == PatternType::BullFlag)).unwrap();
        assert_eq!(flags.total_trades, 2);
        assert!((flags.profit_factor - 4.0).abs() < 1e-9);
        assert_eq!(flags, by_pattern_type(&rs)[0].metrics);
        assert!(matches!(
            aggregate_iter(rs.iter().filter(|r| !r.is_resolved())),
            Err(PatternError::EmptyAggregationInput)
        ));
    }

    #[test]
    fn test_consistency_for_identical_returns() {
        assert_eq!(consistency_score(&[2.0, 2.0, 2.0]), 100.0);
    }

    #[test]
    fn test_grouping_sorted_by_win_rate() {
        let rs = [
            result(0, PatternType::BullFlag, -1.0),
            result(1, PatternType::BullFlag, 2.0),
            result(2, PatternType::DoubleBottom, 3.0),
        ];
        let groups = by_pattern_type(&rs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].pattern_type, PatternType::DoubleBottom);
        assert_eq!(groups[1].metrics.total_trades, 2);
    }

    #[test]
    fn test_infinite_profit_factor_json() {
        let m = aggregate(&[result(0, PatternType::BullFlag, 5.0)]).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"profit_factor\":null"));
        let back: PerformanceMetrics = serde_json::from_str(&json).unwrap();
        assert!(back.profit_factor.is_infinite());
    }
}
