//! Replay and aggregation over detected signals.

mod common;

use chrono::Duration;
use common::{bull_flag_candles, wandering_candles};
use patternscope::backtest::record_results;
use patternscope::performance::{by_pattern_type, by_timeframe};
use patternscope::prelude::*;

fn flag_signal() -> PatternSignal {
    let engine = EngineBuilder::new().with_flag_defaults().build().unwrap();
    let series = CandleSeries::new("AAPL", Timeframe::D1, bull_flag_candles(Timeframe::D1)).unwrap();
    engine.scan(&series).remove(0)
}

fn bar(signal: &PatternSignal, days: i64, high: f64, low: f64, close: f64) -> Candle {
    Candle::new(signal.detected_at + Duration::days(days), close, high, low, close, 1_000)
}

#[test]
fn test_flag_signal_reaches_target() {
    let signal = flag_signal();
    let later = [
        bar(&signal, 1, signal.entry_price + 1.0, signal.entry_price - 0.5, signal.entry_price + 0.5),
        bar(&signal, 2, signal.target_price + 0.2, signal.entry_price, signal.target_price),
    ];
    let result = simulate(&signal, &later, 30);

    assert!(result.hit_target);
    assert!(!result.hit_stop_loss);
    let expected = (signal.target_price - signal.entry_price) / signal.entry_price * 100.0;
    assert!((result.profit_loss_pct - expected).abs() < 1e-9);
    assert_eq!(result.days_to_exit, Some(2));
    assert_eq!(result.pattern_type, PatternType::BullFlag);
}

#[test]
fn test_gap_through_both_levels_is_a_stop() {
    let signal = flag_signal();
    let later = [bar(&signal, 1, signal.target_price + 5.0, signal.stop_loss - 5.0, signal.entry_price)];
    let result = simulate(&signal, &later, 30);
    assert!(result.hit_stop_loss && !result.hit_target);
    assert_eq!(result.exit_price, Some(signal.stop_loss));
    assert!(result.profit_loss_pct < 0.0);
}

#[test]
fn test_candles_beyond_holding_window_are_ignored() {
    let signal = flag_signal();
    let later = [
        bar(&signal, 1, signal.entry_price + 0.5, signal.entry_price - 0.5, signal.entry_price + 0.2),
        bar(&signal, 40, signal.target_price + 1.0, signal.entry_price, signal.target_price),
    ];
    let result = simulate(&signal, &later, 30);
    assert!(result.timeout_exit);
    assert!(!result.hit_target);
    assert_eq!(result.exit_date, Some(signal.detected_at + Duration::days(1)));
}

#[test]
fn test_walk_forward_report() {
    let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
    let config = BacktestConfig::default();

    let mut results = Vec::new();
    for seed in 0..6 {
        let series =
            CandleSeries::new("WLK", Timeframe::D1, wandering_candles(250, seed, Timeframe::D1)).unwrap();
        let history = engine.scan_history(&series);
        assert!(history.windows(2).all(|w| w[0].index <= w[1].index));
        let replayed = simulate_history(&series, &history, &config);
        assert_eq!(replayed.len(), history.len());
        results.extend(replayed);
    }

    match analyze(&results) {
        Ok(report) => {
            let overall = &report.overall;
            assert!(overall.wins + overall.losses <= overall.total_trades);
            assert!((0.0..=1.0).contains(&overall.win_rate));
            assert!((0.0..=100.0).contains(&overall.consistency_score));
            let rates = overall.target_hit_rate + overall.stop_loss_hit_rate + overall.timeout_exit_rate;
            assert!((rates - 1.0).abs() < 1e-9);
            let grouped: usize = report.by_pattern.iter().map(|p| p.metrics.total_trades).sum();
            assert_eq!(grouped, overall.total_trades);
        },
        Err(err) => assert!(matches!(err, PatternError::EmptyAggregationInput)),
    }
}

#[test]
fn test_empty_aggregation_fails() {
    assert!(matches!(aggregate(&[]), Err(PatternError::EmptyAggregationInput)));
    assert!(analyze(&[]).is_err());
}

#[test]
fn test_one_win_one_equal_loss() {
    let signal = flag_signal();
    let mut win = simulate(
        &signal,
        &[bar(&signal, 1, signal.target_price, signal.entry_price, signal.target_price)],
        30,
    );
    win.profit_loss_pct = 5.0;
    let mut loss = win.clone();
    loss.profit_loss_pct = -5.0;
    loss.hit_target = false;
    loss.hit_stop_loss = true;
    loss.entry_date = win.entry_date + Duration::days(1);
    loss.timeframe = Timeframe::H4;

    let metrics = aggregate(&[win.clone(), loss.clone()]).unwrap();
    assert!((metrics.profit_factor - 1.0).abs() < 1e-9);
    assert_eq!(metrics.max_consecutive_wins, 1);
    assert_eq!(metrics.max_consecutive_losses, 1);

    let frames = by_timeframe(&[win.clone(), loss]);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].timeframe, Timeframe::D1);
    assert_eq!(by_pattern_type(&[win])[0].pattern_type, PatternType::BullFlag);
}

#[test]
fn test_calibration_from_backtest() {
    let signal = flag_signal();
    let template = simulate(
        &signal,
        &[bar(&signal, 1, signal.target_price, signal.entry_price, signal.target_price)],
        30,
    );
    let results: Vec<BacktestResult> = (0..6)
        .map(|i| {
            let mut r = template.clone();
            r.entry_date = r.entry_date + Duration::days(i);
            r
        })
        .collect();

    let by_pattern = by_pattern_type(&results);
    let weights = ScoringWeights::default().calibrated(&by_pattern);
    let base = weights.pattern_base.get("bull_flag").copied().unwrap();
    assert!(base > ScoringWeights::default().base_flag);
}

#[tokio::test]
async fn test_results_are_recorded_in_order() {
    let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
    let series = CandleSeries::new("WLK", Timeframe::D1, wandering_candles(250, 3, Timeframe::D1)).unwrap();
    let history = engine.scan_history(&series);
    let mut results = simulate_history(&series, &history, &BacktestConfig::default());
    results.push(simulate(&flag_signal(), &[], 30));

    let store = MemoryStore::new();
    record_results(&store, &results).await.unwrap();

    let saved = store.backtest_results();
    assert_eq!(saved.len(), results.len());
    assert_eq!(saved.last().map(|r| r.signal_id.clone()), Some(flag_signal().id));
    assert!(saved.iter().zip(&results).all(|(a, b)| a.signal_id == b.signal_id));
}
