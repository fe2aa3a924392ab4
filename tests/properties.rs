//! Property tests over generated candle series.

mod common;

use common::start;
use patternscope::indicators::{self, rsi};
use patternscope::prelude::*;
use proptest::prelude::*;

fn candles_from(steps: &[(f64, f64, u64)]) -> Vec<Candle> {
    let step = Timeframe::D1.duration();
    let mut price = 100.0;
    steps
        .iter()
        .enumerate()
        .map(|(i, &(change, spread, volume))| {
            let open = price;
            let close = (price + change).max(1.0);
            price = close;
            Candle::new(
                start() + step * i as i32,
                open,
                open.max(close) + spread,
                (open.min(close) - spread).max(0.5),
                close,
                volume,
            )
        })
        .collect()
}

fn steps(max_len: usize) -> impl Strategy<Value = Vec<(f64, f64, u64)>> {
    prop::collection::vec((-2.0f64..2.0, 0.0f64..1.5, 100u64..5_000), 1..max_len)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_indicators_ignore_future_bars(steps in steps(260), cut in 0usize..260) {
        let candles = candles_from(&steps);
        let cut = cut.min(candles.len());
        let full = indicators::compute(&candles);
        let prefix = indicators::compute(&candles[..cut]);
        prop_assert_eq!(&full[..cut], &prefix[..]);
    }

    #[test]
    fn prop_rsi_saturates_on_monotonic_closes(start_price in 10.0f64..500.0, len in 15usize..60) {
        let rising: Vec<f64> = (0..len).map(|i| start_price + i as f64).collect();
        let falling: Vec<f64> = (0..len).map(|i| start_price + len as f64 - i as f64).collect();
        prop_assert!(rsi(&rising, 14).iter().flatten().all(|v| *v == 100.0));
        prop_assert!(rsi(&falling, 14).iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn prop_signals_keep_risk_reward_and_confidence_bounds(steps in steps(160)) {
        let engine = EngineBuilder::new()
            .with_all_defaults()
            .min_confidence(40)
            .build()
            .unwrap();
        let series = CandleSeries::new("PRP", Timeframe::D1, candles_from(&steps)).unwrap();
        for hist in engine.scan_history(&series) {
            let signal = &hist.signal;
            prop_assert!(signal.risk_reward_ratio >= 2.0);
            prop_assert!(signal.confidence_score <= 100);
            prop_assert!(signal.confidence_score >= 40);
        }
    }
}
