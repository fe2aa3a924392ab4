//! Candle fixtures shared by the integration tests.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use patternscope::prelude::*;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

/// Ten rising bars on rising volume, then ten tight bars on fading volume.
/// The flag tops out at 108.3 and bottoms at 107.8.
pub fn bull_flag_candles(timeframe: Timeframe) -> Vec<Candle> {
    let step = timeframe.duration();
    let mut out = Vec::new();
    for i in 0..10 {
        let open = 100.0 + 0.8 * i as f64;
        let close = open + 0.8;
        out.push(Candle::new(
            start() + step * i,
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
            start() + step * (10 + i),
            open,
            108.3,
            107.8,
            close,
            1_500 - 100 * i as u64,
        ));
    }
    out
}

pub fn bull_flag_series(symbol: &str, timeframe: Timeframe) -> CandleSeries {
    CandleSeries::new(symbol, timeframe, bull_flag_candles(timeframe)).unwrap()
}

/// Twenty bars bouncing between ~100 and ~105, then one bar closing at
/// `breakout_close` on `breakout_volume` (the channel averages 1 000).
pub fn channel_candles(breakout_close: f64, breakout_volume: u64) -> Vec<Candle> {
    let step = Timeframe::H1.duration();
    let mut out: Vec<Candle> = (0..20)
        .map(|i| {
            let at = start() + step * i;
            if i % 2 == 0 {
                Candle::new(at, 101.0, 105.0, 100.0, 104.0, 1_000)
            } else {
                Candle::new(at, 104.0, 104.9, 100.1, 101.0, 1_000)
            }
        })
        .collect();
    out.push(Candle::new(
        start() + step * 20,
        104.0,
        breakout_close.max(104.0) + 0.3,
        breakout_close.min(104.0) - 0.1,
        breakout_close,
        breakout_volume,
    ));
    out
}

/// Deterministic wandering series; `seed` shifts the phase
pub fn wandering_candles(n: usize, seed: u64, timeframe: Timeframe) -> Vec<Candle> {
    let step = timeframe.duration();
    let mut price = 100.0;
    (0..n)
        .map(|i| {
            let k = i as u64 * 7 + seed * 13;
            let change = (k % 100) as f64 / 50.0 - 1.0;
            let spread = 0.5 + (k % 10) as f64 / 10.0;
            let open = price;
            let close = (price + change).max(1.0);
            price = close;
            Candle::new(
                start() + step * i as i32,
                open,
                open.max(close) + spread,
                (open.min(close) - spread).max(0.5),
                close,
                1_000 + (k % 500),
            )
        })
        .collect()
}
