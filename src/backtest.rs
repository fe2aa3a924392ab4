//! Trade replay.
//!
//! [`simulate`] walks the candles after a signal until the stop or target is
//! touched or the holding window runs out. Fills happen at the level that was
//! touched, never at the bar's close.

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    live::{bar_exit, SignalStatus},
    store::SignalStore,
    Candle, CandleSeries, Direction, HistoricalSignal, PatternSignal, PatternType, Timeframe,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub max_holding_days: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            max_holding_days: 30,
        }
    }
}

/// Outcome of replaying one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub signal_id: String,
    pub symbol: String,
    pub pattern_type: PatternType,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub confidence_score: u8,
    pub entry_date: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_date: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub hit_target: bool,
    pub hit_stop_loss: bool,
    pub timeout_exit: bool,
    /// Signed by direction: a short that falls is a gain
    pub profit_loss_pct: f64,
    pub max_drawdown_pct: f64,
    /// Calendar days from entry to exit
    pub days_to_exit: Option<i64>,
}

impl BacktestResult {
    fn open(signal: &PatternSignal) -> Self {
        Self {
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            pattern_type: signal.pattern_type(),
            timeframe: signal.timeframe,
            direction: signal.direction,
            confidence_score: signal.confidence_score,
            entry_date: signal.detected_at,
            entry_price: signal.entry_price,
            exit_date: None,
            exit_price: None,
            hit_target: false,
            hit_stop_loss: false,
            timeout_exit: false,
            profit_loss_pct: 0.0,
            max_drawdown_pct: 0.0,
            days_to_exit: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.exit_price.is_some()
    }

    pub fn is_win(&self) -> bool {
        self.profit_loss_pct > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.profit_loss_pct < 0.0
    }

    fn close_at(&mut self, at: DateTime<Utc>, price: f64) {
        let sign = self.direction.sign();
        self.exit_date = Some(at);
        self.exit_price = Some(price);
        self.profit_loss_pct = (price - self.entry_price) / self.entry_price * 100.0 * sign;
        self.days_to_exit = Some((at.date_naive() - self.entry_date.date_naive()).num_days());
    }
}

/// Adverse excursion of `price` from `entry`, percent. Never negative.
fn adverse_pct(direction: Direction, entry: f64, price: f64) -> f64 {
    ((entry - price) / entry * 100.0 * direction.sign()).max(0.0)
}

/// Replay `signal` against the candles that followed it.
///
/// Only candles after the signal and within `max_holding_days` of it count.
/// With none of those the result stays unresolved; otherwise it exits at the
/// stop, the target or, failing both, the last close in the window.
pub fn simulate(signal: &PatternSignal, subsequent: &[Candle], max_holding_days: u32) -> BacktestResult {
    let mut result = BacktestResult::open(signal);
    let deadline = signal.detected_at + Duration::days(i64::from(max_holding_days));
    let levels = signal.levels();
    let direction = signal.direction;

    let mut last_in_window: Option<&Candle> = None;
    for candle in subsequent
        .iter()
        .filter(|c| c.timestamp > signal.detected_at)
        .take_while(|c| c.timestamp <= deadline)
    {
        last_in_window = Some(candle);
        let adverse = direction.adverse_extreme(candle.high, candle.low);

        match bar_exit(direction, &levels, candle.high, candle.low) {
            Some(exit) if exit.status == SignalStatus::Failed => {
                let drawdown = adverse_pct(direction, levels.entry, levels.stop);
                result.max_drawdown_pct = result.max_drawdown_pct.max(drawdown);
                result.hit_stop_loss = true;
                result.close_at(candle.timestamp, exit.price);
                return result;
            },
            Some(exit) => {
                let drawdown = adverse_pct(direction, levels.entry, adverse);
                result.max_drawdown_pct = result.max_drawdown_pct.max(drawdown);
                result.hit_target = true;
                result.close_at(candle.timestamp, exit.price);
                return result;
            },
            None => {
                let drawdown = adverse_pct(direction, levels.entry, adverse);
                result.max_drawdown_pct = result.max_drawdown_pct.max(drawdown);
            },
        }
    }

    match last_in_window {
        Some(last) => {
            result.timeout_exit = true;
            result.close_at(last.timestamp, last.close);
        },
        None => debug!(signal = %signal.id, "no candles after signal, leaving unresolved"),
    }
    result
}

/// Replay many signals in parallel, each against its own candle slice.
pub fn simulate_all<'a, I>(jobs: I, max_holding_days: u32) -> Vec<BacktestResult>
where
    I: IntoParallelIterator<Item = (&'a PatternSignal, &'a [Candle])>,
{
    jobs.into_par_iter()
        .map(|(signal, candles)| simulate(signal, candles, max_holding_days))
        .collect()
}

/// Replay signals found by
/// [`PatternEngine::scan_history`](crate::PatternEngine::scan_history)
/// against the rest of the series they came from.
pub fn simulate_history(
    series: &CandleSeries,
    signals: &[HistoricalSignal],
    config: &BacktestConfig,
) -> Vec<BacktestResult> {
    let candles = series.candles();
    let jobs: Vec<(&PatternSignal, &[Candle])> = signals
        .iter()
        .map(|h| {
            let from = (h.index + 1).min(candles.len());
            (&h.signal, &candles[from..])
        })
        .collect();
    simulate_all(jobs, config.max_holding_days)
}

/// Save every result to `store`, in order. Stops at the first failure.
pub async fn record_results(store: &dyn SignalStore, results: &[BacktestResult]) -> crate::Result<()> {
    for result in results {
        store.save_backtest_result(result).await?;
    }
    info!(results = results.len(), "backtest results saved");
    Ok(())
}
