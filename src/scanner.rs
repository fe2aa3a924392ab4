//! Batched multi-symbol scans.
//!
//! Symbols go through in batches of `batch_size`, with a pause between
//! batches to stay under upstream rate limits. Fetches inside a batch run
//! concurrently. A scan can be stopped between symbols; whatever finished
//! before that stays in the report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    freshness::{CandleCache, FreshnessSummary},
    orchestrator::DetectionOrchestrator,
    source::{FetchRequest, FetchedSeries},
    store::SignalStore,
    PatternSignal, Timeframe,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub fetch_timeout_ms: u64,
    pub timeframes: Vec<Timeframe>,
    pub candle_limit: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay_ms: 1_000,
            fetch_timeout_ms: 10_000,
            timeframes: vec![Timeframe::H1, Timeframe::H4, Timeframe::D1],
            candle_limit: 200,
        }
    }
}

impl ScanConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Cooperative stop flag shared with a running scan
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    stopped: Arc<AtomicBool>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub symbol: String,
    pub timeframe: Option<Timeframe>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SymbolFreshness {
    pub symbol: String,
    pub freshness: FreshnessSummary,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// Best first across all symbols
    pub signals: Vec<PatternSignal>,
    pub scanned: Vec<String>,
    pub failures: Vec<ScanFailure>,
    pub freshness: Vec<SymbolFreshness>,
    pub stopped: bool,
}

pub struct Scanner {
    cache: Arc<CandleCache>,
    orchestrator: Arc<DetectionOrchestrator>,
    store: Option<Arc<dyn SignalStore>>,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(
        cache: Arc<CandleCache>,
        orchestrator: Arc<DetectionOrchestrator>,
        config: ScanConfig,
    ) -> Self {
        Self {
            cache,
            orchestrator,
            store: None,
            config,
        }
    }

    /// Save every signal found to `store`
    pub fn with_store(mut self, store: Arc<dyn SignalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// All configured timeframes for one symbol, fetched concurrently
    async fn fetch_symbol(
        &self,
        symbol: &str,
    ) -> (BTreeMap<Timeframe, FetchedSeries>, Vec<ScanFailure>) {
        let fetches = self.config.timeframes.iter().map(|&timeframe| async move {
            let request = FetchRequest::latest(symbol, timeframe, self.config.candle_limit);
            (timeframe, self.cache.get_or_fetch(&request).await)
        });

        let mut series = BTreeMap::new();
        let mut failures = Vec::new();
        for (timeframe, outcome) in join_all(fetches).await {
            match outcome {
                Ok(fetched) => {
                    series.insert(timeframe, fetched);
                },
                Err(err) => {
                    warn!(%symbol, %timeframe, error = %err, "fetch failed");
                    failures.push(ScanFailure {
                        symbol: symbol.to_string(),
                        timeframe: Some(timeframe),
                        error: err.to_string(),
                    });
                },
            }
        }
        (series, failures)
    }

    async fn persist(&self, signals: &[PatternSignal]) {
        let Some(store) = &self.store else {
            return;
        };
        for signal in signals {
            if let Err(err) = store.save_signal(signal).await {
                warn!(signal = %signal.id, error = %err, "could not save signal");
            }
        }
    }

    pub async fn scan(&self, symbols: &[String], control: &ScanControl) -> ScanReport {
        let mut report = ScanReport::default();
        let batch_size = self.config.batch_size.max(1);
        let batches = symbols.len().div_ceil(batch_size);

        for (n, batch) in symbols.chunks(batch_size).enumerate() {
            if n > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
            if control.is_stopped() {
                report.stopped = true;
                break;
            }

            let fetched = join_all(batch.iter().map(|symbol| self.fetch_symbol(symbol))).await;
            for (symbol, (series, failures)) in batch.iter().zip(fetched) {
                if control.is_stopped() {
                    report.stopped = true;
                    break;
                }
                report.failures.extend(failures);
                if series.is_empty() {
                    continue;
                }
                match self.orchestrator.detect_all(symbol, &series).await {
                    Ok((signals, freshness)) => {
                        self.persist(&signals).await;
                        report.signals.extend(signals);
                        report.freshness.push(SymbolFreshness {
                            symbol: symbol.clone(),
                            freshness,
                        });
                        report.scanned.push(symbol.clone());
                    },
                    Err(err) => report.failures.push(ScanFailure {
                        symbol: symbol.clone(),
                        timeframe: None,
                        error: err.to_string(),
                    }),
                }
            }
            info!(
                batch = n + 1,
                of = batches,
                signals = report.signals.len(),
                "scan batch done"
            );
            if report.stopped {
                break;
            }
        }

        report
            .signals
            .sort_by(|a, b| b.confidence_score.cmp(&a.confidence_score));
        report
    }
}
