//! Multi-timeframe detection with a short-lived, single-flight result cache.
//!
//! One pass per `"{symbol}:{timeframe}"` key runs at a time. A caller that
//! arrives while a pass is running gets the previous cached result, or waits
//! for the running pass when nothing is cached yet. Results are reused while
//! they are younger than the TTL and the last few candles are unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    freshness::FreshnessSummary,
    scoring::Confirmations,
    source::FetchedSeries,
    CandleSeries, PatternEngine, PatternError, PatternSignal, Result, Timeframe,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub cache_ttl_secs: u64,
    /// Trailing candles whose (close, volume) must match for a cache hit
    pub fingerprint_bars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            fingerprint_bars: 3,
        }
    }
}

/// An unscored signal and the evidence read from its own timeframe
#[derive(Debug, Clone)]
pub struct Candidate {
    pub signal: PatternSignal,
    pub confirmations: Confirmations,
}

/// Output of one detection pass over one (symbol, timeframe)
#[derive(Debug, Clone)]
pub struct TimeframeDetection {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candidates: Vec<Candidate>,
    pub computed_at: DateTime<Utc>,
}

type Fingerprint = Vec<(f64, u64)>;
type Pending = watch::Receiver<Option<Arc<TimeframeDetection>>>;

fn fingerprint(series: &CandleSeries, bars: usize) -> Fingerprint {
    series
        .tail(bars)
        .iter()
        .map(|c| (c.close, c.volume))
        .collect()
}

struct CacheEntry {
    detection: Arc<TimeframeDetection>,
    fingerprint: Fingerprint,
    stored_at: Instant,
}

#[derive(Default)]
struct Slot {
    cached: Option<CacheEntry>,
    in_flight: Option<Pending>,
}

enum Claim {
    Ready(Arc<TimeframeDetection>),
    Wait(Pending),
    Run(watch::Sender<Option<Arc<TimeframeDetection>>>),
}

/// Releases the key if a pass is dropped before it finishes
struct InFlightGuard<'a> {
    slots: &'a Mutex<HashMap<String, Slot>>,
    key: &'a str,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(slot) = self.slots.lock().get_mut(self.key) {
            slot.in_flight = None;
        }
    }
}

pub struct DetectionOrchestrator {
    engine: Arc<PatternEngine>,
    config: OrchestratorConfig,
    slots: Mutex<HashMap<String, Slot>>,
    passes: AtomicUsize,
}

impl DetectionOrchestrator {
    pub fn new(engine: Arc<PatternEngine>, config: OrchestratorConfig) -> Self {
        Self {
            engine,
            config,
            slots: Mutex::new(HashMap::new()),
            passes: AtomicUsize::new(0),
        }
    }

    pub fn engine(&self) -> &PatternEngine {
        &self.engine
    }

    /// Detection passes actually run, cache hits excluded
    pub fn detection_passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn cached_keys(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.cached.is_some())
            .count()
    }

    /// Forget cached results for `symbol`. Running passes are left alone.
    pub fn invalidate(&self, symbol: &str) {
        let prefix = format!("{symbol}:");
        self.slots.lock().retain(|key, slot| {
            if key.starts_with(&prefix) {
                slot.cached = None;
            }
            slot.cached.is_some() || slot.in_flight.is_some()
        });
    }

    fn claim(&self, key: &str, print: &Fingerprint) -> Claim {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let mut slots = self.slots.lock();
        // Expired results for other keys are dropped; running passes stay
        slots.retain(|k, slot| {
            k == key
                || slot.in_flight.is_some()
                || slot
                    .cached
                    .as_ref()
                    .is_some_and(|entry| entry.stored_at.elapsed() <= ttl)
        });
        let slot = slots.entry(key.to_string()).or_default();

        if let Some(entry) = &slot.cached {
            if entry.stored_at.elapsed() <= ttl && entry.fingerprint == *print {
                debug!(%key, "detection cache hit");
                return Claim::Ready(Arc::clone(&entry.detection));
            }
        }
        let Some(pending) = slot.in_flight.clone() else {
            let (tx, rx) = watch::channel(None);
            slot.in_flight = Some(rx);
            return Claim::Run(tx);
        };
        match &slot.cached {
            Some(previous) => {
                debug!(%key, "pass in flight, serving previous result");
                Claim::Ready(Arc::clone(&previous.detection))
            },
            None => Claim::Wait(pending),
        }
    }

    /// Detect on one timeframe, going through the cache.
    pub async fn detect_timeframe(&self, series: Arc<CandleSeries>) -> Result<Arc<TimeframeDetection>> {
        let key = format!("{}:{}", series.symbol(), series.timeframe());
        let print = fingerprint(&series, self.config.fingerprint_bars);

        loop {
            match self.claim(&key, &print) {
                Claim::Ready(detection) => return Ok(detection),
                Claim::Wait(mut pending) => {
                    match pending.wait_for(Option::is_some).await {
                        Ok(done) => {
                            if let Some(detection) = done.as_ref() {
                                return Ok(Arc::clone(detection));
                            }
                        },
                        // The running pass was abandoned; try to claim the key ourselves
                        Err(_) => debug!(%key, "in-flight pass abandoned"),
                    }
                },
                Claim::Run(done) => return self.run_pass(&key, series, print, done).await,
            }
        }
    }

    async fn run_pass(
        &self,
        key: &str,
        series: Arc<CandleSeries>,
        print: Fingerprint,
        done: watch::Sender<Option<Arc<TimeframeDetection>>>,
    ) -> Result<Arc<TimeframeDetection>> {
        let mut guard = InFlightGuard {
            slots: &self.slots,
            key,
            armed: true,
        };
        self.passes.fetch_add(1, Ordering::SeqCst);

        let engine = Arc::clone(&self.engine);
        let detection = tokio::task::spawn_blocking(move || detect_series(&engine, &series))
            .await
            .map_err(|e| PatternError::DetectionAborted(format!("{key}: {e}")))?;
        let detection = Arc::new(detection);

        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.cached = Some(CacheEntry {
                detection: Arc::clone(&detection),
                fingerprint: print,
                stored_at: Instant::now(),
            });
            slot.in_flight = None;
        }
        guard.armed = false;
        done.send_replace(Some(Arc::clone(&detection)));
        Ok(detection)
    }

    /// Detect on every timeframe of one symbol, confirm across timeframes,
    /// then score. Signals come back best first.
    pub async fn detect_all(
        &self,
        symbol: &str,
        candles_by_timeframe: &BTreeMap<Timeframe, FetchedSeries>,
    ) -> Result<(Vec<PatternSignal>, FreshnessSummary)> {
        if let Some(other) = candles_by_timeframe
            .values()
            .find(|f| f.series.symbol() != symbol)
        {
            return Err(PatternError::InvalidConfig(format!(
                "series for {} passed to detection of {symbol}",
                other.series.symbol()
            )));
        }

        let passes = candles_by_timeframe
            .values()
            .map(|fetched| self.detect_timeframe(Arc::clone(&fetched.series)));
        let detections = futures::future::try_join_all(passes).await?;

        let scorer = self.engine.scorer();
        let mut signals = Vec::new();
        for detection in &detections {
            for candidate in &detection.candidates {
                let direction = candidate.signal.direction;
                let confirming = detection.timeframe.higher().find(|higher| {
                    detections.iter().any(|d| {
                        d.timeframe == *higher
                            && d.candidates.iter().any(|c| c.signal.direction == direction)
                    })
                });
                let mut signal = candidate.signal.clone();
                scorer.apply(&mut signal, &candidate.confirmations.with_higher_timeframe(confirming));
                if self.engine.passes_confidence(&signal) {
                    signals.push(signal);
                }
            }
        }
        signals.sort_by(|a, b| b.confidence_score.cmp(&a.confidence_score));

        let summary = FreshnessSummary::from_metadata(candles_by_timeframe.values().map(|f| &f.metadata));
        if summary.used_fallback {
            warn!(%symbol, "detection ran on fallback data");
        }
        info!(
            %symbol,
            timeframes = detections.len(),
            signals = signals.len(),
            "detection complete"
        );
        Ok((signals, summary))
    }
}

/// Too few candles is not an error here; it just finds nothing.
fn detect_series(engine: &PatternEngine, series: &CandleSeries) -> TimeframeDetection {
    let computed_at = Utc::now();
    let mut detection = TimeframeDetection {
        symbol: series.symbol().to_string(),
        timeframe: series.timeframe(),
        candidates: Vec::new(),
        computed_at,
    };
    if series.len() < engine.min_bars() {
        debug!(
            symbol = series.symbol(),
            timeframe = %series.timeframe(),
            got = series.len(),
            need = engine.min_bars(),
            "not enough candles to detect"
        );
        return detection;
    }

    let enriched = engine.enrich(series);
    detection.candidates = engine
        .detect(series.symbol(), series.timeframe(), &enriched)
        .into_iter()
        .map(|signal| Candidate {
            confirmations: Confirmations::observe(signal.direction, &enriched),
            signal,
        })
        .collect();
    detection
}
