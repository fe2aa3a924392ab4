//! Market data collaborators.
//!
//! A [`CandleSource`] hands back ordered candles plus freshness metadata. It
//! must tell "nothing there" ([`FetchError::NoData`]) apart from "could not
//! reach it" ([`FetchError::Transient`], [`FetchError::Timeout`]), because only
//! the latter may be papered over with stale cached data.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::debug;

use crate::{
    freshness::{DataFreshnessMetadata, DataOrigin},
    Candle, CandleSeries, Timeframe,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The source answered, and there is nothing for this request
    #[error("no data for {symbol} {timeframe}")]
    NoData { symbol: String, timeframe: Timeframe },

    #[error("transient fetch failure: {0}")]
    Transient(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed data: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether a stale cached copy may stand in for the failed fetch
    pub fn allows_fallback(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Most recent candles to return
    pub limit: usize,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl FetchRequest {
    pub fn latest(symbol: impl Into<String>, timeframe: Timeframe, limit: usize) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            limit,
            from: None,
            to: None,
        }
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Cache key, `"{symbol}:{timeframe}"`
    pub fn key(&self) -> String {
        format!("{}:{}", self.symbol, self.timeframe)
    }

    /// Apply the range and limit to an oldest-first slice
    fn select<'a>(&self, candles: &'a [Candle]) -> &'a [Candle] {
        let start = self
            .from
            .map_or(0, |from| candles.partition_point(|c| c.timestamp < from));
        let end = self
            .to
            .map_or(candles.len(), |to| candles.partition_point(|c| c.timestamp <= to));
        let in_range = &candles[start..end.max(start)];
        &in_range[in_range.len().saturating_sub(self.limit)..]
    }
}

/// A series together with where it came from and how fresh it is
#[derive(Debug, Clone)]
pub struct FetchedSeries {
    pub series: Arc<CandleSeries>,
    pub metadata: DataFreshnessMetadata,
}

impl FetchedSeries {
    /// Wrap a series fetched straight from the source at `fetched_at`
    pub fn from_series(series: CandleSeries, fetched_at: DateTime<Utc>) -> Self {
        let timeframe = series.timeframe();
        Self {
            series: Arc::new(series),
            metadata: DataFreshnessMetadata::new(DataOrigin::Api, timeframe, fetched_at),
        }
    }
}

#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(&self, request: &FetchRequest) -> Result<FetchedSeries, FetchError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

fn slice_to_series(
    request: &FetchRequest,
    candles: &[Candle],
) -> Result<CandleSeries, FetchError> {
    let selected = request.select(candles);
    if selected.is_empty() {
        return Err(FetchError::NoData {
            symbol: request.symbol.clone(),
            timeframe: request.timeframe,
        });
    }
    CandleSeries::new(request.symbol.clone(), request.timeframe, selected.to_vec())
        .map_err(|e| FetchError::Malformed(e.to_string()))
}

// ============================================================
// IN-MEMORY SOURCE
// ============================================================

/// Serves preloaded series. Failures and latency can be scripted per key.
#[derive(Default)]
pub struct MemorySource {
    series: RwLock<HashMap<String, Vec<Candle>>>,
    failures: Mutex<HashMap<String, Vec<FetchError>>>,
    latency: Option<Duration>,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering each fetch
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, series: CandleSeries) {
        let key = format!("{}:{}", series.symbol(), series.timeframe());
        self.series.write().insert(key, series.candles().to_vec());
    }

    /// Make the next fetch for `symbol`/`timeframe` fail with `error`.
    /// Queued failures are consumed in order.
    pub fn fail_next(&self, symbol: &str, timeframe: Timeframe, error: FetchError) {
        self.failures
            .lock()
            .entry(format!("{symbol}:{timeframe}"))
            .or_default()
            .push(error);
    }

    /// Fetches answered so far, failures included
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandleSource for MemorySource {
    async fn fetch_candles(&self, request: &FetchRequest) -> Result<FetchedSeries, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let key = request.key();
        let scripted = {
            let mut failures = self.failures.lock();
            failures
                .get_mut(&key)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };
        if let Some(error) = scripted {
            return Err(error);
        }

        let series = {
            let stored = self.series.read();
            let candles = stored.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            slice_to_series(request, candles)?
        };
        Ok(FetchedSeries::from_series(series, Utc::now()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================
// CSV DIRECTORY SOURCE
// ============================================================

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// RFC 3339 or epoch milliseconds
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Reads `{dir}/{SYMBOL}_{timeframe}.csv` with a
/// `timestamp,open,high,low,close,volume` header.
#[derive(Debug, Clone)]
pub struct CsvDirSource {
    dir: PathBuf,
}

impl CsvDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", symbol.to_uppercase(), timeframe))
    }

    fn read(path: PathBuf) -> Result<Vec<Candle>, FetchError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(&path)
            .map_err(|e| FetchError::Transient(format!("{}: {e}", path.display())))?;

        let mut candles = Vec::new();
        for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
            let row = row.map_err(|e| FetchError::Malformed(format!("row {line}: {e}")))?;
            let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| {
                FetchError::Malformed(format!("row {line}: bad timestamp '{}'", row.timestamp))
            })?;
            if !(row.volume.is_finite() && row.volume >= 0.0) {
                return Err(FetchError::Malformed(format!("row {line}: bad volume")));
            }
            candles.push(Candle::new(
                timestamp,
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume.round() as u64,
            ));
        }
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

#[async_trait]
impl CandleSource for CsvDirSource {
    async fn fetch_candles(&self, request: &FetchRequest) -> Result<FetchedSeries, FetchError> {
        let path = self.path_for(&request.symbol, request.timeframe);
        if !path.exists() {
            return Err(FetchError::NoData {
                symbol: request.symbol.clone(),
                timeframe: request.timeframe,
            });
        }
        debug!(path = %path.display(), "reading candles");
        let candles = tokio::task::spawn_blocking(move || Self::read(path))
            .await
            .map_err(|e| FetchError::Transient(format!("csv reader task failed: {e}")))??;
        let series = slice_to_series(request, &candles)?;
        Ok(FetchedSeries::from_series(series, Utc::now()))
    }

    fn name(&self) -> &'static str {
        "csv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn series(n: i64) -> CandleSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = (0..n)
            .map(|i| {
                let p = 100.0 + i as f64;
                Candle::new(start + ChronoDuration::days(i), p, p + 1.0, p - 1.0, p, 10)
            })
            .collect();
        CandleSeries::new("SPY", Timeframe::D1, candles).unwrap()
    }

    #[tokio::test]
    async fn test_limit_and_range() {
        let source = MemorySource::new();
        source.insert(series(10));

        let latest = source
            .fetch_candles(&FetchRequest::latest("SPY", Timeframe::D1, 3))
            .await
            .unwrap();
        assert_eq!(latest.series.len(), 3);
        assert_eq!(latest.series.last().unwrap().close, 109.0);

        let from = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let ranged = source
            .fetch_candles(&FetchRequest::latest("SPY", Timeframe::D1, 100).between(Some(from), Some(to)))
            .await
            .unwrap();
        assert_eq!(ranged.series.len(), 3);
        assert_eq!(ranged.metadata.source, DataOrigin::Api);
    }

    #[tokio::test]
    async fn test_no_data_vs_scripted_failure() {
        let source = MemorySource::new();
        let req = FetchRequest::latest("QQQ", Timeframe::H1, 10);
        let err = source.fetch_candles(&req).await.unwrap_err();
        assert!(matches!(err, FetchError::NoData { .. }));
        assert!(!err.allows_fallback());

        source.fail_next("QQQ", Timeframe::H1, FetchError::Transient("503".into()));
        let err = source.fetch_candles(&req).await.unwrap_err();
        assert!(err.allows_fallback());
        assert_eq!(source.fetch_count(), 2);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_timestamp("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(
            parse_timestamp(&expected.timestamp_millis().to_string()),
            Some(expected)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
