//! Signal persistence.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{
    backtest::BacktestResult, PatternError, PatternSignal, PatternType, Result, SignalStatus,
    Timeframe,
};

/// Query for [`SignalStore::load_recent_signals`]. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalFilter {
    pub symbol: Option<String>,
    pub pattern_type: Option<PatternType>,
    pub timeframe: Option<Timeframe>,
    pub status: Option<SignalStatus>,
    pub min_confidence: Option<u8>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for SignalFilter {
    fn default() -> Self {
        Self {
            symbol: None,
            pattern_type: None,
            timeframe: None,
            status: None,
            min_confidence: None,
            since: None,
            limit: 50,
        }
    }
}

impl SignalFilter {
    pub fn matches(&self, signal: &PatternSignal) -> bool {
        self.symbol.as_deref().map_or(true, |s| s == signal.symbol)
            && self.pattern_type.map_or(true, |p| p == signal.pattern_type())
            && self.timeframe.map_or(true, |tf| tf == signal.timeframe)
            && self.status.map_or(true, |st| st == signal.status)
            && self.min_confidence.map_or(true, |c| signal.confidence_score >= c)
            && self.since.map_or(true, |t| signal.detected_at >= t)
    }

    /// Matching signals, newest first, at most `limit`
    fn select(&self, signals: impl IntoIterator<Item = PatternSignal>) -> Vec<PatternSignal> {
        let mut found: Vec<PatternSignal> =
            signals.into_iter().filter(|s| self.matches(s)).collect();
        found.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then_with(|| a.id.cmp(&b.id)));
        found.truncate(self.limit);
        found
    }
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Insert or replace by signal id
    async fn save_signal(&self, signal: &PatternSignal) -> Result<()>;

    async fn save_backtest_result(&self, result: &BacktestResult) -> Result<()>;

    /// Newest first, at most `filter.limit`
    async fn load_recent_signals(&self, filter: &SignalFilter) -> Result<Vec<PatternSignal>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    signals: RwLock<HashMap<String, PatternSignal>>,
    results: RwLock<Vec<BacktestResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.read().len()
    }

    pub fn backtest_results(&self) -> Vec<BacktestResult> {
        self.results.read().clone()
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn save_signal(&self, signal: &PatternSignal) -> Result<()> {
        self.signals
            .write()
            .insert(signal.id.clone(), signal.clone());
        Ok(())
    }

    async fn save_backtest_result(&self, result: &BacktestResult) -> Result<()> {
        self.results.write().push(result.clone());
        Ok(())
    }

    async fn load_recent_signals(&self, filter: &SignalFilter) -> Result<Vec<PatternSignal>> {
        let signals = self.signals.read().values().cloned().collect::<Vec<_>>();
        Ok(filter.select(signals))
    }
}

// ============================================================
// JSON LINES STORE
// ============================================================

const SIGNALS_FILE: &str = "signals.jsonl";
const RESULTS_FILE: &str = "backtest_results.jsonl";

fn store_err(path: &Path, err: impl std::fmt::Display) -> PatternError {
    PatternError::Store(format!("{}: {err}", path.display()))
}

/// Appends records as JSON lines under one directory.
///
/// Signals are never rewritten in place. When loading, the last line for an
/// id wins.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| store_err(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<()> {
        let path = self.dir.join(file);
        let mut line = serde_json::to_string(record).map_err(|e| store_err(&path, e))?;
        line.push('\n');
        tokio::task::spawn_blocking(move || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| f.write_all(line.as_bytes()))
                .map_err(|e| store_err(&path, e))
        })
        .await
        .map_err(|e| PatternError::Store(format!("store writer task failed: {e}")))?
    }

    async fn read_all<T: DeserializeOwned + Send + 'static>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file);
        tokio::task::spawn_blocking(move || read_lines(&path))
            .await
            .map_err(|e| PatternError::Store(format!("store reader task failed: {e}")))?
    }

    /// Every backtest result saved so far, in save order
    pub async fn backtest_results(&self) -> Result<Vec<BacktestResult>> {
        self.read_all(RESULTS_FILE).await
    }
}

/// A missing file reads as empty
fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(store_err(path, e)),
    };
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| store_err(path, format!("line {}: {e}", n + 1)))
        })
        .collect()
}

#[async_trait]
impl SignalStore for JsonlStore {
    async fn save_signal(&self, signal: &PatternSignal) -> Result<()> {
        self.append(SIGNALS_FILE, signal).await
    }

    async fn save_backtest_result(&self, result: &BacktestResult) -> Result<()> {
        self.append(RESULTS_FILE, result).await
    }

    async fn load_recent_signals(&self, filter: &SignalFilter) -> Result<Vec<PatternSignal>> {
        let lines: Vec<PatternSignal> = self.read_all(SIGNALS_FILE).await?;
        let total = lines.len();
        let latest: HashMap<String, PatternSignal> =
            lines.into_iter().map(|s| (s.id.clone(), s)).collect();
        debug!(lines = total, signals = latest.len(), "loaded signal log");
        Ok(filter.select(latest.into_values()))
    }
}
