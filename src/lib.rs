//! # patternscope - chart pattern detection, scoring and backtesting
//!
//! Scans OHLCV series for chart-pattern geometries (flags, triangles, channel
//! breakouts, double tops and bottoms), scores every occurrence and replays it
//! against later bars to measure how well the scores hold up.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use patternscope::prelude::*;
//!
//! let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
//! let candles: Vec<Candle> = (0..60)
//!     .map(|i| {
//!         let base = 100.0 + (i as f64 * 0.3).sin();
//!         let at = start + Timeframe::H1.duration() * i;
//!         Candle::new(at, base, base + 0.5, base - 0.5, base + 0.1, 1_000)
//!     })
//!     .collect();
//! let series = CandleSeries::new("AAPL", Timeframe::H1, candles).unwrap();
//!
//! // Create engine with default detectors
//! let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
//!
//! // Every emitted signal clears the risk-reward floor
//! let signals = engine.scan(&series);
//! assert!(signals.iter().all(|s| s.risk_reward_ratio >= 2.0));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod backtest;
pub mod config;
pub mod detectors;
pub mod freshness;
pub mod indicators;
pub mod live;
pub mod orchestrator;
pub mod params;
pub mod performance;
pub mod scanner;
pub mod scoring;
pub mod source;
pub mod store;

pub use indicators::{EnrichedCandle, IndicatorValues};
pub use live::SignalStatus;

pub mod prelude {
    pub use crate::{
        // Backtesting
        backtest::{simulate, simulate_history, BacktestConfig, BacktestResult},
        // Configuration
        config::AppConfig,
        // Detectors
        detectors::*,
        // Freshness
        freshness::{
            CandleCache, DataFreshnessMetadata, DataOrigin, FixedCalendar, FreshnessPolicy,
            FreshnessSummary, MarketCalendar, MarketStatus,
        },
        indicators::{EnrichedCandle, IndicatorValues},
        // Live tracking
        live::{LiveEvent, LiveTracker, PriceUpdate, SignalStatus, StatusTransition},
        // Orchestration
        orchestrator::{DetectionOrchestrator, OrchestratorConfig, TimeframeDetection},
        // Parameters
        params::{get_period, get_ratio, ParamMeta, ParamType, ParameterizedDetector},
        // Performance
        performance::{aggregate, analyze, PerformanceMetrics, PerformanceReport},
        // Parallel
        scan_parallel,
        scanner::{ScanConfig, ScanControl, ScanReport, Scanner},
        // Scoring
        scoring::{ConfidenceScorer, Confirmations, EmaAlignment, ScoringWeights},
        // Collaborators
        source::{CandleSource, FetchError, FetchRequest, FetchedSeries, MemorySource},
        store::{MemoryStore, SignalFilter, SignalStore},
        // Engine
        BuiltinDetector,
        // Types
        Candle,
        CandleSeries,
        ChannelType,
        Direction,
        EngineBuilder,
        HistoricalSignal,
        OHLCVExt,
        // Core traits
        PatternDetector,
        PatternEngine,
        // Errors
        PatternError,
        PatternFamily,
        PatternKind,
        PatternSignal,
        PatternType,
        Period,
        Ratio,
        Result,
        ScanError,
        ScanResult,
        Timeframe,
        TradeLevels,
        OHLCV,
    };
}

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, PatternError>;

/// Errors raised by the detection, backtest and aggregation layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PatternError {
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Insufficient data: need {need} bars, got {got}")]
    InsufficientData { need: usize, got: usize },

    #[error("Invalid OHLCV at index {index}: {reason}")]
    InvalidOHLCV { index: usize, reason: &'static str },

    #[error("Candle timestamps must be strictly increasing (index {index})")]
    UnorderedSeries { index: usize },

    #[error("Invalid signal geometry: {0}")]
    InvalidSignalGeometry(String),

    #[error("Cannot aggregate an empty set of backtest results")]
    EmptyAggregationInput,

    #[error("Fetch failed: {0}")]
    Fetch(#[from] source::FetchError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Detection pass for {0} was abandoned")]
    DetectionAborted(String),
}

// ============================================================
// VALIDATED TYPES
// ============================================================

/// Normalized value in range 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Ratio(f64);

impl Ratio {
    /// Create a new Ratio, validating the value is in [0.0, 1.0]
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(PatternError::InvalidValue(
                "Ratio cannot be NaN or infinite",
            ));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(PatternError::OutOfRange {
                field: "Ratio",
                value,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl Serialize for Ratio {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Ratio {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(d)?;
        Ratio::new(value).map_err(serde::de::Error::custom)
    }
}

/// Bar count (must be > 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period(usize);

impl Period {
    pub fn new(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(PatternError::InvalidValue("Period must be > 0"));
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = usize::deserialize(d)?;
        Period::new(value).map_err(serde::de::Error::custom)
    }
}

// ============================================================
// OHLCV TRAITS
// ============================================================

/// Core OHLCV data trait
pub trait OHLCV {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
    fn volume(&self) -> f64;
}

/// Computed properties shared by every OHLCV implementor
pub trait OHLCVExt: OHLCV {
    #[inline]
    fn is_bullish(&self) -> bool {
        self.close() > self.open()
    }

    #[inline]
    fn is_bearish(&self) -> bool {
        self.close() < self.open()
    }

    /// Validate OHLCV data consistency
    fn validate(&self) -> Result<()> {
        let prices = [self.open(), self.high(), self.low(), self.close()];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(PatternError::InvalidOHLCV {
                index: 0,
                reason: "non-finite value in OHLC",
            });
        }
        if prices.iter().any(|p| *p <= 0.0) {
            return Err(PatternError::InvalidOHLCV {
                index: 0,
                reason: "prices must be positive",
            });
        }
        if self.high() < self.open().max(self.close()).max(self.low()) {
            return Err(PatternError::InvalidOHLCV {
                index: 0,
                reason: "high below open/close/low",
            });
        }
        if self.low() > self.open().min(self.close()) {
            return Err(PatternError::InvalidOHLCV {
                index: 0,
                reason: "low above open/close",
            });
        }
        if !self.volume().is_finite() || self.volume() < 0.0 {
            return Err(PatternError::InvalidOHLCV {
                index: 0,
                reason: "volume must be non-negative",
            });
        }
        Ok(())
    }
}

impl<T: OHLCV> OHLCVExt for T {}

// ============================================================
// CANDLES
// ============================================================

/// One OHLCV bar. Never mutated once part of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

impl OHLCV for Candle {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }

    fn volume(&self) -> f64 {
        self.volume as f64
    }
}

/// Bar interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// All timeframes, shortest first
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
            Timeframe::W1 => Duration::weeks(1),
        }
    }

    /// Reliability weight applied to confidence scores. Longer bars weigh more.
    pub fn weight(self) -> f64 {
        match self {
            Timeframe::M1 => 0.60,
            Timeframe::M5 => 0.65,
            Timeframe::M15 => 0.70,
            Timeframe::M30 => 0.75,
            Timeframe::H1 => 0.80,
            Timeframe::H4 => 0.85,
            Timeframe::D1 => 0.90,
            Timeframe::W1 => 0.95,
        }
    }

    /// True for bars shorter than one hour
    pub fn is_sub_hour(self) -> bool {
        self < Timeframe::H1
    }

    /// Timeframes longer than this one, shortest first
    pub fn higher(self) -> impl Iterator<Item = Timeframe> {
        Timeframe::ALL.into_iter().filter(move |tf| *tf > self)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PatternError::InvalidConfig(format!("unknown timeframe '{s}'")))
    }
}

/// Oldest-first candles for one (symbol, timeframe).
///
/// Timestamps are strictly increasing and every bar passes
/// [`OHLCVExt::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleSeries {
    symbol: String,
    timeframe: Timeframe,
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<Self> {
        for (i, candle) in candles.iter().enumerate() {
            candle.validate().map_err(|e| reindex(e, i))?;
            if i > 0 && candle.timestamp <= candles[i - 1].timestamp {
                return Err(PatternError::UnorderedSeries { index: i });
            }
        }
        Ok(Self {
            symbol: symbol.into(),
            timeframe,
            candles,
        })
    }

    pub fn empty(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            candles: Vec::new(),
        }
    }

    /// Append a bar. It must be newer than the current last bar.
    pub fn push(&mut self, candle: Candle) -> Result<()> {
        let index = self.candles.len();
        candle.validate().map_err(|e| reindex(e, index))?;
        if let Some(last) = self.candles.last() {
            if candle.timestamp <= last.timestamp {
                return Err(PatternError::UnorderedSeries { index });
            }
        }
        self.candles.push(candle);
        Ok(())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Up to `n` most recent candles
    pub fn tail(&self, n: usize) -> &[Candle] {
        &self.candles[self.candles.len().saturating_sub(n)..]
    }
}

fn reindex(err: PatternError, index: usize) -> PatternError {
    match err {
        PatternError::InvalidOHLCV { reason, .. } => PatternError::InvalidOHLCV { index, reason },
        other => other,
    }
}

// ============================================================
// PATTERN TYPES
// ============================================================

/// Direction/bias of a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    #[inline]
    pub fn is_bullish(self) -> bool {
        matches!(self, Direction::Bullish)
    }

    #[inline]
    pub fn is_bearish(self) -> bool {
        matches!(self, Direction::Bearish)
    }

    /// +1 for bullish, -1 for bearish
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
        }
    }

    /// Price a bar reached against this direction: the low for longs, the high for shorts.
    #[inline]
    pub fn adverse_extreme(self, high: f64, low: f64) -> f64 {
        match self {
            Direction::Bullish => low,
            Direction::Bearish => high,
        }
    }

    #[inline]
    pub fn favorable_extreme(self, high: f64, low: f64) -> f64 {
        match self {
            Direction::Bullish => high,
            Direction::Bearish => low,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
        })
    }
}

/// Boundary geometry of a broken channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Horizontal,
    Ascending,
    Descending,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Horizontal => "horizontal",
            ChannelType::Ascending => "ascending",
            ChannelType::Descending => "descending",
        }
    }
}

/// Data-free pattern discriminant used for grouping and filters.
///
/// Serialized as its [`as_str`](PatternType::as_str) name, e.g.
/// `"channel_breakout_horizontal"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatternType {
    BullFlag,
    BearFlag,
    AscendingTriangle,
    DescendingTriangle,
    ChannelBreakout(ChannelType),
    DoubleTop,
    DoubleBottom,
}

/// Detector family. Scoring bases and volume thresholds are set per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternFamily {
    Flag,
    Triangle,
    Breakout,
    DoubleExtreme,
}

impl PatternType {
    pub const ALL: [PatternType; 9] = [
        PatternType::BullFlag,
        PatternType::BearFlag,
        PatternType::AscendingTriangle,
        PatternType::DescendingTriangle,
        PatternType::ChannelBreakout(ChannelType::Horizontal),
        PatternType::ChannelBreakout(ChannelType::Ascending),
        PatternType::ChannelBreakout(ChannelType::Descending),
        PatternType::DoubleTop,
        PatternType::DoubleBottom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PatternType::BullFlag => "bull_flag",
            PatternType::BearFlag => "bear_flag",
            PatternType::AscendingTriangle => "ascending_triangle",
            PatternType::DescendingTriangle => "descending_triangle",
            PatternType::ChannelBreakout(ChannelType::Horizontal) => "channel_breakout_horizontal",
            PatternType::ChannelBreakout(ChannelType::Ascending) => "channel_breakout_ascending",
            PatternType::ChannelBreakout(ChannelType::Descending) => "channel_breakout_descending",
            PatternType::DoubleTop => "double_top",
            PatternType::DoubleBottom => "double_bottom",
        }
    }

    pub fn family(self) -> PatternFamily {
        match self {
            PatternType::BullFlag | PatternType::BearFlag => PatternFamily::Flag,
            PatternType::AscendingTriangle | PatternType::DescendingTriangle => {
                PatternFamily::Triangle
            }
            PatternType::ChannelBreakout(_) => PatternFamily::Breakout,
            PatternType::DoubleTop | PatternType::DoubleBottom => PatternFamily::DoubleExtreme,
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self> {
        PatternType::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| PatternError::InvalidConfig(format!("unknown pattern type '{s}'")))
    }
}

impl Serialize for PatternType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PatternType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// A detected pattern with the measurements its detector took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternKind {
    BullFlag(detectors::FlagStats),
    BearFlag(detectors::FlagStats),
    AscendingTriangle(detectors::TriangleStats),
    DescendingTriangle(detectors::TriangleStats),
    ChannelBreakout(detectors::ChannelStats),
    DoubleTop(detectors::DoubleStats),
    DoubleBottom(detectors::DoubleStats),
}

impl PatternKind {
    pub fn pattern_type(&self) -> PatternType {
        match self {
            PatternKind::BullFlag(_) => PatternType::BullFlag,
            PatternKind::BearFlag(_) => PatternType::BearFlag,
            PatternKind::AscendingTriangle(_) => PatternType::AscendingTriangle,
            PatternKind::DescendingTriangle(_) => PatternType::DescendingTriangle,
            PatternKind::ChannelBreakout(stats) => PatternType::ChannelBreakout(stats.breakout_type),
            PatternKind::DoubleTop(_) => PatternType::DoubleTop,
            PatternKind::DoubleBottom(_) => PatternType::DoubleBottom,
        }
    }

    /// Recent volume relative to the window the detector compared it against
    pub fn volume_ratio(&self) -> f64 {
        match self {
            PatternKind::BullFlag(s) | PatternKind::BearFlag(s) => s.pole_volume_ratio,
            PatternKind::AscendingTriangle(s) | PatternKind::DescendingTriangle(s) => {
                s.volume_ratio
            }
            PatternKind::ChannelBreakout(s) => s.volume_ratio,
            PatternKind::DoubleTop(s) | PatternKind::DoubleBottom(s) => s.volume_ratio,
        }
    }
}

/// Entry, target and stop of a trade setup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeLevels {
    pub entry: f64,
    pub target: f64,
    pub stop: f64,
}

impl TradeLevels {
    /// Check ordering for `direction` and return the risk-reward ratio.
    pub fn validate(&self, direction: Direction) -> Result<f64> {
        let TradeLevels {
            entry,
            target,
            stop,
        } = *self;
        if ![entry, target, stop].iter().all(|v| v.is_finite() && *v > 0.0) {
            return Err(PatternError::InvalidSignalGeometry(format!(
                "non-finite or non-positive level (entry {entry}, target {target}, stop {stop})"
            )));
        }
        let ordered = match direction {
            Direction::Bullish => stop < entry && entry < target,
            Direction::Bearish => target < entry && entry < stop,
        };
        if !ordered {
            return Err(PatternError::InvalidSignalGeometry(format!(
                "{direction} levels inverted (entry {entry}, target {target}, stop {stop})"
            )));
        }
        Ok(self.risk_reward_ratio())
    }

    pub fn risk_reward_ratio(&self) -> f64 {
        (self.target - self.entry).abs() / (self.entry - self.stop).abs()
    }

    pub fn potential_profit_pct(&self) -> f64 {
        (self.target - self.entry).abs() / self.entry * 100.0
    }
}

/// One detected pattern occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSignal {
    pub id: String,
    pub symbol: String,
    pub pattern: PatternKind,
    pub direction: Direction,
    pub timeframe: Timeframe,
    pub entry_price: f64,
    pub target_price: f64,
    pub stop_loss: f64,
    pub risk_reward_ratio: f64,
    pub potential_profit_pct: f64,
    /// 0..=100, set by [`scoring::ConfidenceScorer`]
    pub confidence_score: u8,
    pub multi_timeframe_confirmed: bool,
    pub confirming_timeframe: Option<Timeframe>,
    pub detected_at: DateTime<Utc>,
    /// Candles the detector looked at
    pub window: Vec<Candle>,
    pub status: SignalStatus,
}

impl PatternSignal {
    /// Build an unscored signal. Fails on invalid geometry.
    pub fn new(
        symbol: &str,
        timeframe: Timeframe,
        pattern: PatternKind,
        direction: Direction,
        levels: TradeLevels,
        window: &[EnrichedCandle],
    ) -> Result<Self> {
        let risk_reward_ratio = levels.validate(direction)?;
        let last = window
            .last()
            .ok_or(PatternError::InsufficientData { need: 1, got: 0 })?;
        let detected_at = last.candle.timestamp;
        let pattern_type = pattern.pattern_type();
        Ok(Self {
            id: format!(
                "{symbol}-{pattern_type}-{timeframe}-{}",
                detected_at.timestamp_millis()
            ),
            symbol: symbol.to_string(),
            pattern,
            direction,
            timeframe,
            entry_price: levels.entry,
            target_price: levels.target,
            stop_loss: levels.stop,
            risk_reward_ratio,
            potential_profit_pct: levels.potential_profit_pct(),
            confidence_score: 0,
            multi_timeframe_confirmed: false,
            confirming_timeframe: None,
            detected_at,
            window: window.iter().map(|c| c.candle).collect(),
            status: SignalStatus::Active,
        })
    }

    pub fn pattern_type(&self) -> PatternType {
        self.pattern.pattern_type()
    }

    pub fn levels(&self) -> TradeLevels {
        TradeLevels {
            entry: self.entry_price,
            target: self.target_price,
            stop: self.stop_loss,
        }
    }
}

// ============================================================
// PATTERN DETECTOR TRAIT
// ============================================================

/// Stateless chart-pattern detector.
///
/// `detect` looks at the window ending at the last candle and returns every
/// qualifying occurrence, unscored. Too little data is an empty result.
pub trait PatternDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn min_bars(&self) -> usize {
        detectors::MIN_DETECTION_BARS
    }

    fn detect(
        &self,
        symbol: &str,
        candles: &[EnrichedCandle],
        timeframe: Timeframe,
    ) -> Vec<PatternSignal>;

    fn validate_config(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================
// BUILTIN DETECTORS - generated via macro
// ============================================================

use detectors::*;

/// Macro to generate BuiltinDetector enum without boilerplate
macro_rules! define_builtin_detectors {
    (
        $(
            $variant:ident($detector:ty)
        ),* $(,)?
    ) => {
        /// All builtin detectors - fast path via enum dispatch
        #[derive(Debug, Clone)]
        pub enum BuiltinDetector {
            $($variant($detector)),*
        }

        impl BuiltinDetector {
            #[inline]
            pub fn detect(
                &self,
                symbol: &str,
                candles: &[EnrichedCandle],
                timeframe: Timeframe,
            ) -> Vec<PatternSignal> {
                match self {
                    $(Self::$variant(d) => PatternDetector::detect(d, symbol, candles, timeframe)),*
                }
            }

            #[inline]
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant(d) => PatternDetector::name(d)),*
                }
            }

            #[inline]
            pub fn min_bars(&self) -> usize {
                match self {
                    $(Self::$variant(d) => PatternDetector::min_bars(d)),*
                }
            }

            pub fn validate_config(&self) -> Result<()> {
                match self {
                    $(Self::$variant(d) => PatternDetector::validate_config(d)),*
                }
            }
        }
    };
}

define_builtin_detectors! {
    BullFlag(FlagDetector),
    BearFlag(FlagDetector),
    AscendingTriangle(TriangleDetector),
    DescendingTriangle(TriangleDetector),
    ChannelBreakout(ChannelBreakoutDetector),
    DoubleTop(DoubleExtremeDetector),
    DoubleBottom(DoubleExtremeDetector),
}

impl BuiltinDetector {
    /// Replace this detector's thresholds from a `{detector_key: {param: value}}` map.
    fn apply_overrides(&mut self, overrides: &HashMap<String, HashMap<String, f64>>) -> Result<()> {
        use params::ParameterizedDetector;

        fn lookup<P: ParameterizedDetector>(
            overrides: &HashMap<String, HashMap<String, f64>>,
        ) -> Option<HashMap<&str, f64>> {
            overrides
                .get(P::detector_key())
                .map(|p| p.iter().map(|(k, v)| (k.as_str(), *v)).collect())
        }

        match self {
            Self::BullFlag(d) | Self::BearFlag(d) => {
                if let Some(p) = lookup::<FlagConfig>(overrides) {
                    d.config = FlagConfig::with_params(&p)?;
                }
            }
            Self::AscendingTriangle(d) | Self::DescendingTriangle(d) => {
                if let Some(p) = lookup::<TriangleConfig>(overrides) {
                    d.config = TriangleConfig::with_params(&p)?;
                }
            }
            Self::ChannelBreakout(d) => {
                if let Some(p) = lookup::<ChannelConfig>(overrides) {
                    d.config = ChannelConfig::with_params(&p)?;
                }
            }
            Self::DoubleTop(d) | Self::DoubleBottom(d) => {
                if let Some(p) = lookup::<DoubleConfig>(overrides) {
                    d.config = DoubleConfig::with_params(&p)?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================
// PATTERN ENGINE
// ============================================================

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub min_confidence: Option<u8>,
    pub pattern_filter: Option<Vec<PatternType>>,
}

/// Signal found while walking a series forward, with the index of the bar it
/// was detected on.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalSignal {
    pub index: usize,
    pub signal: PatternSignal,
}

/// Runs detectors over enriched candles and scores what they find
pub struct PatternEngine {
    builtin: Vec<BuiltinDetector>,
    custom: Vec<Box<dyn PatternDetector>>,
    scorer: scoring::ConfidenceScorer,
    config: EngineConfig,
}

impl PatternEngine {
    pub fn scorer(&self) -> &scoring::ConfidenceScorer {
        &self.scorer
    }

    pub fn detector_count(&self) -> usize {
        self.builtin.len() + self.custom.len()
    }

    /// Fewest candles any registered detector can work with
    pub fn min_bars(&self) -> usize {
        self.builtin
            .iter()
            .map(BuiltinDetector::min_bars)
            .chain(self.custom.iter().map(|d| d.min_bars()))
            .min()
            .unwrap_or(MIN_DETECTION_BARS)
    }

    #[inline]
    pub fn enrich(&self, series: &CandleSeries) -> Vec<EnrichedCandle> {
        indicators::compute(series.candles())
    }

    /// Fan the window out to every detector and merge once all are done.
    /// Signals come back unscored.
    pub fn detect(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[EnrichedCandle],
    ) -> Vec<PatternSignal> {
        let mut signals: Vec<PatternSignal> = self
            .builtin
            .par_iter()
            .filter(|d| candles.len() >= d.min_bars())
            .flat_map_iter(|d| d.detect(symbol, candles, timeframe))
            .collect();

        if !self.custom.is_empty() {
            let custom: Vec<PatternSignal> = self
                .custom
                .par_iter()
                .filter(|d| candles.len() >= d.min_bars())
                .flat_map_iter(|d| d.detect(symbol, candles, timeframe))
                .collect();
            signals.extend(custom);
        }

        signals.retain(|s| self.matches_filter(s));
        signals
    }

    /// Detect on the latest window of `series` and score each signal from
    /// that series alone (no multi-timeframe input).
    pub fn scan(&self, series: &CandleSeries) -> Vec<PatternSignal> {
        let enriched = self.enrich(series);
        let mut signals = self.detect(series.symbol(), series.timeframe(), &enriched);
        for signal in &mut signals {
            let confirmations = scoring::Confirmations::observe(signal.direction, &enriched);
            self.scorer.apply(signal, &confirmations);
        }
        signals.retain(|s| self.passes_confidence(s));
        signals.sort_by(|a, b| b.confidence_score.cmp(&a.confidence_score));
        signals
    }

    /// Walk `series` bar by bar and collect the signals each prefix produces.
    ///
    /// A signal is dropped when the previous kept signal of the same pattern
    /// type is still inside its window, so one formation yields one trade.
    pub fn scan_history(&self, series: &CandleSeries) -> Vec<HistoricalSignal> {
        let enriched = self.enrich(series);
        let first_end = self.min_bars();
        if enriched.len() < first_end {
            return Vec::new();
        }

        let per_bar: Vec<Vec<HistoricalSignal>> = (first_end..=enriched.len())
            .into_par_iter()
            .map(|end| {
                let prefix = &enriched[..end];
                self.detect(series.symbol(), series.timeframe(), prefix)
                    .into_iter()
                    .map(|mut signal| {
                        let confirmations =
                            scoring::Confirmations::observe(signal.direction, prefix);
                        self.scorer.apply(&mut signal, &confirmations);
                        HistoricalSignal {
                            index: end - 1,
                            signal,
                        }
                    })
                    .filter(|h| self.passes_confidence(&h.signal))
                    .collect()
            })
            .collect();

        let mut last_kept: HashMap<PatternType, usize> = HashMap::new();
        let mut kept = Vec::new();
        for hist in per_bar.into_iter().flatten() {
            let pattern_type = hist.signal.pattern_type();
            let span = hist.signal.window.len().max(1);
            if let Some(&prev) = last_kept.get(&pattern_type) {
                if hist.index < prev + span {
                    continue;
                }
            }
            last_kept.insert(pattern_type, hist.index);
            kept.push(hist);
        }
        kept
    }

    fn matches_filter(&self, signal: &PatternSignal) -> bool {
        match self.config.pattern_filter {
            Some(ref filter) => filter.contains(&signal.pattern_type()),
            None => true,
        }
    }

    pub(crate) fn passes_confidence(&self, signal: &PatternSignal) -> bool {
        match self.config.min_confidence {
            Some(min) => signal.confidence_score >= min,
            None => true,
        }
    }

    fn validate(&self) -> Result<()> {
        for d in &self.builtin {
            d.validate_config()?;
        }
        for d in &self.custom {
            d.validate_config()?;
        }
        self.scorer.weights().validate()
    }
}

// ============================================================
// BUILDER
// ============================================================

/// Builder for creating PatternEngine instances
pub struct EngineBuilder {
    builtin: Vec<BuiltinDetector>,
    custom: Vec<Box<dyn PatternDetector>>,
    weights: scoring::ScoringWeights,
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            builtin: Vec::new(),
            custom: Vec::new(),
            weights: scoring::ScoringWeights::default(),
            config: EngineConfig::default(),
        }
    }

    /// Add every builtin detector with default thresholds
    pub fn with_all_defaults(self) -> Self {
        self.with_flag_defaults()
            .with_triangle_defaults()
            .with_channel_defaults()
            .with_double_defaults()
    }

    pub fn with_flag_defaults(mut self) -> Self {
        self.builtin.extend([
            BuiltinDetector::BullFlag(FlagDetector::bull()),
            BuiltinDetector::BearFlag(FlagDetector::bear()),
        ]);
        self
    }

    pub fn with_triangle_defaults(mut self) -> Self {
        self.builtin.extend([
            BuiltinDetector::AscendingTriangle(TriangleDetector::ascending()),
            BuiltinDetector::DescendingTriangle(TriangleDetector::descending()),
        ]);
        self
    }

    pub fn with_channel_defaults(mut self) -> Self {
        self.builtin.push(BuiltinDetector::ChannelBreakout(
            ChannelBreakoutDetector::default(),
        ));
        self
    }

    pub fn with_double_defaults(mut self) -> Self {
        self.builtin.extend([
            BuiltinDetector::DoubleTop(DoubleExtremeDetector::top()),
            BuiltinDetector::DoubleBottom(DoubleExtremeDetector::bottom()),
        ]);
        self
    }

    /// Add a builtin detector
    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, detector: BuiltinDetector) -> Self {
        self.builtin.push(detector);
        self
    }

    /// Add with config validation
    pub fn add_checked(mut self, detector: BuiltinDetector) -> Result<Self> {
        detector.validate_config()?;
        self.builtin.push(detector);
        Ok(self)
    }

    /// Add a custom detector (vtable dispatch)
    pub fn add_custom<D: PatternDetector + 'static>(mut self, detector: D) -> Self {
        self.custom.push(Box::new(detector));
        self
    }

    pub fn scoring(mut self, weights: scoring::ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Drop scored signals below this confidence
    pub fn min_confidence(mut self, score: u8) -> Self {
        self.config.min_confidence = Some(score);
        self
    }

    /// Filter to specific patterns only
    pub fn only_patterns(mut self, patterns: impl IntoIterator<Item = PatternType>) -> Self {
        self.config.pattern_filter = Some(patterns.into_iter().collect());
        self
    }

    /// Apply per-detector parameter overrides keyed by
    /// [`ParameterizedDetector::detector_key`](params::ParameterizedDetector::detector_key).
    pub fn with_param_overrides(
        mut self,
        overrides: &HashMap<String, HashMap<String, f64>>,
    ) -> Result<Self> {
        let known = [
            <FlagConfig as params::ParameterizedDetector>::detector_key(),
            <TriangleConfig as params::ParameterizedDetector>::detector_key(),
            <ChannelConfig as params::ParameterizedDetector>::detector_key(),
            <DoubleConfig as params::ParameterizedDetector>::detector_key(),
        ];
        if let Some(unknown) = overrides.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(PatternError::InvalidConfig(format!(
                "unknown detector '{unknown}'"
            )));
        }
        for detector in &mut self.builtin {
            detector.apply_overrides(overrides)?;
        }
        Ok(self)
    }

    /// Build the engine
    pub fn build(self) -> Result<PatternEngine> {
        let engine = PatternEngine {
            builtin: self.builtin,
            custom: self.custom,
            scorer: scoring::ConfidenceScorer::new(self.weights),
            config: self.config,
        };
        engine.validate()?;
        Ok(engine)
    }
}

// ============================================================
// PARALLEL SCANNING
// ============================================================

use rayon::prelude::*;

/// Result of scanning a single instrument
#[derive(Debug)]
pub struct ScanResult {
    pub symbol: String,
    pub signals: Vec<PatternSignal>,
}

/// Error from scanning a single instrument
#[derive(Debug)]
pub struct ScanError {
    pub symbol: String,
    pub error: PatternError,
}

/// Parallel scanning of multiple instruments' raw candles
pub fn scan_parallel<'a, I>(engine: &PatternEngine, instruments: I) -> (Vec<ScanResult>, Vec<ScanError>)
where
    I: IntoParallelIterator<Item = (&'a str, Timeframe, &'a [Candle])>,
{
    let results: Vec<_> = instruments
        .into_par_iter()
        .map(|(symbol, timeframe, bars)| {
            CandleSeries::new(symbol, timeframe, bars.to_vec())
                .map(|series| ScanResult {
                    symbol: symbol.to_string(),
                    signals: engine.scan(&series),
                })
                .map_err(|error| ScanError {
                    symbol: symbol.to_string(),
                    error,
                })
        })
        .collect();

    let mut successes = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(r) => successes.push(r),
            Err(e) => errors.push(e),
        }
    }

    (successes, errors)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(i)
    }

    fn flat_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle::new(at(i as i64), 100.0, 101.0, 99.0, 100.5, 1_000))
            .collect()
    }

    #[test]
    fn test_ratio_validation() {
        assert!(Ratio::new(0.0).is_ok());
        assert!(Ratio::new(1.0).is_ok());
        assert!(Ratio::new(-0.1).is_err());
        assert!(Ratio::new(1.1).is_err());
        assert!(Ratio::new(f64::NAN).is_err());
    }

    #[test]
    fn test_period_validation() {
        assert!(Period::new(1).is_ok());
        assert!(Period::new(0).is_err());
    }

    #[test]
    fn test_series_rejects_duplicate_timestamps() {
        let mut candles = flat_candles(3);
        candles[2].timestamp = candles[1].timestamp;
        let err = CandleSeries::new("AAPL", Timeframe::H1, candles).unwrap_err();
        assert!(matches!(err, PatternError::UnorderedSeries { index: 2 }));
    }

    #[test]
    fn test_series_rejects_inconsistent_bar() {
        let mut candles = flat_candles(4);
        candles[3].high = 99.5;
        let err = CandleSeries::new("AAPL", Timeframe::H1, candles).unwrap_err();
        assert!(matches!(err, PatternError::InvalidOHLCV { index: 3, .. }));
    }

    #[test]
    fn test_series_push_requires_newer_bar() {
        let mut series = CandleSeries::new("AAPL", Timeframe::H1, flat_candles(2)).unwrap();
        let stale = Candle::new(at(0), 100.0, 101.0, 99.0, 100.0, 10);
        assert!(series.push(stale).is_err());
        let fresh = Candle::new(at(5), 100.0, 101.0, 99.0, 100.0, 10);
        assert!(series.push(fresh).is_ok());
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn test_timeframe_parse_and_weight() {
        assert_eq!("4h".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert!("2h".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::M1.weight(), 0.60);
        assert_eq!(Timeframe::W1.weight(), 0.95);
        assert!(Timeframe::M30.is_sub_hour());
        assert!(!Timeframe::H1.is_sub_hour());
    }

    #[test]
    fn test_pattern_type_round_trip_names() {
        for pattern in PatternType::ALL {
            assert_eq!(pattern.as_str().parse::<PatternType>().unwrap(), pattern);
        }
    }

    #[test]
    fn test_trade_levels_geometry() {
        let long = TradeLevels {
            entry: 100.0,
            target: 120.0,
            stop: 90.0,
        };
        assert!((long.validate(Direction::Bullish).unwrap() - 2.0).abs() < 1e-12);
        assert!(long.validate(Direction::Bearish).is_err());

        let broken = TradeLevels {
            entry: 100.0,
            target: f64::NAN,
            stop: 90.0,
        };
        assert!(matches!(
            broken.validate(Direction::Bullish),
            Err(PatternError::InvalidSignalGeometry(_))
        ));
    }

    #[test]
    fn test_engine_builder() {
        let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
        assert_eq!(engine.detector_count(), 7);
    }

    #[test]
    fn test_short_series_yields_nothing() {
        let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
        let series = CandleSeries::new("AAPL", Timeframe::H1, flat_candles(10)).unwrap();
        assert!(engine.scan(&series).is_empty());
        assert!(engine.scan_history(&series).is_empty());
    }

    #[test]
    fn test_unknown_override_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("pennant".to_string(), HashMap::new());
        let result = EngineBuilder::new()
            .with_all_defaults()
            .with_param_overrides(&overrides);
        assert!(matches!(result, Err(PatternError::InvalidConfig(_))));
    }

    #[test]
    fn test_param_override_applied() {
        let mut flag = HashMap::new();
        flag.insert("min_pole_move".to_string(), 0.08);
        let mut overrides = HashMap::new();
        overrides.insert("flag".to_string(), flag);
        let builder = EngineBuilder::new()
            .with_flag_defaults()
            .with_param_overrides(&overrides)
            .unwrap();
        match &builder.builtin[0] {
            BuiltinDetector::BullFlag(d) => {
                assert!((d.config.min_pole_move.get() - 0.08).abs() < f64::EPSILON)
            }
            other => panic!("unexpected detector {}", other.name()),
        }
    }

    #[test]
    fn test_parallel_scan_reports_bad_input() {
        let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
        let good = flat_candles(30);
        let mut bad = flat_candles(30);
        bad.swap(3, 4);

        let instruments: Vec<(&str, Timeframe, &[Candle])> = vec![
            ("AAPL", Timeframe::H1, &good),
            ("MSFT", Timeframe::H1, &bad),
        ];
        let (results, errors) = scan_parallel(&engine, instruments);
        assert_eq!(results.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].symbol, "MSFT");
    }
}
