//! Freshness policy and the candle cache built on it.
//!
//! How long fetched candles stay usable depends on the market session and the
//! timeframe. [`CandleCache`] serves cached series while they are fresh and
//! falls back to stale ones only when the source fails transiently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    source::{CandleSource, FetchError, FetchRequest, FetchedSeries},
    Timeframe,
};

// ============================================================
// MARKET SESSION
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    PreMarket,
    AfterHours,
    #[default]
    Closed,
}

impl MarketStatus {
    pub fn is_extended_hours(self) -> bool {
        matches!(self, MarketStatus::PreMarket | MarketStatus::AfterHours)
    }
}

pub trait MarketCalendar: Send + Sync {
    fn status_at(&self, at: DateTime<Utc>) -> MarketStatus;
}

/// Reports the same session at every instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedCalendar(pub MarketStatus);

impl MarketCalendar for FixedCalendar {
    fn status_at(&self, _at: DateTime<Utc>) -> MarketStatus {
        self.0
    }
}

impl<F> MarketCalendar for F
where
    F: Fn(DateTime<Utc>) -> MarketStatus + Send + Sync,
{
    fn status_at(&self, at: DateTime<Utc>) -> MarketStatus {
        self(at)
    }
}

// ============================================================
// METADATA
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    Api,
    Cache,
    CacheFallback,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFreshnessMetadata {
    pub fetched_at: DateTime<Utc>,
    pub is_delayed: bool,
    pub source: DataOrigin,
    pub timeframe: Timeframe,
    pub market_status: MarketStatus,
    /// Seconds between the fetch and when this metadata was last stamped
    pub data_age_secs: i64,
    pub valid_until: DateTime<Utc>,
}

impl DataFreshnessMetadata {
    /// Metadata for a fetch that just happened. Session and validity are
    /// filled in by [`FreshnessPolicy::stamp`].
    pub fn new(source: DataOrigin, timeframe: Timeframe, fetched_at: DateTime<Utc>) -> Self {
        Self {
            fetched_at,
            is_delayed: false,
            source,
            timeframe,
            market_status: MarketStatus::default(),
            data_age_secs: 0,
            valid_until: fetched_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }
}

/// Freshness of the inputs to one multi-timeframe detection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FreshnessSummary {
    pub timeframes: Vec<DataFreshnessMetadata>,
    pub oldest_fetch: Option<DateTime<Utc>>,
    /// Any input was delayed or came from a fallback
    pub is_delayed: bool,
    pub used_fallback: bool,
}

impl FreshnessSummary {
    pub fn from_metadata<'a>(entries: impl IntoIterator<Item = &'a DataFreshnessMetadata>) -> Self {
        let mut summary = Self::default();
        for meta in entries {
            summary.is_delayed |= meta.is_delayed;
            summary.used_fallback |= meta.source == DataOrigin::CacheFallback;
            summary.oldest_fetch = Some(match summary.oldest_fetch {
                Some(oldest) => oldest.min(meta.fetched_at),
                None => meta.fetched_at,
            });
            summary.timeframes.push(meta.clone());
        }
        summary
    }
}

// ============================================================
// POLICY
// ============================================================

/// Staleness thresholds in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessThresholds {
    pub open_sub_hour: u64,
    pub open_intraday: u64,
    pub open_daily: u64,
    pub extended_sub_hour: u64,
    pub extended_intraday: u64,
    pub extended_daily: u64,
    pub closed: u64,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            open_sub_hour: 60,
            open_intraday: 5 * 60,
            open_daily: 15 * 60,
            extended_sub_hour: 5 * 60,
            extended_intraday: 10 * 60,
            extended_daily: 15 * 60,
            closed: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessPolicy {
    pub thresholds: FreshnessThresholds,
}

impl FreshnessPolicy {
    pub fn new(thresholds: FreshnessThresholds) -> Self {
        Self { thresholds }
    }

    pub fn staleness_threshold(&self, timeframe: Timeframe, status: MarketStatus) -> Duration {
        let t = &self.thresholds;
        let intraday = timeframe < Timeframe::D1;
        let secs = match status {
            MarketStatus::Closed => t.closed,
            MarketStatus::Open if timeframe.is_sub_hour() => t.open_sub_hour,
            MarketStatus::Open if intraday => t.open_intraday,
            MarketStatus::Open => t.open_daily,
            _ if timeframe.is_sub_hour() => t.extended_sub_hour,
            _ if intraday => t.extended_intraday,
            _ => t.extended_daily,
        };
        Duration::seconds(secs as i64)
    }

    pub fn is_stale(
        &self,
        metadata: &DataFreshnessMetadata,
        status: MarketStatus,
        now: DateTime<Utc>,
    ) -> bool {
        metadata.age(now) > self.staleness_threshold(metadata.timeframe, status)
    }

    pub fn valid_until(
        &self,
        timeframe: Timeframe,
        status: MarketStatus,
        from: DateTime<Utc>,
    ) -> DateTime<Utc> {
        from + self.staleness_threshold(timeframe, status)
    }

    /// Refresh session, age and validity on `metadata` as of `now`
    pub fn stamp(&self, metadata: &mut DataFreshnessMetadata, status: MarketStatus, now: DateTime<Utc>) {
        metadata.market_status = status;
        metadata.data_age_secs = metadata.age(now).num_seconds().max(0);
        metadata.valid_until = self.valid_until(metadata.timeframe, status, metadata.fetched_at);
    }
}

// ============================================================
// CANDLE CACHE
// ============================================================

/// Last good fetch per `"{symbol}:{timeframe}"`.
///
/// Entries are keyed without the request range, so one cache should serve one
/// request shape (typically "latest N candles").
pub struct CandleCache {
    source: Arc<dyn CandleSource>,
    calendar: Arc<dyn MarketCalendar>,
    policy: FreshnessPolicy,
    fetch_timeout: StdDuration,
    entries: RwLock<HashMap<String, FetchedSeries>>,
}

impl CandleCache {
    pub fn new(
        source: Arc<dyn CandleSource>,
        calendar: Arc<dyn MarketCalendar>,
        policy: FreshnessPolicy,
    ) -> Self {
        Self {
            source,
            calendar,
            policy,
            fetch_timeout: StdDuration::from_secs(10),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: StdDuration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub async fn get_or_fetch(&self, request: &FetchRequest) -> Result<FetchedSeries, FetchError> {
        self.get_or_fetch_at(request, Utc::now()).await
    }

    /// Same as [`get_or_fetch`](Self::get_or_fetch) with an explicit clock
    pub async fn get_or_fetch_at(
        &self,
        request: &FetchRequest,
        now: DateTime<Utc>,
    ) -> Result<FetchedSeries, FetchError> {
        let key = request.key();
        let status = self.calendar.status_at(now);
        let cached = self.entries.read().get(&key).cloned();

        if let Some(mut hit) = cached.clone() {
            if !self.policy.is_stale(&hit.metadata, status, now) {
                debug!(%key, "candle cache hit");
                hit.metadata.source = DataOrigin::Cache;
                self.policy.stamp(&mut hit.metadata, status, now);
                return Ok(hit);
            }
        }

        let outcome = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_candles(request)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.fetch_timeout)),
        };

        match outcome {
            Ok(mut fresh) => {
                // Age is measured on the caller's clock
                fresh.metadata.fetched_at = now;
                fresh.metadata.source = DataOrigin::Api;
                self.policy.stamp(&mut fresh.metadata, status, now);
                self.entries.write().insert(key, fresh.clone());
                Ok(fresh)
            },
            Err(err) if err.allows_fallback() => match cached {
                Some(mut stale) => {
                    warn!(%key, source = self.source.name(), error = %err, "serving stale candles");
                    stale.metadata.source = DataOrigin::CacheFallback;
                    stale.metadata.is_delayed = true;
                    self.policy.stamp(&mut stale.metadata, status, now);
                    Ok(stale)
                },
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(timeframe: Timeframe, fetched_at: DateTime<Utc>) -> DataFreshnessMetadata {
        DataFreshnessMetadata::new(DataOrigin::Api, timeframe, fetched_at)
    }

    #[test]
    fn test_thresholds_by_session() {
        let policy = FreshnessPolicy::default();
        let secs = |tf, status| policy.staleness_threshold(tf, status).num_seconds();
        assert_eq!(secs(Timeframe::M5, MarketStatus::Open), 60);
        assert_eq!(secs(Timeframe::H4, MarketStatus::Open), 300);
        assert_eq!(secs(Timeframe::D1, MarketStatus::Open), 900);
        assert_eq!(secs(Timeframe::M1, MarketStatus::PreMarket), 300);
        assert_eq!(secs(Timeframe::H1, MarketStatus::AfterHours), 600);
        assert_eq!(secs(Timeframe::W1, MarketStatus::AfterHours), 900);
        assert_eq!(secs(Timeframe::M1, MarketStatus::Closed), 1800);
    }

    #[test]
    fn test_is_stale() {
        let policy = FreshnessPolicy::default();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap();
        let m = meta(Timeframe::M5, t0);
        assert!(!policy.is_stale(&m, MarketStatus::Open, t0 + Duration::seconds(60)));
        assert!(policy.is_stale(&m, MarketStatus::Open, t0 + Duration::seconds(61)));
        assert!(!policy.is_stale(&m, MarketStatus::Closed, t0 + Duration::minutes(20)));
        assert_eq!(
            policy.valid_until(Timeframe::M5, MarketStatus::Closed, t0),
            t0 + Duration::minutes(30)
        );
    }

    #[test]
    fn test_summary_flags_fallback() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap();
        let mut fallback = meta(Timeframe::H1, t0 - Duration::hours(1));
        fallback.source = DataOrigin::CacheFallback;
        fallback.is_delayed = true;
        let entries = [meta(Timeframe::M5, t0), fallback];
        let summary = FreshnessSummary::from_metadata(&entries);
        assert!(summary.used_fallback && summary.is_delayed);
        assert_eq!(summary.oldest_fetch, Some(t0 - Duration::hours(1)));
        assert_eq!(summary.timeframes.len(), 2);
    }
}
