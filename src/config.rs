//! Application configuration, loaded from JSON.
//!
//! Every section falls back to its defaults, so `{}` is a valid file.
//!
//! ```json
//! {
//!   "min_confidence": 60,
//!   "scoring": { "multi_timeframe_bonus": 20.0 },
//!   "detectors": { "flag": { "min_pole_move": 0.05 } },
//!   "scan": { "batch_size": 10, "timeframes": ["1h", "1d"] }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    backtest::BacktestConfig,
    freshness::{FreshnessPolicy, FreshnessThresholds},
    live::BatchConfig,
    orchestrator::OrchestratorConfig,
    scanner::ScanConfig,
    scoring::ScoringWeights,
    EngineBuilder, PatternEngine, PatternError, PatternType, Result,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub min_confidence: Option<u8>,
    /// Restrict detection to these patterns
    pub patterns: Option<Vec<PatternType>>,
    pub scoring: ScoringWeights,
    /// Per-detector parameter overrides, keyed by detector then parameter
    pub detectors: HashMap<String, HashMap<String, f64>>,
    pub orchestrator: OrchestratorConfig,
    pub freshness: FreshnessThresholds,
    pub backtest: BacktestConfig,
    pub scan: ScanConfig,
    pub live: BatchConfig,
}

impl AppConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| PatternError::InvalidConfig(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PatternError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Checks that do not need an engine. Detector overrides are checked by
    /// [`build_engine`](Self::build_engine).
    pub fn validate(&self) -> Result<()> {
        if let Some(min) = self.min_confidence {
            if min > 100 {
                return Err(PatternError::OutOfRange {
                    field: "min_confidence",
                    value: f64::from(min),
                    min: 0.0,
                    max: 100.0,
                });
            }
        }
        if self.scan.batch_size == 0 {
            return Err(PatternError::InvalidConfig("scan.batch_size must be positive".into()));
        }
        if self.scan.timeframes.is_empty() {
            return Err(PatternError::InvalidConfig("scan.timeframes is empty".into()));
        }
        if self.orchestrator.fingerprint_bars == 0 {
            return Err(PatternError::InvalidConfig(
                "orchestrator.fingerprint_bars must be positive".into(),
            ));
        }
        self.scoring.validate()
    }

    pub fn build_engine(&self) -> Result<PatternEngine> {
        let mut builder = EngineBuilder::new()
            .with_all_defaults()
            .scoring(self.scoring.clone())
            .with_param_overrides(&self.detectors)?;
        if let Some(min) = self.min_confidence {
            builder = builder.min_confidence(min);
        }
        if let Some(patterns) = &self.patterns {
            builder = builder.only_patterns(patterns.iter().copied());
        }
        builder.build()
    }

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(self.freshness.clone())
    }
}
