use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::backtest::RecommendationPolicy;
use crate::error::ChurnError;
use crate::learning::LearningSettings;
use crate::risk::RiskThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub weights_ttl_secs: u64,
    pub students_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            weights_ttl_secs: 300,
            students_ttl_secs: 60,
        }
    }
}

impl CacheSettings {
    pub fn weights_ttl(&self) -> Duration {
        Duration::from_secs(self.weights_ttl_secs)
    }

    pub fn students_ttl(&self) -> Duration {
        Duration::from_secs(self.students_ttl_secs)
    }
}

/// Policy constants for scoring, backtesting and learning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk_thresholds: RiskThresholds,
    /// Risk score at or above which a backtest counts a churn prediction.
    pub decision_threshold: f64,
    /// Tenure after which an active student is usable as ground truth.
    pub min_active_days: i64,
    pub learning: LearningSettings,
    pub apply_accuracy_gain: f64,
    pub cache: CacheSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_thresholds: RiskThresholds::default(),
            decision_threshold: 0.5,
            min_active_days: 90,
            learning: LearningSettings::default(),
            apply_accuracy_gain: 0.05,
            cache: CacheSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(text).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml_str(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ChurnError> {
        self.risk_thresholds.validate()?;
        self.learning.validate()?;
        if !(0.0..=1.0).contains(&self.decision_threshold) {
            return Err(ChurnError::InvalidConfig(format!(
                "decision_threshold must be in [0, 1], got {}",
                self.decision_threshold
            )));
        }
        if self.min_active_days < 0 {
            return Err(ChurnError::InvalidConfig(format!(
                "min_active_days must not be negative, got {}",
                self.min_active_days
            )));
        }
        if !(0.0..=1.0).contains(&self.apply_accuracy_gain) {
            return Err(ChurnError::InvalidConfig(format!(
                "apply_accuracy_gain must be in [0, 1], got {}",
                self.apply_accuracy_gain
            )));
        }
        Ok(())
    }

    pub fn recommendation_policy(&self) -> RecommendationPolicy {
        RecommendationPolicy {
            min_accuracy_gain: self.apply_accuracy_gain,
        }
    }
}
