use serde::Serialize;
use tracing::debug;

use crate::error::{ChurnError, Result};
use crate::models::{FactorCategory, FactorMap, WeightSet};

/// Absolute tolerance on the weight sum. Weights are edited as whole
/// percentages, so accumulated float error stays well below this.
pub const SUM_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightValidation {
    pub is_valid: bool,
    pub sum: f64,
}

pub fn validate(weights: &WeightSet) -> WeightValidation {
    let sum = weights.sum();
    WeightValidation {
        is_valid: (sum - 1.0).abs() < SUM_TOLERANCE,
        sum,
    }
}

/// Guard for every write of the current weight set and for live scoring.
pub fn ensure_persistable(weights: &WeightSet) -> Result<()> {
    for (category, &value) in weights.iter() {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(ChurnError::WeightOutOfRange { category, value });
        }
    }

    let validation = validate(weights);
    if !validation.is_valid {
        return Err(ChurnError::WeightSumMismatch {
            sum: validation.sum,
            tolerance: SUM_TOLERANCE,
        });
    }

    Ok(())
}

pub fn default_weights() -> WeightSet {
    FactorMap::from_fn(|category| match category {
        FactorCategory::FirstSessionSatisfaction => 0.25,
        FactorCategory::SessionsCompleted => 0.10,
        FactorCategory::FollowUpBookingRate => 0.15,
        FactorCategory::AvgSessionScore => 0.10,
        FactorCategory::TutorConsistency => 0.10,
        FactorCategory::StudentEngagement => 0.10,
        FactorCategory::TutorSwitchFrequency => 0.05,
        FactorCategory::SchedulingFriction => 0.05,
        FactorCategory::ResponseRate => 0.10,
    })
}

/// Parses a JSON object keyed by category identifier.
pub fn from_json(text: &str) -> anyhow::Result<WeightSet> {
    let entries: std::collections::BTreeMap<String, f64> = serde_json::from_str(text)?;
    Ok(FactorMap::from_entries(entries)?)
}

/// Scales non-negative weights so they sum to exactly 1.0.
pub fn renormalize(weights: &WeightSet) -> Result<WeightSet> {
    for (category, &value) in weights.iter() {
        if !value.is_finite() || value < 0.0 {
            return Err(ChurnError::WeightOutOfRange { category, value });
        }
    }

    let sum = weights.sum();
    if sum <= 0.0 {
        return Err(ChurnError::DegenerateWeights);
    }

    Ok(FactorMap::from_fn(|category| weights[category] / sum))
}

/// Adds per-category deltas to `base`, bounds each weight to [0, 1] and
/// renormalizes the result.
pub fn apply_adjustments(base: &WeightSet, deltas: &FactorMap<f64>) -> Result<WeightSet> {
    let adjusted =
        FactorMap::from_fn(|category| (base[category] + deltas[category]).clamp(0.0, 1.0));
    let normalized = renormalize(&adjusted)?;
    debug!(sum = normalized.sum(), "applied weight adjustments");
    Ok(normalized)
}

/// An editing session: the applied set plus a local draft that is only
/// promoted when it validates.
#[derive(Debug, Clone)]
pub struct WeightDraft {
    applied: WeightSet,
    draft: WeightSet,
}

impl WeightDraft {
    pub fn new(applied: WeightSet) -> Self {
        Self {
            applied,
            draft: applied,
        }
    }

    pub fn applied(&self) -> &WeightSet {
        &self.applied
    }

    pub fn draft(&self) -> &WeightSet {
        &self.draft
    }

    pub fn set(&mut self, category: FactorCategory, weight: f64) {
        self.draft[category] = weight;
    }

    pub fn is_dirty(&self) -> bool {
        self.applied != self.draft
    }

    pub fn validation(&self) -> WeightValidation {
        validate(&self.draft)
    }

    pub fn reset(&mut self) {
        self.draft = self.applied;
    }

    /// Returns the draft as the new applied set, or the reason it cannot be.
    pub fn promote(self) -> Result<WeightSet> {
        ensure_persistable(&self.draft)?;
        Ok(self.draft)
    }
}

/// Parses a `category=weight` edit.
pub fn parse_assignment(raw: &str) -> anyhow::Result<(FactorCategory, f64)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected category=weight, got {raw}"))?;
    let category: FactorCategory = key.trim().parse()?;
    let weight: f64 = value.trim().parse()?;
    Ok((category, weight))
}
