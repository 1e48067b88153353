use serde::{Deserialize, Serialize};

use crate::error::{ChurnError, Result};
use crate::models::{
    ChurnFactor, FactorCategory, FeatureVector, RiskAssessment, RiskLevel, StudentRecord,
    StudentScore, WeightSet,
};
use crate::normalize::{default_normalizers, NormalizerSet};

/// Normalized scores at or above this push risk up for the student.
pub const ADVERSE_MIDPOINT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub medium: f64,
    pub high: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 0.33,
            high: 0.66,
        }
    }
}

impl RiskThresholds {
    pub fn classify(&self, score: f64) -> RiskLevel {
        if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ordered = 0.0 <= self.medium && self.medium <= self.high && self.high <= 1.0;
        if !ordered {
            return Err(ChurnError::InvalidConfig(format!(
                "risk thresholds must satisfy 0 <= medium ({}) <= high ({}) <= 1",
                self.medium, self.high
            )));
        }
        Ok(())
    }
}

/// Normalizers and thresholds that stay fixed while weights vary.
#[derive(Debug, Clone)]
pub struct Scorer {
    pub normalizers: NormalizerSet,
    pub thresholds: RiskThresholds,
}

impl Scorer {
    pub fn new(normalizers: NormalizerSet, thresholds: RiskThresholds) -> Self {
        Self {
            normalizers,
            thresholds,
        }
    }

    pub fn score(&self, features: &FeatureVector, weights: &WeightSet) -> Result<RiskAssessment> {
        score_student(features, weights, &self.normalizers, &self.thresholds)
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(default_normalizers(), RiskThresholds::default())
    }
}

pub fn score_student(
    features: &FeatureVector,
    weights: &WeightSet,
    normalizers: &NormalizerSet,
    thresholds: &RiskThresholds,
) -> Result<RiskAssessment> {
    let mut factors = Vec::with_capacity(FactorCategory::COUNT);

    for (category, &value) in features.iter() {
        if !value.is_finite() {
            return Err(ChurnError::NonFiniteFeature { category, value });
        }

        let normalizer = normalizers[category];
        let normalized_score = normalizer.apply(value);
        let weight = weights[category];
        factors.push(ChurnFactor {
            category,
            value,
            normalized_score,
            weight,
            impact: normalizer.impact(),
            contribution_to_risk: normalized_score * weight,
        });
    }

    let risk_score = factors
        .iter()
        .map(|factor| factor.contribution_to_risk)
        .sum::<f64>()
        .clamp(0.0, 1.0);

    Ok(RiskAssessment {
        risk_score,
        risk_level: thresholds.classify(risk_score),
        factors,
        weights: *weights,
    })
}

/// Scores every student and returns them highest risk first.
pub fn score_students(
    students: &[StudentRecord],
    weights: &WeightSet,
    scorer: &Scorer,
) -> Result<Vec<StudentScore>> {
    let mut scores = Vec::with_capacity(students.len());
    for student in students {
        let assessment = scorer.score(&student.features, weights)?;
        scores.push(StudentScore {
            student_id: student.id,
            full_name: student.full_name.clone(),
            email: student.email.clone(),
            assessment,
        });
    }

    scores.sort_by(|a, b| {
        b.assessment
            .risk_score
            .partial_cmp(&a.assessment.risk_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(scores)
}

impl ChurnFactor {
    pub fn is_adverse(&self) -> bool {
        self.normalized_score >= ADVERSE_MIDPOINT
    }

    pub fn protective_strength(&self) -> f64 {
        (ADVERSE_MIDPOINT - self.normalized_score).max(0.0) * self.weight
    }
}

impl RiskAssessment {
    /// Adverse factors, largest contribution first.
    pub fn risk_factors(&self) -> Vec<&ChurnFactor> {
        let mut factors: Vec<&ChurnFactor> =
            self.factors.iter().filter(|factor| factor.is_adverse()).collect();
        factors.sort_by(|a, b| {
            b.contribution_to_risk
                .partial_cmp(&a.contribution_to_risk)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        factors
    }

    /// Protective factors, strongest first.
    pub fn protective_factors(&self) -> Vec<&ChurnFactor> {
        let mut factors: Vec<&ChurnFactor> =
            self.factors.iter().filter(|factor| !factor.is_adverse()).collect();
        factors.sort_by(|a, b| {
            b.protective_strength()
                .partial_cmp(&a.protective_strength())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        factors
    }
}
