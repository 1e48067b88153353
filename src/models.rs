use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::ChurnError;

/// Behavioral dimensions used as churn predictors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorCategory {
    FirstSessionSatisfaction,
    SessionsCompleted,
    FollowUpBookingRate,
    AvgSessionScore,
    TutorConsistency,
    StudentEngagement,
    TutorSwitchFrequency,
    SchedulingFriction,
    ResponseRate,
}

impl FactorCategory {
    pub const COUNT: usize = 9;

    pub const ALL: [FactorCategory; FactorCategory::COUNT] = [
        FactorCategory::FirstSessionSatisfaction,
        FactorCategory::SessionsCompleted,
        FactorCategory::FollowUpBookingRate,
        FactorCategory::AvgSessionScore,
        FactorCategory::TutorConsistency,
        FactorCategory::StudentEngagement,
        FactorCategory::TutorSwitchFrequency,
        FactorCategory::SchedulingFriction,
        FactorCategory::ResponseRate,
    ];

    /// Identifier shared by JSON keys, CSV headers and table columns.
    pub fn as_str(self) -> &'static str {
        match self {
            FactorCategory::FirstSessionSatisfaction => "first_session_satisfaction",
            FactorCategory::SessionsCompleted => "sessions_completed",
            FactorCategory::FollowUpBookingRate => "follow_up_booking_rate",
            FactorCategory::AvgSessionScore => "avg_session_score",
            FactorCategory::TutorConsistency => "tutor_consistency",
            FactorCategory::StudentEngagement => "student_engagement",
            FactorCategory::TutorSwitchFrequency => "tutor_switch_frequency",
            FactorCategory::SchedulingFriction => "scheduling_friction",
            FactorCategory::ResponseRate => "response_rate",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FactorCategory::FirstSessionSatisfaction => "first-session satisfaction",
            FactorCategory::SessionsCompleted => "sessions completed",
            FactorCategory::FollowUpBookingRate => "follow-up booking rate",
            FactorCategory::AvgSessionScore => "average session score",
            FactorCategory::TutorConsistency => "tutor consistency",
            FactorCategory::StudentEngagement => "student engagement",
            FactorCategory::TutorSwitchFrequency => "tutor-switch frequency",
            FactorCategory::SchedulingFriction => "scheduling friction",
            FactorCategory::ResponseRate => "response rate",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FactorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactorCategory {
    type Err = ChurnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FactorCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| ChurnError::UnknownCategory(s.to_string()))
    }
}

/// One value per factor category, fixed shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorMap<T>([T; FactorCategory::COUNT]);

impl<T> FactorMap<T> {
    pub fn from_fn(f: impl FnMut(FactorCategory) -> T) -> Self {
        Self(FactorCategory::ALL.map(f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactorCategory, &T)> + '_ {
        FactorCategory::ALL.into_iter().zip(self.0.iter())
    }

    /// Builds a map from string-keyed entries. Every category must appear
    /// exactly once and no other key is accepted.
    pub fn from_entries<I, K>(entries: I) -> Result<Self, ChurnError>
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: Default,
    {
        let mut slots: [Option<T>; FactorCategory::COUNT] = Default::default();
        for (key, value) in entries {
            let category: FactorCategory = key.as_ref().parse()?;
            slots[category.index()] = Some(value);
        }

        if let Some(category) = FactorCategory::ALL
            .into_iter()
            .find(|category| slots[category.index()].is_none())
        {
            return Err(ChurnError::MissingCategory(category));
        }
        Ok(Self(slots.map(Option::unwrap_or_default)))
    }
}

impl FactorMap<f64> {
    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }
}

impl<T> Index<FactorCategory> for FactorMap<T> {
    type Output = T;

    fn index(&self, category: FactorCategory) -> &T {
        &self.0[category.index()]
    }
}

impl<T> IndexMut<FactorCategory> for FactorMap<T> {
    fn index_mut(&mut self, category: FactorCategory) -> &mut T {
        &mut self.0[category.index()]
    }
}

impl<T: Serialize> Serialize for FactorMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter().map(|(category, value)| (category.as_str(), value)))
    }
}

impl<'de, T: Deserialize<'de> + Default> Deserialize<'de> for FactorMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<String, T>::deserialize(deserializer)?;
        FactorMap::from_entries(entries).map_err(serde::de::Error::custom)
    }
}

/// Weight per category. Valid sets sum to 1.0, see `weights::validate`.
pub type WeightSet = FactorMap<f64>;

/// Raw, un-normalized feature values for one student.
pub type FeatureVector = FactorMap<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    /// Raising the raw value raises risk.
    Positive,
    /// Raising the raw value lowers risk.
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ChurnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(ChurnError::UnknownRiskLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Churned,
    Active,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Churned => "churned",
            Outcome::Active => "active",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = ChurnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "churned" => Ok(Outcome::Churned),
            "active" => Ok(Outcome::Active),
            other => Err(ChurnError::UnknownOutcome(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnFactor {
    pub category: FactorCategory,
    pub value: f64,
    pub normalized_score: f64,
    pub weight: f64,
    pub impact: Impact,
    pub contribution_to_risk: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub factors: Vec<ChurnFactor>,
    pub weights: WeightSet,
}

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub enrolled_on: NaiveDate,
    /// `None` while the outcome is unknown.
    pub outcome: Option<Outcome>,
    pub churned_on: Option<NaiveDate>,
    pub features: FeatureVector,
}

impl StudentRecord {
    /// Outcome usable as backtest ground truth. Active students only count
    /// once they have been enrolled for `min_active_days`.
    pub fn ground_truth(&self, as_of: NaiveDate, min_active_days: i64) -> Option<Outcome> {
        match self.outcome {
            Some(Outcome::Churned) => Some(Outcome::Churned),
            Some(Outcome::Active) if (as_of - self.enrolled_on).num_days() >= min_active_days => {
                Some(Outcome::Active)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentScore {
    pub student_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub assessment: RiskAssessment,
}

#[derive(Debug, Clone)]
pub struct RiskLevelSummary {
    pub level: RiskLevel,
    pub count: usize,
    pub avg_score: f64,
}

#[derive(Debug, Clone)]
pub struct CohortMember {
    pub student_id: Uuid,
    pub features: FeatureVector,
    pub actual_outcome: Option<Outcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
    pub total_predictions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorRole {
    /// Pointed away from the actual outcome.
    Misfired,
    /// Pointed toward the actual outcome.
    Confirming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorAnalysis {
    pub category: FactorCategory,
    pub normalized_score: f64,
    pub role: FactorRole,
    pub current_weight: f64,
    pub suggested_weight: f64,
    pub delta: f64,
}

/// Audit record of a confirmed outcome. Append-only once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub id: Uuid,
    pub student_id: Uuid,
    pub churn_date: NaiveDate,
    pub predicted_risk: f64,
    pub predicted_level: RiskLevel,
    pub actual_outcome: Outcome,
    pub was_prediction_correct: bool,
    pub suggested_weights: WeightSet,
    pub rationale: String,
    pub factor_analysis: Vec<FactorAnalysis>,
    pub survey_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseStudyRecommendation {
    pub student_id: Uuid,
    pub predicted_risk: f64,
    pub predicted_level: RiskLevel,
    pub actual_outcome: Option<Outcome>,
    pub current_weights: WeightSet,
    pub suggested_weights: WeightSet,
    pub rationale: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_round_trip_through_identifiers() {
        for category in FactorCategory::ALL {
            assert_eq!(category.as_str().parse::<FactorCategory>(), Ok(category));
        }
        assert_eq!(
            "homework_load".parse::<FactorCategory>(),
            Err(ChurnError::UnknownCategory("homework_load".to_string()))
        );
    }

    #[test]
    fn factor_map_rejects_missing_and_unknown_keys() {
        let mut entries: Vec<(String, f64)> = FactorCategory::ALL
            .into_iter()
            .skip(1)
            .map(|category| (category.as_str().to_string(), 0.1))
            .collect();
        assert_eq!(
            FactorMap::from_entries(entries.clone()),
            Err(ChurnError::MissingCategory(FactorCategory::FirstSessionSatisfaction))
        );

        entries.push(("first_session_satisfaction".to_string(), 0.2));
        entries.push(("mood".to_string(), 0.0));
        assert_eq!(
            FactorMap::from_entries(entries),
            Err(ChurnError::UnknownCategory("mood".to_string()))
        );
    }

    #[test]
    fn factor_map_serializes_as_keyed_object() {
        let map = FactorMap::from_fn(|category| category.as_str().len() as f64);
        let json = serde_json::to_value(map).unwrap();
        assert_eq!(json["response_rate"], 13.0);

        let parsed: FactorMap<f64> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, map);

        let err = serde_json::from_str::<FactorMap<f64>>(r#"{"response_rate": 1.0}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("missing value"));
    }

    #[test]
    fn active_students_need_tenure_to_count() {
        let enrolled_on = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut student = StudentRecord {
            id: Uuid::new_v4(),
            full_name: "Noor Haddad".to_string(),
            email: "noor@example.com".to_string(),
            enrolled_on,
            outcome: Some(Outcome::Active),
            churned_on: None,
            features: FactorMap::from_fn(|_| 0.0),
        };

        let early = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let later = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        assert_eq!(student.ground_truth(early, 90), None);
        assert_eq!(student.ground_truth(later, 90), Some(Outcome::Active));

        student.outcome = Some(Outcome::Churned);
        assert_eq!(student.ground_truth(early, 90), Some(Outcome::Churned));

        student.outcome = None;
        assert_eq!(student.ground_truth(later, 90), None);
    }

    #[test]
    fn unknown_labels_are_typed_errors() {
        assert_eq!("medium".parse::<RiskLevel>(), Ok(RiskLevel::Medium));
        assert_eq!(
            "severe".parse::<RiskLevel>(),
            Err(ChurnError::UnknownRiskLevel("severe".to_string()))
        );
        assert_eq!("churned".parse::<Outcome>(), Ok(Outcome::Churned));
        assert_eq!(
            "paused".parse::<Outcome>(),
            Err(ChurnError::UnknownOutcome("paused".to_string()))
        );
    }

    #[test]
    fn accuracy_metrics_use_camel_case_fields() {
        let json = serde_json::to_value(AccuracyMetrics::default()).unwrap();
        assert!(json.get("f1Score").is_some());
        assert!(json.get("falseNegatives").is_some());
    }
}
