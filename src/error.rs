use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{FactorCategory, Outcome};

/// Errors raised by the scoring, weighting and learning code.
///
/// These are caller errors: the engine never clamps, defaults or renormalizes
/// its way around them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChurnError {
    #[error("unknown factor category: {0}")]
    UnknownCategory(String),

    #[error("missing value for factor category {0}")]
    MissingCategory(FactorCategory),

    #[error("weight for {category} is {value}, expected a value in [0, 1]")]
    WeightOutOfRange { category: FactorCategory, value: f64 },

    #[error("weights sum to {sum:.4}, expected 1.0 (tolerance {tolerance})")]
    WeightSumMismatch { sum: f64, tolerance: f64 },

    #[error("weights sum to zero and cannot be renormalized")]
    DegenerateWeights,

    #[error("feature value for {category} is not finite: {value}")]
    NonFiniteFeature { category: FactorCategory, value: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown risk level: {0}")]
    UnknownRiskLevel(String),

    #[error("unknown outcome: {0}")]
    UnknownOutcome(String),

    #[error("outcome date {outcome_date} is before enrollment on {enrolled_on}")]
    OutcomeBeforeEnrollment {
        outcome_date: NaiveDate,
        enrolled_on: NaiveDate,
    },

    #[error("student is recorded as {recorded}, cannot record {requested}")]
    OutcomeConflict { recorded: Outcome, requested: Outcome },

    #[error("student has {tenure_days} days of tenure, an active outcome needs {min_active_days}")]
    TenureTooShort {
        tenure_days: i64,
        min_active_days: i64,
    },
}

pub type Result<T> = std::result::Result<T, ChurnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_category() {
        let err = ChurnError::WeightOutOfRange {
            category: FactorCategory::ResponseRate,
            value: 1.4,
        };
        assert_eq!(
            err.to_string(),
            "weight for response_rate is 1.4, expected a value in [0, 1]"
        );

        let err = ChurnError::MissingCategory(FactorCategory::TutorConsistency);
        assert!(err.to_string().contains("tutor_consistency"));
    }

    #[test]
    fn sum_mismatch_reports_the_sum() {
        let err = ChurnError::WeightSumMismatch {
            sum: 0.95,
            tolerance: 0.001,
        };
        assert!(err.to_string().contains("0.9500"));
    }

    #[test]
    fn tenure_error_names_both_sides() {
        let err = ChurnError::TenureTooShort {
            tenure_days: 5,
            min_active_days: 90,
        };
        assert_eq!(
            err.to_string(),
            "student has 5 days of tenure, an active outcome needs 90"
        );
    }
}
