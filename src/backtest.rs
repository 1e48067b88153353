use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::error::{ChurnError, Result};
use crate::models::{AccuracyMetrics, CohortMember, Outcome, StudentRecord, WeightSet};
use crate::risk::Scorer;

/// Metrics for one weight set plus the members that could not be judged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub metrics: AccuracyMetrics,
    pub excluded_ineligible: usize,
}

/// Pairs each student with their ground-truth outcome as of `as_of`.
/// Students without one stay in the cohort with `actual_outcome: None`.
pub fn build_cohort(
    students: &[StudentRecord],
    as_of: NaiveDate,
    min_active_days: i64,
) -> Vec<CohortMember> {
    students
        .iter()
        .map(|student| CohortMember {
            student_id: student.id,
            features: student.features,
            actual_outcome: student.ground_truth(as_of, min_active_days),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ConfusionCounts {
    true_positives: usize,
    false_positives: usize,
    true_negatives: usize,
    false_negatives: usize,
}

impl ConfusionCounts {
    fn record(mut self, predicted_churn: bool, actual: Outcome) -> Self {
        match (predicted_churn, actual) {
            (true, Outcome::Churned) => self.true_positives += 1,
            (true, Outcome::Active) => self.false_positives += 1,
            (false, Outcome::Churned) => self.false_negatives += 1,
            (false, Outcome::Active) => self.true_negatives += 1,
        }
        self
    }

    fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    fn into_metrics(self) -> AccuracyMetrics {
        let tp = self.true_positives as f64;
        let fp = self.false_positives as f64;
        let tn = self.true_negatives as f64;
        let fn_ = self.false_negatives as f64;

        let total = self.total();
        let accuracy = ratio(tp + tn, total as f64);
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1_score = ratio(2.0 * precision * recall, precision + recall);

        AccuracyMetrics {
            accuracy,
            precision,
            recall,
            f1_score,
            true_positives: self.true_positives,
            false_positives: self.false_positives,
            true_negatives: self.true_negatives,
            false_negatives: self.false_negatives,
            total_predictions: total,
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Buckets `(risk_score, actual)` pairs; a score at or above the threshold
/// is a churn prediction.
pub fn evaluate_predictions<I>(predictions: I, decision_threshold: f64) -> AccuracyMetrics
where
    I: IntoIterator<Item = (f64, Outcome)>,
{
    predictions
        .into_iter()
        .fold(ConfusionCounts::default(), |counts, (risk_score, actual)| {
            counts.record(risk_score >= decision_threshold, actual)
        })
        .into_metrics()
}

/// Re-scores the cohort with `weights` and measures the predictions against
/// known outcomes. The weights are not validated so exploratory sets can be
/// evaluated.
pub fn project_accuracy(
    cohort: &[CohortMember],
    weights: &WeightSet,
    scorer: &Scorer,
    decision_threshold: f64,
) -> Result<Projection> {
    if !(0.0..=1.0).contains(&decision_threshold) {
        return Err(ChurnError::InvalidConfig(format!(
            "decision threshold {decision_threshold} is outside [0, 1]"
        )));
    }

    let mut excluded_ineligible = 0usize;
    let mut predictions = Vec::with_capacity(cohort.len());
    for member in cohort {
        let Some(actual) = member.actual_outcome else {
            debug!(student_id = %member.student_id, "no ground truth yet, excluded");
            excluded_ineligible += 1;
            continue;
        };
        let assessment = scorer.score(&member.features, weights)?;
        predictions.push((assessment.risk_score, actual));
    }

    let metrics = evaluate_predictions(predictions, decision_threshold);
    debug!(
        total = metrics.total_predictions,
        excluded = excluded_ineligible,
        accuracy = metrics.accuracy,
        false_negatives = metrics.false_negatives,
        "projected cohort accuracy"
    );

    Ok(Projection {
        metrics,
        excluded_ineligible,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyReason {
    FewerMissedChurn,
    AccuracyGain,
}

/// Advisory judgment on a candidate weight set. Nothing is applied
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Apply(ApplyReason),
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecommendationPolicy {
    /// Accuracy gain that justifies applying a candidate on its own.
    pub min_accuracy_gain: f64,
}

impl Default for RecommendationPolicy {
    fn default() -> Self {
        Self {
            min_accuracy_gain: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub before: AccuracyMetrics,
    pub after: AccuracyMetrics,
    pub accuracy_delta: f64,
    pub precision_delta: f64,
    pub recall_delta: f64,
    pub f1_delta: f64,
    /// Negative when the candidate misses fewer churned students.
    pub false_negative_delta: i64,
    pub verdict: Verdict,
}

pub fn compare(
    before: &AccuracyMetrics,
    after: &AccuracyMetrics,
    policy: &RecommendationPolicy,
) -> Comparison {
    let accuracy_delta = after.accuracy - before.accuracy;
    let false_negative_delta = after.false_negatives as i64 - before.false_negatives as i64;

    let verdict = if after.false_negatives < before.false_negatives {
        Verdict::Apply(ApplyReason::FewerMissedChurn)
    } else if accuracy_delta > policy.min_accuracy_gain {
        Verdict::Apply(ApplyReason::AccuracyGain)
    } else {
        Verdict::Keep
    };

    Comparison {
        before: *before,
        after: *after,
        accuracy_delta,
        precision_delta: after.precision - before.precision,
        recall_delta: after.recall - before.recall,
        f1_delta: after.f1_score - before.f1_score,
        false_negative_delta,
        verdict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FactorCategory, FactorMap};
    use crate::risk::tests::{disengaged_features, engaged_features, student};
    use crate::weights::default_weights;
    use proptest::prelude::*;

    fn member(features: crate::models::FeatureVector, outcome: Option<Outcome>) -> CohortMember {
        CohortMember {
            student_id: uuid::Uuid::new_v4(),
            features,
            actual_outcome: outcome,
        }
    }

    #[test]
    fn perfect_cohort_scores_one_everywhere() {
        let metrics = evaluate_predictions(
            vec![(0.9, Outcome::Churned), (0.8, Outcome::Churned)],
            0.5,
        );
        assert_eq!(
            metrics,
            AccuracyMetrics {
                accuracy: 1.0,
                precision: 1.0,
                recall: 1.0,
                f1_score: 1.0,
                true_positives: 2,
                false_positives: 0,
                true_negatives: 0,
                false_negatives: 0,
                total_predictions: 2,
            }
        );
    }

    #[test]
    fn missed_churn_is_a_false_negative() {
        let metrics = evaluate_predictions(vec![(0.2, Outcome::Churned)], 0.5);
        assert_eq!(metrics.false_negatives, 1);
        assert_eq!(metrics.true_positives, 0);
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.recall, 0.0);
        assert_eq!(metrics.precision, 0.0);
        assert_eq!(metrics.f1_score, 0.0);
    }

    #[test]
    fn empty_cohort_is_all_zero() {
        let projection =
            project_accuracy(&[], &default_weights(), &Scorer::default(), 0.5).unwrap();
        assert_eq!(projection.metrics, AccuracyMetrics::default());
        assert_eq!(projection.excluded_ineligible, 0);
        assert!(!projection.metrics.accuracy.is_nan());
    }

    #[test]
    fn threshold_boundary_counts_as_churn_prediction() {
        let metrics = evaluate_predictions(vec![(0.5, Outcome::Active)], 0.5);
        assert_eq!(metrics.false_positives, 1);
    }

    #[test]
    fn mixed_cohort_fills_every_bucket() {
        let metrics = evaluate_predictions(
            vec![
                (0.9, Outcome::Churned),
                (0.7, Outcome::Active),
                (0.1, Outcome::Active),
                (0.3, Outcome::Churned),
            ],
            0.5,
        );
        assert_eq!(metrics.true_positives, 1);
        assert_eq!(metrics.false_positives, 1);
        assert_eq!(metrics.true_negatives, 1);
        assert_eq!(metrics.false_negatives, 1);
        assert_eq!(metrics.accuracy, 0.5);
        assert_eq!(metrics.precision, 0.5);
        assert_eq!(metrics.recall, 0.5);
        assert_eq!(metrics.f1_score, 0.5);
    }

    #[test]
    fn members_without_outcome_are_excluded_not_counted() {
        let cohort = vec![
            member(disengaged_features(), Some(Outcome::Churned)),
            member(engaged_features(), Some(Outcome::Active)),
            member(disengaged_features(), None),
        ];
        let projection =
            project_accuracy(&cohort, &default_weights(), &Scorer::default(), 0.5).unwrap();
        assert_eq!(projection.excluded_ineligible, 1);
        assert_eq!(projection.metrics.total_predictions, 2);
        assert_eq!(projection.metrics.accuracy, 1.0);
    }

    #[test]
    fn build_cohort_drops_short_tenure_actives() {
        let as_of = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let mut veteran = student("Kiara Patel", engaged_features());
        veteran.outcome = Some(Outcome::Active);
        veteran.enrolled_on = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let mut newcomer = student("Sam Okafor", engaged_features());
        newcomer.outcome = Some(Outcome::Active);
        newcomer.enrolled_on = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        let mut churned = student("Rae Kim", disengaged_features());
        churned.outcome = Some(Outcome::Churned);

        let cohort = build_cohort(&[veteran, newcomer, churned], as_of, 90);
        let outcomes: Vec<Option<Outcome>> =
            cohort.iter().map(|member| member.actual_outcome).collect();
        assert_eq!(
            outcomes,
            vec![Some(Outcome::Active), None, Some(Outcome::Churned)]
        );
    }

    #[test]
    fn invalid_weights_can_still_be_explored() {
        let lopsided = FactorMap::from_fn(|category| match category {
            FactorCategory::FirstSessionSatisfaction => 0.9,
            _ => 0.3,
        });
        let cohort = vec![member(disengaged_features(), Some(Outcome::Churned))];
        let projection = project_accuracy(&cohort, &lopsided, &Scorer::default(), 0.5).unwrap();
        assert_eq!(projection.metrics.true_positives, 1);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let result = project_accuracy(&[], &default_weights(), &Scorer::default(), 1.5);
        assert!(matches!(result, Err(ChurnError::InvalidConfig(_))));
    }

    fn metrics(accuracy: f64, false_negatives: usize) -> AccuracyMetrics {
        AccuracyMetrics {
            accuracy,
            false_negatives,
            ..AccuracyMetrics::default()
        }
    }

    #[test]
    fn fewer_missed_churn_wins_over_flat_accuracy() {
        let comparison = compare(
            &metrics(0.80, 4),
            &metrics(0.79, 2),
            &RecommendationPolicy::default(),
        );
        assert_eq!(comparison.verdict, Verdict::Apply(ApplyReason::FewerMissedChurn));
        assert_eq!(comparison.false_negative_delta, -2);
    }

    #[test]
    fn accuracy_gain_must_exceed_policy() {
        let policy = RecommendationPolicy::default();
        let small = compare(&metrics(0.70, 3), &metrics(0.74, 3), &policy);
        assert_eq!(small.verdict, Verdict::Keep);

        let large = compare(&metrics(0.70, 3), &metrics(0.80, 3), &policy);
        assert_eq!(large.verdict, Verdict::Apply(ApplyReason::AccuracyGain));
        assert!((large.accuracy_delta - 0.10).abs() < 1e-9);
    }

    #[test]
    fn either_condition_is_enough_to_apply() {
        let policy = RecommendationPolicy::default();
        let comparison = compare(&metrics(0.80, 1), &metrics(0.90, 2), &policy);
        assert_eq!(comparison.verdict, Verdict::Apply(ApplyReason::AccuracyGain));

        let comparison = compare(&metrics(0.80, 1), &metrics(0.70, 2), &policy);
        assert_eq!(comparison.verdict, Verdict::Keep);
    }

    #[test]
    fn verdict_serializes_with_reason() {
        let json = serde_json::to_value(Verdict::Apply(ApplyReason::FewerMissedChurn)).unwrap();
        assert_eq!(json["verdict"], "apply");
        assert_eq!(json["reason"], "fewer_missed_churn");
    }

    proptest! {
        #[test]
        fn every_member_lands_in_one_bucket(
            scores in proptest::collection::vec((0.0f64..=1.0, any::<bool>()), 0..64),
            threshold in 0.0f64..=1.0,
        ) {
            let predictions: Vec<(f64, Outcome)> = scores
                .iter()
                .map(|&(score, churned)| {
                    (score, if churned { Outcome::Churned } else { Outcome::Active })
                })
                .collect();
            let metrics = evaluate_predictions(predictions.clone(), threshold);
            prop_assert_eq!(
                metrics.true_positives
                    + metrics.false_positives
                    + metrics.true_negatives
                    + metrics.false_negatives,
                predictions.len()
            );
            prop_assert_eq!(metrics.total_predictions, predictions.len());
            for rate in [metrics.accuracy, metrics.precision, metrics.recall, metrics.f1_score] {
                prop_assert!(rate.is_finite());
                prop_assert!((0.0..=1.0).contains(&rate));
            }
        }
    }
}
