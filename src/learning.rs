use std::fmt::Write;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ChurnError, Result};
use crate::models::{
    CaseStudyRecommendation, ChurnFactor, FactorAnalysis, FactorMap, FactorRole, LearningEvent,
    Outcome, RiskAssessment, RiskLevel, StudentRecord, WeightSet,
};
use crate::risk::ADVERSE_MIDPOINT;
use crate::weights::apply_adjustments;

/// Which risk levels count as a churn prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionPolicy {
    #[default]
    MediumOrHigh,
    HighOnly,
}

impl PredictionPolicy {
    pub fn predicts_churn(self, level: RiskLevel) -> bool {
        match self {
            PredictionPolicy::MediumOrHigh => level >= RiskLevel::Medium,
            PredictionPolicy::HighOnly => level == RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    pub prediction_policy: PredictionPolicy,
    /// Largest weight change proposed for a single factor.
    pub nudge_step: f64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            prediction_policy: PredictionPolicy::default(),
            nudge_step: 0.05,
        }
    }
}

impl LearningSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.nudge_step > 0.0 && self.nudge_step <= 0.5) {
            return Err(ChurnError::InvalidConfig(format!(
                "nudge_step must be in (0, 0.5], got {}",
                self.nudge_step
            )));
        }
        Ok(())
    }
}

fn role_for(factor: &ChurnFactor, actual: Outcome) -> FactorRole {
    match (actual, factor.is_adverse()) {
        (Outcome::Churned, true) | (Outcome::Active, false) => FactorRole::Confirming,
        (Outcome::Churned, false) | (Outcome::Active, true) => FactorRole::Misfired,
    }
}

/// How far from neutral the factor was, in [0, 1].
fn signal_strength(factor: &ChurnFactor) -> f64 {
    ((factor.normalized_score - ADVERSE_MIDPOINT).abs() * 2.0).min(1.0)
}

/// Proposes weights that would have leaned toward `actual`. Weight moves
/// from misfired factors to confirming ones, each side in proportion to how
/// strongly its factors signaled, so the total stays at 1.0. No single
/// factor moves by more than `nudge_step`.
pub fn analyze_factors(
    assessment: &RiskAssessment,
    actual: Outcome,
    nudge_step: f64,
) -> Result<(Vec<FactorAnalysis>, WeightSet)> {
    let mut entries = Vec::with_capacity(assessment.factors.len());
    let mut available_loss = 0.0;
    let mut wanted_gain = 0.0;

    for factor in &assessment.factors {
        let strength = signal_strength(factor);
        if strength == 0.0 {
            continue;
        }
        let role = role_for(factor, actual);
        let amount = match role {
            FactorRole::Misfired => (nudge_step * strength).min(factor.weight.max(0.0)),
            FactorRole::Confirming => nudge_step * strength,
        };
        match role {
            FactorRole::Misfired => available_loss += amount,
            FactorRole::Confirming => wanted_gain += amount,
        }
        entries.push((factor, role, amount));
    }

    let moved = f64::min(available_loss, wanted_gain);
    let suggested = if moved > 0.0 {
        let mut deltas = FactorMap::from_fn(|_| 0.0);
        for &(factor, role, amount) in &entries {
            deltas[factor.category] = match role {
                FactorRole::Misfired => -moved * amount / available_loss,
                FactorRole::Confirming => moved * amount / wanted_gain,
            };
        }
        apply_adjustments(&assessment.weights, &deltas)?
    } else {
        assessment.weights
    };

    let mut analysis: Vec<FactorAnalysis> = entries
        .into_iter()
        .map(|(factor, role, _)| FactorAnalysis {
            category: factor.category,
            normalized_score: factor.normalized_score,
            role,
            current_weight: assessment.weights[factor.category],
            suggested_weight: suggested[factor.category],
            delta: suggested[factor.category] - assessment.weights[factor.category],
        })
        .collect();

    analysis.sort_by(|a, b| {
        let misfired_first =
            (b.role == FactorRole::Misfired).cmp(&(a.role == FactorRole::Misfired));
        misfired_first.then(
            b.delta
                .abs()
                .partial_cmp(&a.delta.abs())
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    Ok((analysis, suggested))
}

fn outcome_phrase(actual: Outcome) -> &'static str {
    match actual {
        Outcome::Churned => "the student churned",
        Outcome::Active => "the student stayed active",
    }
}

fn join_labels<'a>(analysis: impl Iterator<Item = &'a FactorAnalysis>) -> String {
    analysis
        .map(|entry| entry.category.label())
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_rationale(
    assessment: &RiskAssessment,
    actual: Outcome,
    correct: bool,
    analysis: &[FactorAnalysis],
    survey_response: Option<&str>,
) -> String {
    let mut rationale = String::new();
    let _ = write!(
        rationale,
        "Predicted {} risk ({:.2}) and {}.",
        assessment.risk_level,
        assessment.risk_score,
        outcome_phrase(actual)
    );

    if correct {
        rationale.push_str(" The prediction held; weights are unchanged.");
    } else {
        let misfired: Vec<&FactorAnalysis> = analysis
            .iter()
            .filter(|entry| entry.role == FactorRole::Misfired)
            .collect();
        let confirming: Vec<&FactorAnalysis> = analysis
            .iter()
            .filter(|entry| entry.role == FactorRole::Confirming)
            .collect();

        if !misfired.is_empty() {
            let direction = match actual {
                Outcome::Churned => "looked protective",
                Outcome::Active => "signaled risk",
            };
            let _ = write!(
                rationale,
                " Misfired: {} {} but did not anticipate the outcome.",
                join_labels(misfired.iter().copied()),
                direction
            );
        }
        let shifted = analysis.iter().any(|entry| entry.delta != 0.0);
        if shifted {
            let _ = write!(
                rationale,
                " Shift weight toward {}.",
                join_labels(confirming.iter().copied())
            );
        } else if misfired.is_empty() || confirming.is_empty() {
            rationale.push_str(
                " Every signal pointed the same way, so no reweighting separates this case.",
            );
        } else {
            rationale
                .push_str(" The misfired factors carry no weight, so there is nothing to shift.");
        }
    }

    if let Some(survey) = survey_response {
        let _ = write!(rationale, " Exit survey: \"{}\".", survey.trim());
    }

    rationale
}

/// Date to record `actual` against, after checking the student can take
/// that outcome. The date defaults to the stored churn date, then `today`.
/// An active outcome needs `min_active_days` of tenure by that date and is
/// refused for a student already recorded as churned.
pub fn outcome_date_for(
    student: &StudentRecord,
    actual: Outcome,
    requested: Option<NaiveDate>,
    today: NaiveDate,
    min_active_days: i64,
) -> Result<NaiveDate> {
    let outcome_date = requested.or(student.churned_on).unwrap_or(today);
    if outcome_date < student.enrolled_on {
        return Err(ChurnError::OutcomeBeforeEnrollment {
            outcome_date,
            enrolled_on: student.enrolled_on,
        });
    }

    if actual == Outcome::Active {
        if student.outcome == Some(Outcome::Churned) {
            return Err(ChurnError::OutcomeConflict {
                recorded: Outcome::Churned,
                requested: Outcome::Active,
            });
        }
        let tenure_days = (outcome_date - student.enrolled_on).num_days();
        if tenure_days < min_active_days {
            return Err(ChurnError::TenureTooShort {
                tenure_days,
                min_active_days,
            });
        }
    }

    Ok(outcome_date)
}

/// Builds the audit record for a confirmed outcome.
pub fn record_outcome(
    student_id: Uuid,
    assessment: &RiskAssessment,
    actual: Outcome,
    outcome_date: NaiveDate,
    survey_response: Option<String>,
    settings: &LearningSettings,
) -> Result<LearningEvent> {
    let predicted_churn = settings.prediction_policy.predicts_churn(assessment.risk_level);
    let correct = predicted_churn == (actual == Outcome::Churned);

    let (factor_analysis, suggested_weights) = if correct {
        (Vec::new(), assessment.weights)
    } else {
        analyze_factors(assessment, actual, settings.nudge_step)?
    };

    let rationale = build_rationale(
        assessment,
        actual,
        correct,
        &factor_analysis,
        survey_response.as_deref(),
    );

    if correct {
        debug!(%student_id, outcome = %actual, "prediction confirmed");
    } else {
        info!(
            %student_id,
            outcome = %actual,
            predicted = %assessment.risk_level,
            misfired = factor_analysis
                .iter()
                .filter(|entry| entry.role == FactorRole::Misfired)
                .count(),
            "prediction contradicted by outcome"
        );
    }

    Ok(LearningEvent {
        id: Uuid::new_v4(),
        student_id,
        churn_date: outcome_date,
        predicted_risk: assessment.risk_score,
        predicted_level: assessment.risk_level,
        actual_outcome: actual,
        was_prediction_correct: correct,
        suggested_weights,
        rationale,
        factor_analysis,
        survey_response,
        created_at: Utc::now(),
    })
}

pub fn case_study_from_event(
    event: &LearningEvent,
    current_weights: &WeightSet,
) -> CaseStudyRecommendation {
    CaseStudyRecommendation {
        student_id: event.student_id,
        predicted_risk: event.predicted_risk,
        predicted_level: event.predicted_level,
        actual_outcome: Some(event.actual_outcome),
        current_weights: *current_weights,
        suggested_weights: event.suggested_weights,
        rationale: event.rationale.clone(),
    }
}

/// Case study for a student with no recorded event. Without a known
/// outcome the current weights are returned unchanged.
pub fn case_study_for_student(
    student_id: Uuid,
    assessment: &RiskAssessment,
    actual: Option<Outcome>,
    settings: &LearningSettings,
) -> Result<CaseStudyRecommendation> {
    let (suggested_weights, rationale) = match actual {
        Some(outcome) => {
            let correct = settings.prediction_policy.predicts_churn(assessment.risk_level)
                == (outcome == Outcome::Churned);
            let (analysis, suggested) = if correct {
                (Vec::new(), assessment.weights)
            } else {
                analyze_factors(assessment, outcome, settings.nudge_step)?
            };
            (
                suggested,
                build_rationale(assessment, outcome, correct, &analysis, None),
            )
        }
        None => {
            let top: Vec<&str> = assessment
                .risk_factors()
                .iter()
                .take(3)
                .map(|factor| factor.category.label())
                .collect();
            let mut rationale = format!(
                "Currently {} risk ({:.2}); outcome not yet known.",
                assessment.risk_level, assessment.risk_score
            );
            if !top.is_empty() {
                let _ = write!(rationale, " Leading risk factors: {}.", top.join(", "));
            }
            (assessment.weights, rationale)
        }
    };

    Ok(CaseStudyRecommendation {
        student_id,
        predicted_risk: assessment.risk_score,
        predicted_level: assessment.risk_level,
        actual_outcome: actual,
        current_weights: assessment.weights,
        suggested_weights,
        rationale,
    })
}
