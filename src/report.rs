use std::fmt::Write;

use chrono::NaiveDate;

use crate::backtest::{ApplyReason, Comparison, Projection, Verdict};
use crate::models::{
    AccuracyMetrics, LearningEvent, RiskLevel, RiskLevelSummary, StudentScore, WeightSet,
};
use crate::weights;

const MAX_RISK_FACTORS: usize = 5;
const MAX_PROTECTIVE_FACTORS: usize = 3;

pub fn percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

fn signed_percent(value: f64) -> String {
    format!("{:+.1} pts", value * 100.0)
}

pub fn summarize_by_level(scores: &[StudentScore]) -> Vec<RiskLevelSummary> {
    let mut totals: std::collections::BTreeMap<RiskLevel, (usize, f64)> =
        std::collections::BTreeMap::new();

    for score in scores {
        let entry = totals.entry(score.assessment.risk_level).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += score.assessment.risk_score;
    }

    totals
        .into_iter()
        .rev()
        .map(|(level, (count, total))| RiskLevelSummary {
            level,
            count,
            avg_score: if count == 0 { 0.0 } else { total / count as f64 },
        })
        .collect()
}

pub fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Apply(ApplyReason::FewerMissedChurn) => "apply: fewer missed churns",
        Verdict::Apply(ApplyReason::AccuracyGain) => "apply: accuracy gain",
        Verdict::Keep => "keep current weights",
    }
}

pub fn metrics_lines(metrics: &AccuracyMetrics) -> Vec<String> {
    vec![
        format!(
            "accuracy {} | precision {} | recall {} | F1 {}",
            percent(metrics.accuracy),
            percent(metrics.precision),
            percent(metrics.recall),
            percent(metrics.f1_score)
        ),
        format!(
            "TP {} | FP {} | TN {} | FN {} (missed churn) | {} predictions",
            metrics.true_positives,
            metrics.false_positives,
            metrics.true_negatives,
            metrics.false_negatives,
            metrics.total_predictions
        ),
    ]
}

pub fn comparison_lines(comparison: &Comparison) -> Vec<String> {
    vec![
        format!(
            "accuracy {} -> {} ({})",
            percent(comparison.before.accuracy),
            percent(comparison.after.accuracy),
            signed_percent(comparison.accuracy_delta)
        ),
        format!(
            "precision {} | recall {} | F1 {}",
            signed_percent(comparison.precision_delta),
            signed_percent(comparison.recall_delta),
            signed_percent(comparison.f1_delta)
        ),
        format!(
            "missed churn {} -> {} ({:+})",
            comparison.before.false_negatives,
            comparison.after.false_negatives,
            comparison.false_negative_delta
        ),
        format!("verdict: {}", verdict_label(comparison.verdict)),
    ]
}

pub struct ReportInput<'a> {
    pub generated_on: NaiveDate,
    pub weights: &'a WeightSet,
    pub scores: &'a [StudentScore],
    pub projection: &'a Projection,
    pub comparison: Option<&'a Comparison>,
    pub events: &'a [LearningEvent],
}

pub fn build_report(input: &ReportInput<'_>) -> String {
    let summaries = summarize_by_level(input.scores);
    let mut output = String::new();

    let _ = writeln!(output, "# Student Churn Risk Report");
    let _ = writeln!(output, "Generated on {}", input.generated_on);
    let _ = writeln!(output);

    let validation = weights::validate(input.weights);
    let _ = writeln!(output, "## Current Weights");
    for (category, weight) in input.weights.iter() {
        let _ = writeln!(output, "- {}: {}", category.label(), percent(*weight));
    }
    let _ = writeln!(
        output,
        "Total {} ({})",
        percent(validation.sum),
        if validation.is_valid { "valid" } else { "invalid" }
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Distribution");
    if summaries.is_empty() {
        let _ = writeln!(output, "No students scored.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} students (avg score {:.2})",
                summary.level, summary.count, summary.avg_score
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");
    if input.scores.is_empty() {
        let _ = writeln!(output, "No students scored.");
    } else {
        for score in input.scores.iter().take(10) {
            let assessment = &score.assessment;
            let _ = writeln!(
                output,
                "- {} ({}) {} risk, score {:.2}",
                score.full_name, score.email, assessment.risk_level, assessment.risk_score
            );
            let risk: Vec<&str> = assessment
                .risk_factors()
                .iter()
                .take(MAX_RISK_FACTORS)
                .map(|factor| factor.category.label())
                .collect();
            if !risk.is_empty() {
                let _ = writeln!(output, "  - risk factors: {}", risk.join(", "));
            }
            let protective: Vec<&str> = assessment
                .protective_factors()
                .iter()
                .take(MAX_PROTECTIVE_FACTORS)
                .map(|factor| factor.category.label())
                .collect();
            if !protective.is_empty() {
                let _ = writeln!(output, "  - protective: {}", protective.join(", "));
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Backtest");
    for line in metrics_lines(&input.projection.metrics) {
        let _ = writeln!(output, "- {line}");
    }
    if input.projection.excluded_ineligible > 0 {
        let _ = writeln!(
            output,
            "- {} students excluded (outcome unknown or tenure too short)",
            input.projection.excluded_ineligible
        );
    }
    if let Some(comparison) = input.comparison {
        let _ = writeln!(output);
        let _ = writeln!(output, "### Candidate Weights");
        for line in comparison_lines(comparison) {
            let _ = writeln!(output, "- {line}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Learning Events");
    if input.events.is_empty() {
        let _ = writeln!(output, "No learning events recorded.");
    } else {
        for event in input.events.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} {}: predicted {} ({:.2}), {}. {}",
                event.churn_date,
                event.actual_outcome,
                event.predicted_level,
                event.predicted_risk,
                if event.was_prediction_correct { "correct" } else { "missed" },
                event.rationale
            );
        }
    }

    output
}
