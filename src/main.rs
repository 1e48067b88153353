use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod backtest;
mod cache;
mod config;
mod db;
mod error;
mod learning;
mod models;
mod normalize;
mod report;
mod risk;
mod weights;

use crate::config::EngineConfig;
use crate::db::ChurnStore;
use crate::models::{Outcome, RiskAssessment, StudentRecord, WeightSet};
use crate::risk::Scorer;

#[derive(Parser)]
#[command(name = "churn-risk")]
#[command(
    about = "Churn-risk scoring and weight refinement for tutoring students",
    long_about = None
)]
struct Cli {
    /// Engine policy file (TOML)
    #[arg(long, global = true, env = "CHURN_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import students and their features from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Inspect or change the applied weight set
    Weights {
        #[command(subcommand)]
        action: WeightsCommand,
    },
    /// Score students with the applied weights
    Score {
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Store each assessment as a prediction snapshot
        #[arg(long)]
        persist: bool,
    },
    /// Compare applied weights against a candidate on historical outcomes
    Backtest {
        #[arg(long)]
        candidate: PathBuf,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    /// Record a confirmed outcome and derive a learning event
    RecordOutcome {
        #[arg(long)]
        email: String,
        #[arg(long, value_enum)]
        outcome: Outcome,
        #[arg(long)]
        survey: Option<String>,
        /// Date the outcome was confirmed (defaults to the stored churn date, then today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show a weight recommendation for one student
    CaseStudy {
        #[arg(long)]
        email: String,
    },
    /// List recorded learning events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        candidate: Option<PathBuf>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum WeightsCommand {
    /// Print the applied weights
    Show,
    /// Replace the applied weights with a JSON file
    Set {
        #[arg(long)]
        file: PathBuf,
    },
    /// Edit individual weights, e.g. --assign response_rate=0.15
    Edit {
        #[arg(long = "assign", required = true)]
        assignments: Vec<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_weight_file(path: &Path) -> anyhow::Result<WeightSet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    weights::from_json(&text).with_context(|| format!("invalid weight file {}", path.display()))
}

fn print_weights(weights: &WeightSet) {
    for (category, weight) in weights.iter() {
        println!("  {:<28} {:.3}", category.as_str(), weight);
    }
    let validation = weights::validate(weights);
    println!(
        "  {:<28} {:.3} ({})",
        "total",
        validation.sum,
        if validation.is_valid { "valid" } else { "invalid" }
    );
}

/// The stored prediction if one exists, otherwise a live score.
async fn prediction_for(
    store: &ChurnStore,
    scorer: &Scorer,
    student: &StudentRecord,
) -> anyhow::Result<RiskAssessment> {
    if let Some(assessment) = store.latest_assessment(student.id).await? {
        return Ok(assessment);
    }
    warn!(email = %student.email, "no stored prediction, scoring with current weights");
    let weights = store.current_weights().await?;
    Ok(scorer.score(&student.features, &weights)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = EngineConfig::load(cli.config.as_deref())?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = ChurnStore::new(pool, &config.cache);
    let scorer = Scorer::new(normalize::default_normalizers(), config.risk_thresholds);
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(store.pool()).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let imported = db::import_csv(store.pool(), &csv).await?;
            println!("Imported {imported} students from {}.", csv.display());
        }
        Commands::Weights { action } => match action {
            WeightsCommand::Show => {
                let weights = store.current_weights().await?;
                println!("Applied weights:");
                print_weights(&weights);
            }
            WeightsCommand::Set { file } => {
                let weights = read_weight_file(&file)?;
                store.save_weights(&weights).await?;
                println!("Applied weights from {}:", file.display());
                print_weights(&weights);
            }
            WeightsCommand::Edit { assignments } => {
                let mut draft = weights::WeightDraft::new(store.current_weights().await?);
                for raw in &assignments {
                    let (category, weight) = weights::parse_assignment(raw)?;
                    draft.set(category, weight);
                }
                if !draft.is_dirty() {
                    println!("No changes.");
                    return Ok(());
                }

                println!("Draft weights:");
                print_weights(draft.draft());
                let validation = draft.validation();
                if !validation.is_valid {
                    draft.reset();
                    println!(
                        "Draft sums to {:.3}, not 1.0. Applied weights unchanged:",
                        validation.sum
                    );
                    print_weights(draft.applied());
                    return Ok(());
                }

                let promoted = draft.promote().context("draft was not saved")?;
                store.save_weights(&promoted).await?;
                println!("Draft applied.");
            }
        },
        Commands::Score {
            email,
            limit,
            persist,
        } => {
            let weights = store.current_weights().await?;
            let students = match email.as_deref() {
                Some(email) => vec![store.student_by_email(email).await?],
                None => Vec::clone(&*store.students().await?),
            };
            let scores = risk::score_students(&students, &weights, &scorer)?;

            if scores.is_empty() {
                println!("No students found.");
                return Ok(());
            }

            println!("Top students by churn risk:");
            for score in scores.iter().take(limit) {
                println!(
                    "- {} ({}) {} risk, score {:.2}",
                    score.full_name,
                    score.email,
                    score.assessment.risk_level,
                    score.assessment.risk_score
                );
                for factor in score.assessment.risk_factors().iter().take(3) {
                    println!(
                        "    {} contributes {:.3}",
                        factor.category.label(),
                        factor.contribution_to_risk
                    );
                }
            }

            if persist {
                for score in &scores {
                    store.save_assessment(score.student_id, &score.assessment).await?;
                }
                info!(count = scores.len(), "stored prediction snapshots");
                println!("Stored {} prediction snapshots.", scores.len());
            }
        }
        Commands::Backtest {
            candidate,
            threshold,
            json,
        } => {
            let current = store.current_weights().await?;
            let candidate_weights = read_weight_file(&candidate)?;
            let validation = weights::validate(&candidate_weights);
            if !validation.is_valid {
                warn!(sum = validation.sum, "candidate weights do not sum to 1.0");
            }

            let students = store.students().await?;
            let cohort = backtest::build_cohort(&students, today, config.min_active_days);
            let threshold = threshold.unwrap_or(config.decision_threshold);

            let before = backtest::project_accuracy(&cohort, &current, &scorer, threshold)?;
            let after =
                backtest::project_accuracy(&cohort, &candidate_weights, &scorer, threshold)?;
            let comparison =
                backtest::compare(&before.metrics, &after.metrics, &config.recommendation_policy());

            if json {
                println!("{}", serde_json::to_string_pretty(&comparison)?);
                return Ok(());
            }

            println!("Applied weights:");
            for line in report::metrics_lines(&before.metrics) {
                println!("  {line}");
            }
            println!("Candidate weights (sum {:.3}):", validation.sum);
            for line in report::metrics_lines(&after.metrics) {
                println!("  {line}");
            }
            println!("Change:");
            for line in report::comparison_lines(&comparison) {
                println!("  {line}");
            }
            if before.excluded_ineligible > 0 {
                println!(
                    "{} students excluded (outcome unknown or tenure under {} days).",
                    before.excluded_ineligible, config.min_active_days
                );
            }
        }
        Commands::RecordOutcome {
            email,
            outcome,
            survey,
            date,
        } => {
            let student = store.student_by_email(&email).await?;
            if store.learning_event_for(student.id).await?.is_some() {
                println!("Outcome for {email} is already recorded.");
                return Ok(());
            }

            let outcome_date = learning::outcome_date_for(
                &student,
                outcome,
                date,
                today,
                config.min_active_days,
            )
            .with_context(|| format!("cannot record {outcome} for {email}"))?;

            let assessment = prediction_for(&store, &scorer, &student).await?;
            let event = learning::record_outcome(
                student.id,
                &assessment,
                outcome,
                outcome_date,
                survey,
                &config.learning,
            )?;

            if !store.append_learning_event(&event).await? {
                println!("Outcome for {email} is already recorded.");
                return Ok(());
            }

            println!(
                "Recorded {} for {} (prediction {}).",
                event.actual_outcome,
                student.full_name,
                if event.was_prediction_correct { "correct" } else { "missed" }
            );
            println!("{}", event.rationale);
            if !event.was_prediction_correct {
                println!("Suggested weights:");
                print_weights(&event.suggested_weights);
            }
        }
        Commands::CaseStudy { email } => {
            let student = store.student_by_email(&email).await?;
            let current = store.current_weights().await?;
            let study = match store.learning_event_for(student.id).await? {
                Some(event) => learning::case_study_from_event(&event, &current),
                None => {
                    let assessment = prediction_for(&store, &scorer, &student).await?;
                    learning::case_study_for_student(
                        student.id,
                        &assessment,
                        student.ground_truth(today, config.min_active_days),
                        &config.learning,
                    )?
                }
            };
            println!("{}", serde_json::to_string_pretty(&study)?);
        }
        Commands::Events { limit } => {
            let events = store.learning_events(limit).await?;
            if events.is_empty() {
                println!("No learning events recorded.");
                return Ok(());
            }
            for event in &events {
                println!(
                    "- {} {} {}: predicted {} ({:.2}) {}",
                    event.created_at.format("%Y-%m-%d"),
                    event.student_id,
                    event.actual_outcome,
                    event.predicted_level,
                    event.predicted_risk,
                    if event.was_prediction_correct { "correct" } else { "missed" }
                );
            }
        }
        Commands::Report { candidate, out } => {
            let weights = store.current_weights().await?;
            let students = store.students().await?;
            let scores = risk::score_students(&students, &weights, &scorer)?;

            let cohort = backtest::build_cohort(&students, today, config.min_active_days);
            let projection =
                backtest::project_accuracy(&cohort, &weights, &scorer, config.decision_threshold)?;
            let comparison = match candidate {
                Some(path) => {
                    let candidate_weights = read_weight_file(&path)?;
                    let after = backtest::project_accuracy(
                        &cohort,
                        &candidate_weights,
                        &scorer,
                        config.decision_threshold,
                    )?;
                    Some(backtest::compare(
                        &projection.metrics,
                        &after.metrics,
                        &config.recommendation_policy(),
                    ))
                }
                None => None,
            };
            let events = store.learning_events(5).await?;

            let report = report::build_report(&report::ReportInput {
                generated_on: today,
                weights: &weights,
                scores: &scores,
                projection: &projection,
                comparison: comparison.as_ref(),
                events: &events,
            });
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
