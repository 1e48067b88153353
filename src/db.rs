use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{TtlCache, TtlPolicy};
use crate::config::CacheSettings;
use crate::error::ChurnError;
use crate::models::{
    FactorAnalysis, FactorCategory, FactorMap, FeatureVector, LearningEvent, Outcome,
    RiskAssessment, StudentRecord, WeightSet,
};
use crate::weights::{default_weights, ensure_persistable};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO churn_risk.current_weights (singleton, weights)
        VALUES (TRUE, $1)
        ON CONFLICT (singleton) DO NOTHING
        "#,
    )
    .bind(Json(default_weights()))
    .execute(pool)
    .await?;

    if inserted.rows_affected() > 0 {
        info!("installed default weights");
    }
    Ok(())
}

fn feature_columns() -> String {
    FactorCategory::ALL
        .iter()
        .map(|category| category.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn upsert_student(
    pool: &PgPool,
    full_name: &str,
    email: &str,
    enrolled_on: NaiveDate,
    outcome: Option<Outcome>,
    churned_on: Option<NaiveDate>,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO churn_risk.students (id, full_name, email, enrolled_on, status, churned_on)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            enrolled_on = EXCLUDED.enrolled_on,
            status = EXCLUDED.status,
            churned_on = EXCLUDED.churned_on
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(full_name)
    .bind(email)
    .bind(enrolled_on)
    .bind(outcome.map(Outcome::as_str))
    .bind(churned_on)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_features(
    pool: &PgPool,
    student_id: Uuid,
    features: &FeatureVector,
) -> anyhow::Result<()> {
    let placeholders = (2..=FactorCategory::COUNT + 1)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = FactorCategory::ALL
        .iter()
        .map(|category| format!("{0} = EXCLUDED.{0}", category.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO churn_risk.student_features (student_id, {}) VALUES ($1, {}) \
         ON CONFLICT (student_id) DO UPDATE SET {}, updated_at = now()",
        feature_columns(),
        placeholders,
        updates
    );

    let mut query = sqlx::query(&sql).bind(student_id);
    for (_, value) in features.iter() {
        query = query.bind(*value);
    }
    query.execute(pool).await?;
    Ok(())
}

fn features_from_array(values: [f64; FactorCategory::COUNT]) -> FeatureVector {
    let mut iter = values.into_iter();
    FactorMap::from_fn(|_| iter.next().unwrap_or_default())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).context("invalid date");

    // Feature order: satisfaction, sessions, follow-up rate, avg score,
    // tutor consistency, engagement, tutor switches, friction, response rate.
    let students = vec![
        (
            "Avery Lee",
            "avery.lee@example.com",
            date(2025, 6, 2)?,
            Some(Outcome::Active),
            None,
            [4.8, 18.0, 0.85, 8.7, 0.95, 8.0, 0.0, 1.0, 0.9],
        ),
        (
            "Jules Moreno",
            "jules.moreno@example.com",
            date(2025, 8, 11)?,
            Some(Outcome::Churned),
            Some(date(2025, 11, 3)?),
            [2.0, 3.0, 0.2, 5.5, 0.4, 3.5, 2.0, 4.0, 0.35],
        ),
        (
            "Kiara Patel",
            "kiara.patel@example.com",
            date(2025, 9, 15)?,
            Some(Outcome::Churned),
            Some(date(2026, 1, 20)?),
            [4.5, 9.0, 0.3, 7.8, 0.9, 7.0, 0.0, 5.0, 0.8],
        ),
        (
            "Noor Haddad",
            "noor.haddad@example.com",
            date(2025, 4, 21)?,
            Some(Outcome::Active),
            None,
            [3.2, 11.0, 0.6, 6.9, 0.7, 6.0, 1.0, 2.0, 0.7],
        ),
        (
            "Sam Okafor",
            "sam.okafor@example.com",
            date(2026, 1, 12)?,
            Some(Outcome::Active),
            None,
            [4.0, 4.0, 0.5, 7.5, 1.0, 6.5, 0.0, 1.0, 0.85],
        ),
        (
            "Rae Kim",
            "rae.kim@example.com",
            date(2025, 10, 6)?,
            None,
            None,
            [1.5, 2.0, 0.1, 4.0, 0.5, 2.5, 3.0, 5.0, 0.2],
        ),
    ];

    for (full_name, email, enrolled_on, outcome, churned_on, values) in students {
        let id = upsert_student(pool, full_name, email, enrolled_on, outcome, churned_on).await?;
        upsert_features(pool, id, &features_from_array(values)).await?;
    }

    Ok(())
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    full_name: String,
    email: String,
    enrolled_on: NaiveDate,
    status: Option<String>,
    churned_on: Option<NaiveDate>,
    first_session_satisfaction: f64,
    sessions_completed: f64,
    follow_up_booking_rate: f64,
    avg_session_score: f64,
    tutor_consistency: f64,
    student_engagement: f64,
    tutor_switch_frequency: f64,
    scheduling_friction: f64,
    response_rate: f64,
}

#[derive(Debug, Clone)]
pub struct ImportedStudent {
    pub full_name: String,
    pub email: String,
    pub enrolled_on: NaiveDate,
    pub outcome: Option<Outcome>,
    pub churned_on: Option<NaiveDate>,
    pub features: FeatureVector,
}

impl TryFrom<CsvRow> for ImportedStudent {
    type Error = anyhow::Error;

    fn try_from(row: CsvRow) -> anyhow::Result<Self> {
        let outcome = match row.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(value.parse::<Outcome>()?),
        };
        let features = features_from_array([
            row.first_session_satisfaction,
            row.sessions_completed,
            row.follow_up_booking_rate,
            row.avg_session_score,
            row.tutor_consistency,
            row.student_engagement,
            row.tutor_switch_frequency,
            row.scheduling_friction,
            row.response_rate,
        ]);
        if let Some((category, value)) = features.iter().find(|(_, value)| !value.is_finite()) {
            return Err(ChurnError::NonFiniteFeature {
                category,
                value: *value,
            }
            .into());
        }
        Ok(Self {
            full_name: row.full_name,
            email: row.email,
            enrolled_on: row.enrolled_on,
            outcome,
            churned_on: row.churned_on,
            features,
        })
    }
}

/// Parses student rows. Every factor column is required on every row.
pub fn read_students<R: std::io::Read>(reader: R) -> anyhow::Result<Vec<ImportedStudent>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut students = Vec::new();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let row = result.with_context(|| format!("invalid CSV row on line {line}"))?;
        let student = ImportedStudent::try_from(row)
            .with_context(|| format!("invalid CSV row on line {line}"))?;
        students.push(student);
    }

    Ok(students)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let students = read_students(file)?;

    for student in &students {
        let id = upsert_student(
            pool,
            &student.full_name,
            &student.email,
            student.enrolled_on,
            student.outcome,
            student.churned_on,
        )
        .await?;
        upsert_features(pool, id, &student.features).await?;
    }

    info!(count = students.len(), path = %csv_path.display(), "imported students");
    Ok(students.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    CurrentWeights,
    Students,
}

#[derive(Debug, Clone)]
pub enum Cached {
    Weights(WeightSet),
    Students(Arc<Vec<StudentRecord>>),
}

/// Feature provider and persistence for the churn engine.
pub struct ChurnStore {
    pool: PgPool,
    cache: TtlCache<CacheKey, Cached>,
}

impl ChurnStore {
    pub fn new(pool: PgPool, settings: &CacheSettings) -> Self {
        let policy = TtlPolicy::new(settings.students_ttl())
            .with(CacheKey::CurrentWeights, settings.weights_ttl())
            .with(CacheKey::Students, settings.students_ttl());
        Self {
            pool,
            cache: TtlCache::new(policy),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The applied weight set, checked before it is used for live scoring.
    pub async fn current_weights(&self) -> anyhow::Result<WeightSet> {
        if let Some(Cached::Weights(weights)) = self.cache.get(&CacheKey::CurrentWeights) {
            return Ok(weights);
        }

        let row = sqlx::query("SELECT weights FROM churn_risk.current_weights WHERE singleton")
            .fetch_optional(&self.pool)
            .await?;

        let weights = match row {
            Some(row) => {
                let Json(weights): Json<WeightSet> = row
                    .try_get("weights")
                    .context("stored weights are malformed")?;
                ensure_persistable(&weights).context("stored weights are invalid")?;
                weights
            }
            None => {
                warn!("no current weights stored, using defaults; run init-db to persist them");
                default_weights()
            }
        };

        self.cache.set(CacheKey::CurrentWeights, Cached::Weights(weights));
        Ok(weights)
    }

    /// Replaces the current weights in a single statement.
    pub async fn save_weights(&self, weights: &WeightSet) -> anyhow::Result<()> {
        ensure_persistable(weights)?;

        sqlx::query(
            r#"
            INSERT INTO churn_risk.current_weights (singleton, weights, updated_at)
            VALUES (TRUE, $1, now())
            ON CONFLICT (singleton) DO UPDATE
            SET weights = EXCLUDED.weights, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(Json(*weights))
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(&CacheKey::CurrentWeights);
        info!("saved current weights");
        Ok(())
    }

    pub async fn students(&self) -> anyhow::Result<Arc<Vec<StudentRecord>>> {
        if let Some(Cached::Students(students)) = self.cache.get(&CacheKey::Students) {
            return Ok(students);
        }

        let sql = format!(
            "SELECT s.id, s.full_name, s.email, s.enrolled_on, s.status, s.churned_on, {} \
             FROM churn_risk.students s \
             LEFT JOIN churn_risk.student_features f ON f.student_id = s.id \
             ORDER BY s.full_name",
            prefixed_feature_columns()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut students = Vec::with_capacity(rows.len());
        for row in rows {
            students.push(student_from_row(&row)?);
        }
        debug!(count = students.len(), "loaded students");

        let students = Arc::new(students);
        self.cache
            .set(CacheKey::Students, Cached::Students(Arc::clone(&students)));
        Ok(students)
    }

    pub async fn student_by_email(&self, email: &str) -> anyhow::Result<StudentRecord> {
        let sql = format!(
            "SELECT s.id, s.full_name, s.email, s.enrolled_on, s.status, s.churned_on, {} \
             FROM churn_risk.students s \
             LEFT JOIN churn_risk.student_features f ON f.student_id = s.id \
             WHERE s.email = $1",
            prefixed_feature_columns()
        );
        let row = sqlx::query(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("no student with email {email}"))?;
        student_from_row(&row)
    }

    pub async fn save_assessment(
        &self,
        student_id: Uuid,
        assessment: &RiskAssessment,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO churn_risk.risk_assessments
            (id, student_id, risk_score, risk_level, assessment)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(assessment.risk_score)
        .bind(assessment.risk_level.as_str())
        .bind(Json(assessment))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent stored prediction for a student, if any.
    pub async fn latest_assessment(
        &self,
        student_id: Uuid,
    ) -> anyhow::Result<Option<RiskAssessment>> {
        let row = sqlx::query(
            r#"
            SELECT assessment FROM churn_risk.risk_assessments
            WHERE student_id = $1
            ORDER BY assessed_at DESC
            LIMIT 1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let Json(assessment): Json<RiskAssessment> = row.try_get("assessment")?;
                Ok(Some(assessment))
            }
            None => Ok(None),
        }
    }

    /// Stores the event and the student's outcome together. Returns `false`
    /// when the student already has an event; existing events are never
    /// touched.
    pub async fn append_learning_event(&self, event: &LearningEvent) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO churn_risk.learning_events
            (id, student_id, churn_date, predicted_risk, predicted_level, actual_outcome,
             was_prediction_correct, suggested_weights, rationale, factor_analysis,
             survey_response, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (student_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.student_id)
        .bind(event.churn_date)
        .bind(event.predicted_risk)
        .bind(event.predicted_level.as_str())
        .bind(event.actual_outcome.as_str())
        .bind(event.was_prediction_correct)
        .bind(Json(event.suggested_weights))
        .bind(&event.rationale)
        .bind(Json(&event.factor_analysis))
        .bind(event.survey_response.as_deref())
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let churned_on = match event.actual_outcome {
            Outcome::Churned => Some(event.churn_date),
            Outcome::Active => None,
        };
        sqlx::query("UPDATE churn_risk.students SET status = $2, churned_on = $3 WHERE id = $1")
            .bind(event.student_id)
            .bind(event.actual_outcome.as_str())
            .bind(churned_on)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.cache.invalidate(&CacheKey::Students);
        Ok(true)
    }

    pub async fn learning_event_for(
        &self,
        student_id: Uuid,
    ) -> anyhow::Result<Option<LearningEvent>> {
        let row = sqlx::query(&format!("{LEARNING_EVENT_SELECT} WHERE student_id = $1"))
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    pub async fn learning_events(&self, limit: i64) -> anyhow::Result<Vec<LearningEvent>> {
        let rows = sqlx::query(&format!(
            "{LEARNING_EVENT_SELECT} ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}

const LEARNING_EVENT_SELECT: &str = "SELECT id, student_id, churn_date, predicted_risk, \
     predicted_level, actual_outcome, was_prediction_correct, suggested_weights, rationale, \
     factor_analysis, survey_response, created_at FROM churn_risk.learning_events";

fn prefixed_feature_columns() -> String {
    FactorCategory::ALL
        .iter()
        .map(|category| format!("f.{}", category.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn student_from_row(row: &PgRow) -> anyhow::Result<StudentRecord> {
    let email: String = row.get("email");

    let mut entries = Vec::with_capacity(FactorCategory::COUNT);
    for category in FactorCategory::ALL {
        let value: Option<f64> = row.try_get(category.as_str())?;
        let value = value
            .with_context(|| format!("student {email} has no value for {category}"))?;
        entries.push((category.as_str(), value));
    }
    let features = FactorMap::from_entries(entries)?;

    let status: Option<String> = row.get("status");
    let outcome = status.as_deref().map(str::parse::<Outcome>).transpose()?;

    Ok(StudentRecord {
        id: row.get("id"),
        full_name: row.get("full_name"),
        enrolled_on: row.get("enrolled_on"),
        outcome,
        churned_on: row.get("churned_on"),
        email,
        features,
    })
}

fn event_from_row(row: &PgRow) -> anyhow::Result<LearningEvent> {
    let predicted_level: String = row.get("predicted_level");
    let actual_outcome: String = row.get("actual_outcome");
    let Json(suggested_weights): Json<WeightSet> = row.try_get("suggested_weights")?;
    let Json(factor_analysis): Json<Vec<FactorAnalysis>> = row.try_get("factor_analysis")?;

    Ok(LearningEvent {
        id: row.get("id"),
        student_id: row.get("student_id"),
        churn_date: row.get("churn_date"),
        predicted_risk: row.get("predicted_risk"),
        predicted_level: predicted_level.parse()?,
        actual_outcome: actual_outcome.parse()?,
        was_prediction_correct: row.get("was_prediction_correct"),
        suggested_weights,
        rationale: row.get("rationale"),
        factor_analysis,
        survey_response: row.get("survey_response"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "full_name,email,enrolled_on,status,churned_on,first_session_satisfaction,sessions_completed,follow_up_booking_rate,avg_session_score,tutor_consistency,student_engagement,tutor_switch_frequency,scheduling_friction,response_rate";

    #[test]
    fn reads_complete_rows() {
        let data = format!(
            "{HEADER}\n\
             Avery Lee,avery@example.com,2025-06-02,active,,4.8,18,0.85,8.7,0.95,8,0,1,0.9\n\
             Jules Moreno,jules@example.com,2025-08-11,churned,2025-11-03,2,3,0.2,5.5,0.4,3.5,2,4,0.35\n\
             Rae Kim,rae@example.com,2025-10-06,,,1.5,2,0.1,4,0.5,2.5,3,5,0.2\n"
        );
        let students = read_students(data.as_bytes()).unwrap();
        assert_eq!(students.len(), 3);

        assert_eq!(students[0].outcome, Some(Outcome::Active));
        assert_eq!(students[0].features[FactorCategory::SessionsCompleted], 18.0);
        assert_eq!(students[1].outcome, Some(Outcome::Churned));
        assert_eq!(
            students[1].churned_on,
            NaiveDate::from_ymd_opt(2025, 11, 3)
        );
        assert_eq!(students[1].features[FactorCategory::ResponseRate], 0.35);
        assert_eq!(students[2].outcome, None);
    }

    #[test]
    fn missing_feature_cell_fails_with_line() {
        let data = format!(
            "{HEADER}\n\
             Avery Lee,avery@example.com,2025-06-02,active,,4.8,18,0.85,8.7,0.95,8,0,1,0.9\n\
             Jules Moreno,jules@example.com,2025-08-11,churned,2025-11-03,2,3,,5.5,0.4,3.5,2,4,0.35\n"
        );
        let err = read_students(data.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn non_finite_feature_fails_with_line() {
        let data = format!(
            "{HEADER}\n\
             Avery Lee,avery@example.com,2025-06-02,active,,4.8,18,0.85,8.7,0.95,8,0,1,0.9\n\
             Jules Moreno,jules@example.com,2025-08-11,churned,,NaN,3,0.2,5.5,0.4,3.5,inf,4,0.35\n"
        );
        let err = read_students(data.as_bytes()).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("line 3"), "{message}");
        assert!(message.contains("first_session_satisfaction is not finite"), "{message}");
    }

    #[test]
    fn unknown_status_is_rejected() {
        let data = format!(
            "{HEADER}\n\
             Avery Lee,avery@example.com,2025-06-02,paused,,4.8,18,0.85,8.7,0.95,8,0,1,0.9\n"
        );
        let err = read_students(data.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown outcome: paused"));
    }

    #[test]
    fn feature_columns_follow_category_order() {
        let columns = feature_columns();
        assert!(columns.starts_with("first_session_satisfaction, sessions_completed"));
        assert!(columns.ends_with("response_rate"));
        assert!(prefixed_feature_columns().starts_with("f.first_session_satisfaction"));
    }
}
