use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::common::{OwnerId, ReportId, SubmissionId};
use crate::domains::submissions::data::SubmissionStore;
use crate::domains::submissions::models::{AttachmentRef, Report, Segment, SubmissionRecord, Verdict};

pub struct PostgresSubmissionStore {
    pool: PgPool,
}

impl PostgresSubmissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: SubmissionId,
    owner_id: OwnerId,
    channel: String,
    status: String,
    content: Option<String>,
    last_error: Option<String>,
    attachment_refs: Json<Vec<AttachmentRef>>,
    report_ref: Option<ReportId>,
    dispatch_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubmissionRow> for SubmissionRecord {
    type Error = anyhow::Error;

    fn try_from(row: SubmissionRow) -> Result<Self> {
        Ok(SubmissionRecord {
            id: row.id,
            owner_id: row.owner_id,
            channel: row.channel.parse()?,
            status: row.status.parse()?,
            content: row.content,
            last_error: row.last_error,
            attachment_refs: row.attachment_refs.0,
            report_ref: row.report_ref,
            dispatch_attempts: u32::try_from(row.dispatch_attempts).unwrap_or(0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    id: ReportId,
    submission_id: SubmissionId,
    suspicious: bool,
    risk_score: f64,
    reasons: Vec<String>,
    segments: Option<Json<Vec<Segment>>>,
    raw: Json<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for Report {
    type Error = anyhow::Error;

    fn try_from(row: ReportRow) -> Result<Self> {
        let verdict = Verdict::new(
            row.suspicious,
            row.risk_score,
            row.reasons,
            row.segments.map(|s| s.0),
        )?;
        Ok(Report {
            id: row.id,
            submission_id: row.submission_id,
            verdict,
            raw: row.raw.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBMISSION_COLUMNS: &str = "id, owner_id, channel, status, content, last_error, \
     attachment_refs, report_ref, dispatch_attempts, created_at, updated_at";

#[async_trait]
impl SubmissionStore for PostgresSubmissionStore {
    async fn insert(&self, record: &SubmissionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO submissions (
                id, owner_id, channel, status, content, last_error,
                attachment_refs, report_ref, dispatch_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.owner_id)
        .bind(record.channel.as_str())
        .bind(record.status.as_str())
        .bind(&record.content)
        .bind(&record.last_error)
        .bind(Json(&record.attachment_refs))
        .bind(record.report_ref)
        .bind(record.dispatch_attempts as i32)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert submission {}", record.id))?;

        Ok(())
    }

    async fn find(&self, id: SubmissionId) -> Result<Option<SubmissionRecord>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {} FROM submissions WHERE id = $1",
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load submission {}", id))?;

        row.map(SubmissionRecord::try_from).transpose()
    }

    async fn save(&self, record: &SubmissionRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET status = $2,
                last_error = $3,
                attachment_refs = $4,
                report_ref = $5,
                dispatch_attempts = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(Json(&record.attachment_refs))
        .bind(record.report_ref)
        .bind(record.dispatch_attempts as i32)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save submission {}", record.id))?;

        if result.rows_affected() == 0 {
            anyhow::bail!("submission {} does not exist", record.id);
        }
        Ok(())
    }

    async fn find_report(&self, submission_id: SubmissionId) -> Result<Option<Report>> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, submission_id, suspicious, risk_score, reasons, segments, raw,
                   created_at, updated_at
            FROM reports
            WHERE submission_id = $1
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load report for submission {}", submission_id))?;

        row.map(Report::try_from).transpose()
    }

    async fn upsert_report(&self, report: &Report) -> Result<Report> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            INSERT INTO reports (
                id, submission_id, suspicious, risk_score, reasons, segments, raw,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (submission_id) DO UPDATE
            SET suspicious = EXCLUDED.suspicious,
                risk_score = EXCLUDED.risk_score,
                reasons = EXCLUDED.reasons,
                segments = EXCLUDED.segments,
                raw = EXCLUDED.raw,
                updated_at = NOW()
            RETURNING id, submission_id, suspicious, risk_score, reasons, segments, raw,
                      created_at, updated_at
            "#,
        )
        .bind(report.id)
        .bind(report.submission_id)
        .bind(report.verdict.suspicious)
        .bind(report.verdict.risk_score)
        .bind(&report.verdict.reasons)
        .bind(report.verdict.segments.as_ref().map(Json))
        .bind(Json(&report.raw))
        .bind(report.created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to upsert report for submission {}",
                report.submission_id
            )
        })?;

        Report::try_from(row)
    }

    async fn find_awaiting_dispatch(&self) -> Result<Vec<SubmissionRecord>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {} FROM submissions \
             WHERE status IN ('SUBMITTED', 'UPLOADED', 'QUEUED') \
             ORDER BY created_at ASC",
            SUBMISSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to load submissions awaiting dispatch")?;

        rows.into_iter().map(SubmissionRecord::try_from).collect()
    }

    async fn find_dispatched_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SubmissionRecord>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {} FROM submissions \
             WHERE status = 'DISPATCHED' AND updated_at < $1 \
             ORDER BY created_at ASC",
            SUBMISSION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to load stale dispatched submissions")?;

        rows.into_iter().map(SubmissionRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}
