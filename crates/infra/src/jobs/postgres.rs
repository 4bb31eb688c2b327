//! Postgres-backed job store.
//!
//! ## Concurrency
//!
//! Claims are a single `UPDATE ... WHERE <claimable> RETURNING`, so two workers
//! racing for the same row cannot both win: the loser's update matches zero
//! rows and surfaces as `ClaimConflict`. Commits are guarded the same way on
//! `claim_token`, which keeps a worker whose claim was recovered by someone else
//! from overwriting the newer outcome.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database, unique violation (`23505`) on insert | `AlreadyExists` |
//! | Database (other) / PoolClosed / network | `Storage` |
//! | Row decode failure, inconsistent stored state | `Serialization` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use adsight_ai::{AnalysisResults, ArtifactHandle};
use adsight_core::{AccountId, AnalysisJobId, JobRef, OwnerId, ReportJobId};
use adsight_jobs::{
    AnalysisJob, AnalysisState, AnalysisStatus, AnalysisSubmission, Claim, ClaimToken, ReportJob,
    ReportSource, ReportState, ReportStatus, ReportSubmission, SourceDescriptor, SourcePayload,
};
use adsight_metrics::Table;

use super::store::{JobStats, JobStore, JobStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_jobs (
    id            UUID PRIMARY KEY,
    owner_id      UUID NOT NULL,
    filename      TEXT NOT NULL,
    source_csv    BYTEA,
    source_rows   JSONB,
    notify_to     TEXT,
    retry_of      UUID,
    status        TEXT NOT NULL,
    claim_token   UUID,
    claimed_by    TEXT,
    claimed_at    TIMESTAMPTZ,
    results       JSONB,
    error         TEXT,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    completed_at  TIMESTAMPTZ,
    CHECK ((source_csv IS NULL) <> (source_rows IS NULL)),
    CHECK (results IS NULL OR error IS NULL)
);
CREATE INDEX IF NOT EXISTS analysis_jobs_owner_idx ON analysis_jobs (owner_id, created_at DESC);
CREATE INDEX IF NOT EXISTS analysis_jobs_queue_idx ON analysis_jobs (status, created_at);

CREATE TABLE IF NOT EXISTS report_jobs (
    id            UUID PRIMARY KEY,
    owner_id      UUID NOT NULL,
    source_type   TEXT NOT NULL,
    analysis_ref  UUID,
    account_ref   UUID,
    notify_to     TEXT,
    retry_of      UUID,
    status        TEXT NOT NULL,
    claim_token   UUID,
    claimed_by    TEXT,
    claimed_at    TIMESTAMPTZ,
    artifact      TEXT,
    error         TEXT,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    completed_at  TIMESTAMPTZ,
    CHECK ((analysis_ref IS NULL) <> (account_ref IS NULL)),
    CHECK (artifact IS NULL OR error IS NULL)
);
CREATE INDEX IF NOT EXISTS report_jobs_owner_idx ON report_jobs (owner_id, created_at DESC);
CREATE INDEX IF NOT EXISTS report_jobs_queue_idx ON report_jobs (status, created_at);
"#;

const ANALYSIS_COLUMNS: &str = "id, owner_id, filename, source_csv, source_rows, notify_to, retry_of, \
     status, claim_token, claimed_by, claimed_at, results, error, created_at, updated_at, completed_at";

const REPORT_COLUMNS: &str = "id, owner_id, source_type, analysis_ref, account_ref, notify_to, retry_of, \
     status, claim_token, claimed_by, claimed_at, artifact, error, created_at, updated_at, completed_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect and make sure the job tables exist.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert_analysis(&self, job: &AnalysisJob) -> Result<(), JobStoreError> {
        let (source_csv, source_rows) = match &job.source.payload {
            SourcePayload::Csv(bytes) => (Some(bytes.as_slice()), None),
            SourcePayload::Rows(table) => (None, Some(to_json(table)?)),
        };

        sqlx::query(
            r#"
            INSERT INTO analysis_jobs
                (id, owner_id, filename, source_csv, source_rows, notify_to, retry_of,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner.as_uuid())
        .bind(&job.source.filename)
        .bind(source_csv)
        .bind(source_rows)
        .bind(&job.notify_to)
        .bind(job.retry_of.map(|id| *id.as_uuid()))
        .bind(job.status().as_str())
        .bind(job.created_at)
        .bind(job.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_insert_error(JobRef::Analysis(job.id), e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_analysis(&self, id: AnalysisJobId) -> Result<Option<AnalysisJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {ANALYSIS_COLUMNS} FROM analysis_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_analysis", e))?;

        row.as_ref().map(analysis_from_row).transpose()
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn list_analyses(
        &self,
        owner: OwnerId,
        statuses: &[AnalysisStatus],
        limit: usize,
    ) -> Result<Vec<AnalysisJob>, JobStoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analysis_jobs \
             WHERE owner_id = $1 AND (cardinality($2::text[]) = 0 OR status = ANY($2)) \
             ORDER BY created_at DESC, id DESC LIMIT $3"
        ))
        .bind(owner.as_uuid())
        .bind(&statuses)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_analyses", e))?;

        rows.iter().map(analysis_from_row).collect()
    }

    async fn analysis_candidates(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<AnalysisJobId>, JobStoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM analysis_jobs
            WHERE status = 'pending' OR (status = 'processing' AND claimed_at <= $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now - stale_after)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("analysis_candidates", e))?;

        Ok(ids.into_iter().map(AnalysisJobId::from_uuid).collect())
    }

    #[instrument(skip(self, claim), fields(job_id = %id, worker = %claim.worker), err)]
    async fn claim_analysis(
        &self,
        id: AnalysisJobId,
        claim: Claim,
        stale_after: Duration,
    ) -> Result<AnalysisJob, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE analysis_jobs \
             SET status = 'processing', claim_token = $2, claimed_by = $3, claimed_at = $4, updated_at = $4 \
             WHERE id = $1 AND (status = 'pending' OR (status = 'processing' AND claimed_at <= $5)) \
             RETURNING {ANALYSIS_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(claim.token.as_uuid())
        .bind(&claim.worker)
        .bind(claim.claimed_at)
        .bind(claim.claimed_at - stale_after)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_analysis", e))?;

        match row {
            Some(row) => analysis_from_row(&row),
            None => Err(self.missing_or_conflict("analysis_jobs", *id.as_uuid(), id.into()).await),
        }
    }

    #[instrument(skip(self, job, token), fields(job_id = %job.id, status = %job.status()), err)]
    async fn commit_analysis(&self, job: &AnalysisJob, token: ClaimToken) -> Result<(), JobStoreError> {
        let (results, error, completed_at) = match job.state() {
            AnalysisState::Completed { results, completed_at } => {
                (Some(to_json(results)?), None, *completed_at)
            }
            AnalysisState::Failed { error, completed_at } => (None, Some(error.as_str()), *completed_at),
            _ => return Err(JobStoreError::ClaimConflict(job.id.into())),
        };

        let done = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $3, results = $4, error = $5, completed_at = $6, updated_at = $6
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(token.as_uuid())
        .bind(job.status().as_str())
        .bind(results)
        .bind(error)
        .bind(completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("commit_analysis", e))?;

        if done.rows_affected() == 0 {
            return Err(JobStoreError::ClaimConflict(job.id.into()));
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert_report(&self, job: &ReportJob) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO report_jobs
                (id, owner_id, source_type, analysis_ref, account_ref, notify_to, retry_of,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner.as_uuid())
        .bind(job.source.source_type())
        .bind(job.source.analysis_ref().map(|id| *id.as_uuid()))
        .bind(job.source.account_ref().map(|id| *id.as_uuid()))
        .bind(&job.notify_to)
        .bind(job.retry_of.map(|id| *id.as_uuid()))
        .bind(job.status().as_str())
        .bind(job.created_at)
        .bind(job.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_insert_error(JobRef::Report(job.id), e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_report(&self, id: ReportJobId) -> Result<Option<ReportJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {REPORT_COLUMNS} FROM report_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_report", e))?;

        row.as_ref().map(report_from_row).transpose()
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn list_reports(
        &self,
        owner: OwnerId,
        statuses: &[ReportStatus],
        limit: usize,
    ) -> Result<Vec<ReportJob>, JobStoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM report_jobs \
             WHERE owner_id = $1 AND (cardinality($2::text[]) = 0 OR status = ANY($2)) \
             ORDER BY created_at DESC, id DESC LIMIT $3"
        ))
        .bind(owner.as_uuid())
        .bind(&statuses)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_reports", e))?;

        rows.iter().map(report_from_row).collect()
    }

    async fn report_candidates(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<ReportJobId>, JobStoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM report_jobs
            WHERE status = 'pending' OR (status = 'generating' AND claimed_at <= $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now - stale_after)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("report_candidates", e))?;

        Ok(ids.into_iter().map(ReportJobId::from_uuid).collect())
    }

    #[instrument(skip(self, claim), fields(job_id = %id, worker = %claim.worker), err)]
    async fn claim_report(
        &self,
        id: ReportJobId,
        claim: Claim,
        stale_after: Duration,
    ) -> Result<ReportJob, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE report_jobs \
             SET status = 'generating', claim_token = $2, claimed_by = $3, claimed_at = $4, updated_at = $4 \
             WHERE id = $1 AND (status = 'pending' OR (status = 'generating' AND claimed_at <= $5)) \
             RETURNING {REPORT_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(claim.token.as_uuid())
        .bind(&claim.worker)
        .bind(claim.claimed_at)
        .bind(claim.claimed_at - stale_after)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_report", e))?;

        match row {
            Some(row) => report_from_row(&row),
            None => Err(self.missing_or_conflict("report_jobs", *id.as_uuid(), id.into()).await),
        }
    }

    #[instrument(skip(self, job, token), fields(job_id = %job.id, status = %job.status()), err)]
    async fn commit_report(&self, job: &ReportJob, token: ClaimToken) -> Result<(), JobStoreError> {
        let (artifact, error, completed_at) = match job.state() {
            ReportState::Completed { artifact, completed_at } => {
                (Some(artifact.as_str()), None, *completed_at)
            }
            ReportState::Failed { error, completed_at } => (None, Some(error.as_str()), *completed_at),
            _ => return Err(JobStoreError::ClaimConflict(job.id.into())),
        };

        let done = sqlx::query(
            r#"
            UPDATE report_jobs
            SET status = $3, artifact = $4, error = $5, completed_at = $6, updated_at = $6
            WHERE id = $1 AND status = 'generating' AND claim_token = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(token.as_uuid())
        .bind(job.status().as_str())
        .bind(artifact)
        .bind(error)
        .bind(completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("commit_report", e))?;

        if done.rows_affected() == 0 {
            return Err(JobStoreError::ClaimConflict(job.id.into()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn stats(&self, owner: OwnerId) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM analysis_jobs WHERE owner_id = $1 GROUP BY status",
        )
        .bind(owner.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;
        for (status, n) in rows {
            stats.analyses.record(status.parse()?, n.max(0) as usize);
        }

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM report_jobs WHERE owner_id = $1 GROUP BY status",
        )
        .bind(owner.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;
        for (status, n) in rows {
            stats.reports.record(status.parse()?, n.max(0) as usize);
        }

        Ok(stats)
    }
}

impl PostgresJobStore {
    /// A claim matched no row: tell "no such job" apart from "someone else has it".
    async fn missing_or_conflict(&self, table: &str, id: Uuid, job: JobRef) -> JobStoreError {
        let exists = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS (SELECT 1 FROM {table} WHERE id = $1)"
        ))
        .bind(id)
        .fetch_one(&*self.pool)
        .await;

        match exists {
            Ok(false) => JobStoreError::NotFound(job),
            Ok(true) => JobStoreError::ClaimConflict(job),
            Err(e) => map_sqlx_error("claim", e),
        }
    }
}

fn analysis_from_row(row: &PgRow) -> Result<AnalysisJob, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Serialization(format!("failed to decode analysis row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let owner: Uuid = row.try_get("owner_id").map_err(decode)?;
    let filename: String = row.try_get("filename").map_err(decode)?;
    let source_csv: Option<Vec<u8>> = row.try_get("source_csv").map_err(decode)?;
    let source_rows: Option<serde_json::Value> = row.try_get("source_rows").map_err(decode)?;
    let notify_to: Option<String> = row.try_get("notify_to").map_err(decode)?;
    let retry_of: Option<Uuid> = row.try_get("retry_of").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let results: Option<serde_json::Value> = row.try_get("results").map_err(decode)?;
    let error: Option<String> = row.try_get("error").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(decode)?;

    let payload = match (source_csv, source_rows) {
        (Some(bytes), None) => SourcePayload::Csv(bytes),
        (None, Some(rows)) => SourcePayload::Rows(from_json::<Table>(rows)?),
        _ => {
            return Err(JobStoreError::Serialization(format!(
                "analysis {id} must store exactly one source payload"
            )));
        }
    };
    let results = results.map(from_json::<AnalysisResults>).transpose()?;
    let state = AnalysisState::from_parts(status.parse()?, claim_from_row(row)?, results, error, completed_at)?;

    Ok(AnalysisJob::restore(
        AnalysisJobId::from_uuid(id),
        AnalysisSubmission {
            owner: OwnerId::from_uuid(owner),
            source: SourceDescriptor { filename, payload },
            notify_to,
            retry_of: retry_of.map(AnalysisJobId::from_uuid),
        },
        created_at,
        updated_at,
        state,
    ))
}

fn report_from_row(row: &PgRow) -> Result<ReportJob, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Serialization(format!("failed to decode report row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let owner: Uuid = row.try_get("owner_id").map_err(decode)?;
    let source_type: String = row.try_get("source_type").map_err(decode)?;
    let analysis_ref: Option<Uuid> = row.try_get("analysis_ref").map_err(decode)?;
    let account_ref: Option<Uuid> = row.try_get("account_ref").map_err(decode)?;
    let notify_to: Option<String> = row.try_get("notify_to").map_err(decode)?;
    let retry_of: Option<Uuid> = row.try_get("retry_of").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let artifact: Option<String> = row.try_get("artifact").map_err(decode)?;
    let error: Option<String> = row.try_get("error").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(decode)?;

    let source = ReportSource::from_parts(
        &source_type,
        analysis_ref.map(AnalysisJobId::from_uuid),
        account_ref.map(AccountId::from_uuid),
    )?;
    let state = ReportState::from_parts(
        status.parse()?,
        claim_from_row(row)?,
        artifact.map(ArtifactHandle::new),
        error,
        completed_at,
    )?;

    Ok(ReportJob::restore(
        ReportJobId::from_uuid(id),
        ReportSubmission {
            owner: OwnerId::from_uuid(owner),
            source,
            notify_to,
            retry_of: retry_of.map(ReportJobId::from_uuid),
        },
        created_at,
        updated_at,
        state,
    ))
}

fn claim_from_row(row: &PgRow) -> Result<Option<Claim>, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Serialization(format!("failed to decode claim: {e}"));

    let token: Option<Uuid> = row.try_get("claim_token").map_err(decode)?;
    let worker: Option<String> = row.try_get("claimed_by").map_err(decode)?;
    let claimed_at: Option<DateTime<Utc>> = row.try_get("claimed_at").map_err(decode)?;

    let status: String = row.try_get("status").map_err(decode)?;
    let active = status == AnalysisStatus::Processing.as_str() || status == ReportStatus::Generating.as_str();
    if !active {
        // Terminal rows keep the last claim for auditing; it is not part of the state.
        return Ok(None);
    }

    Ok(match (token, worker, claimed_at) {
        (Some(token), Some(worker), Some(claimed_at)) => Some(Claim {
            token: ClaimToken::from_uuid(token),
            worker,
            claimed_at,
        }),
        _ => None,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, JobStoreError> {
    serde_json::from_value(value).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_insert_error(job: JobRef, err: sqlx::Error) -> JobStoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return JobStoreError::AlreadyExists(job);
        }
    }
    map_sqlx_error("insert", err)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
