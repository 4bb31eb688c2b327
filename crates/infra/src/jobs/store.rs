//! Durable job storage contract.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use adsight_core::{AnalysisJobId, JobRef, OwnerId, ReportJobId};
use adsight_jobs::{
    AnalysisJob, AnalysisStatus, Claim, ClaimToken, ReportJob, ReportStatus, TransitionError,
};

/// Job store abstraction.
///
/// The store is the only coordination point between workers. Claims and
/// commits are conditional updates:
/// - `claim_*` succeeds only if the job is Pending, or active under a claim
///   older than `stale_after`; otherwise it fails with `ClaimConflict`.
/// - `commit_*` writes a terminal state only if the stored job is still held
///   by `token`; otherwise it fails with `ClaimConflict` and writes nothing.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert_analysis(&self, job: &AnalysisJob) -> Result<(), JobStoreError>;

    async fn get_analysis(&self, id: AnalysisJobId) -> Result<Option<AnalysisJob>, JobStoreError>;

    /// Owner's jobs, newest first. An empty `statuses` slice matches every status.
    async fn list_analyses(
        &self,
        owner: OwnerId,
        statuses: &[AnalysisStatus],
        limit: usize,
    ) -> Result<Vec<AnalysisJob>, JobStoreError>;

    /// Claimable jobs, oldest first.
    async fn analysis_candidates(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<AnalysisJobId>, JobStoreError>;

    async fn claim_analysis(
        &self,
        id: AnalysisJobId,
        claim: Claim,
        stale_after: Duration,
    ) -> Result<AnalysisJob, JobStoreError>;

    async fn commit_analysis(&self, job: &AnalysisJob, token: ClaimToken) -> Result<(), JobStoreError>;

    async fn insert_report(&self, job: &ReportJob) -> Result<(), JobStoreError>;

    async fn get_report(&self, id: ReportJobId) -> Result<Option<ReportJob>, JobStoreError>;

    async fn list_reports(
        &self,
        owner: OwnerId,
        statuses: &[ReportStatus],
        limit: usize,
    ) -> Result<Vec<ReportJob>, JobStoreError>;

    async fn report_candidates(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<ReportJobId>, JobStoreError>;

    async fn claim_report(
        &self,
        id: ReportJobId,
        claim: Claim,
        stale_after: Duration,
    ) -> Result<ReportJob, JobStoreError>;

    async fn commit_report(&self, job: &ReportJob, token: ClaimToken) -> Result<(), JobStoreError>;

    /// Per-owner counts by status.
    async fn stats(&self, owner: OwnerId) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobRef),
    #[error("job already exists: {0}")]
    AlreadyExists(JobRef),
    /// Another worker holds (or already finished) the job.
    #[error("claim conflict on {0}")]
    ClaimConflict(JobRef),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<TransitionError> for JobStoreError {
    fn from(err: TransitionError) -> Self {
        JobStoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl AnalysisCounts {
    pub fn record(&mut self, status: AnalysisStatus, n: usize) {
        match status {
            AnalysisStatus::Pending => self.pending += n,
            AnalysisStatus::Processing => self.processing += n,
            AnalysisStatus::Completed => self.completed += n,
            AnalysisStatus::Failed => self.failed += n,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounts {
    pub pending: usize,
    pub generating: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ReportCounts {
    pub fn record(&mut self, status: ReportStatus, n: usize) {
        match status {
            ReportStatus::Pending => self.pending += n,
            ReportStatus::Generating => self.generating += n,
            ReportStatus::Completed => self.completed += n,
            ReportStatus::Failed => self.failed += n,
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub analyses: AnalysisCounts,
    pub reports: ReportCounts,
}
