//! Submission and read boundary for jobs.
//!
//! Every check here runs before a job record exists: a rejected submission
//! never produces a Failed job. Reads are owner-scoped; a job belonging to
//! someone else is `Forbidden`, a missing one `NotFound`.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use adsight_ai::AnalysisResults;
use adsight_core::{AnalysisJobId, OwnerId, ReportJobId};
use adsight_jobs::{
    AnalysisJob, AnalysisStatus, AnalysisSubmission, ReportJob, ReportSource, ReportStatus,
    ReportSubmission, SourceDescriptor,
};

use crate::accounts::AccountDirectory;
use crate::jobs::{JobStats, JobStore};
use crate::orchestrator::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionLimits {
    pub max_upload_bytes: usize,
    /// Cap on list results regardless of the requested limit.
    pub max_list: usize,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 200 * 1024 * 1024,
            max_list: 100,
        }
    }
}

/// An owner's unfinished jobs.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub analyses: Vec<AnalysisJob>,
    pub reports: Vec<ReportJob>,
}

impl QueueStatus {
    pub fn is_empty(&self) -> bool {
        self.analyses.is_empty() && self.reports.is_empty()
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountDirectory>,
    limits: SubmissionLimits,
}

impl core::fmt::Debug for JobService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobService")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, accounts: Arc<dyn AccountDirectory>, limits: SubmissionLimits) -> Self {
        Self {
            store,
            accounts,
            limits,
        }
    }

    /// Accept an upload (raw bytes or parsed rows) as a new Pending analysis.
    #[instrument(skip(self, source, notify_to), fields(owner = %owner, filename = %source.filename), err)]
    pub async fn submit_analysis(
        &self,
        owner: OwnerId,
        source: SourceDescriptor,
        notify_to: Option<String>,
    ) -> Result<AnalysisJob, OrchestratorError> {
        source.validate(self.limits.max_upload_bytes)?;
        let notify_to = validate_destination(notify_to)?;

        self.create_analysis(AnalysisSubmission {
            owner,
            source,
            notify_to,
            retry_of: None,
        })
        .await
    }

    /// Accept a report request once its source exists and belongs to `owner`.
    ///
    /// The source analysis does not have to be finished yet.
    #[instrument(skip(self, notify_to), fields(owner = %owner, source = source.source_type()), err)]
    pub async fn submit_report(
        &self,
        owner: OwnerId,
        source: ReportSource,
        notify_to: Option<String>,
    ) -> Result<ReportJob, OrchestratorError> {
        self.check_report_source(owner, source).await?;
        let notify_to = validate_destination(notify_to)?;

        self.create_report(ReportSubmission {
            owner,
            source,
            notify_to,
            retry_of: None,
        })
        .await
    }

    pub async fn get_analysis(&self, owner: OwnerId, id: AnalysisJobId) -> Result<AnalysisJob, OrchestratorError> {
        let job = self
            .store
            .get_analysis(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("analysis {id}")))?;
        if job.owner != owner {
            return Err(OrchestratorError::Forbidden(format!("analysis {id}")));
        }
        Ok(job)
    }

    pub async fn get_report(&self, owner: OwnerId, id: ReportJobId) -> Result<ReportJob, OrchestratorError> {
        let job = self
            .store
            .get_report(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("report {id}")))?;
        if job.owner != owner {
            return Err(OrchestratorError::Forbidden(format!("report {id}")));
        }
        Ok(job)
    }

    /// Results of a completed analysis; `SourceNotReady` until then.
    pub async fn analysis_results(
        &self,
        owner: OwnerId,
        id: AnalysisJobId,
    ) -> Result<AnalysisResults, OrchestratorError> {
        let job = self.get_analysis(owner, id).await?;
        job.results().cloned().ok_or_else(|| {
            OrchestratorError::SourceNotReady(format!("analysis {id} is {}", job.status()))
        })
    }

    pub async fn list_analyses(&self, owner: OwnerId, limit: usize) -> Result<Vec<AnalysisJob>, OrchestratorError> {
        Ok(self
            .store
            .list_analyses(owner, &[], limit.min(self.limits.max_list))
            .await?)
    }

    pub async fn list_reports(&self, owner: OwnerId, limit: usize) -> Result<Vec<ReportJob>, OrchestratorError> {
        Ok(self
            .store
            .list_reports(owner, &[], limit.min(self.limits.max_list))
            .await?)
    }

    /// Pending and in-flight jobs for `owner`.
    pub async fn queue_status(&self, owner: OwnerId) -> Result<QueueStatus, OrchestratorError> {
        let analyses = self
            .store
            .list_analyses(
                owner,
                &[AnalysisStatus::Pending, AnalysisStatus::Processing],
                self.limits.max_list,
            )
            .await?;
        let reports = self
            .store
            .list_reports(
                owner,
                &[ReportStatus::Pending, ReportStatus::Generating],
                self.limits.max_list,
            )
            .await?;
        Ok(QueueStatus { analyses, reports })
    }

    /// Re-run a failed analysis as a fresh job. The failed record is untouched.
    #[instrument(skip(self), fields(owner = %owner, job_id = %id), err)]
    pub async fn retry_analysis(&self, owner: OwnerId, id: AnalysisJobId) -> Result<AnalysisJob, OrchestratorError> {
        let failed = self.get_analysis(owner, id).await?;
        let submission = failed.resubmission().map_err(|_| {
            OrchestratorError::Validation(format!(
                "only failed analyses can be retried (analysis {id} is {})",
                failed.status()
            ))
        })?;
        self.create_analysis(submission).await
    }

    #[instrument(skip(self), fields(owner = %owner, job_id = %id), err)]
    pub async fn retry_report(&self, owner: OwnerId, id: ReportJobId) -> Result<ReportJob, OrchestratorError> {
        let failed = self.get_report(owner, id).await?;
        let submission = failed.resubmission().map_err(|_| {
            OrchestratorError::Validation(format!(
                "only failed reports can be retried (report {id} is {})",
                failed.status()
            ))
        })?;
        // The source may have changed hands or been disconnected since.
        self.check_report_source(owner, submission.source).await?;
        self.create_report(submission).await
    }

    pub async fn stats(&self, owner: OwnerId) -> Result<JobStats, OrchestratorError> {
        Ok(self.store.stats(owner).await?)
    }

    async fn create_analysis(&self, submission: AnalysisSubmission) -> Result<AnalysisJob, OrchestratorError> {
        let job = AnalysisJob::submit(AnalysisJobId::new(), submission, Utc::now());
        self.store.insert_analysis(&job).await?;
        info!(job_id = %job.id, retry_of = ?job.retry_of, "analysis submitted");
        Ok(job)
    }

    async fn create_report(&self, submission: ReportSubmission) -> Result<ReportJob, OrchestratorError> {
        let job = ReportJob::submit(ReportJobId::new(), submission, Utc::now());
        self.store.insert_report(&job).await?;
        info!(job_id = %job.id, retry_of = ?job.retry_of, "report submitted");
        Ok(job)
    }

    async fn check_report_source(&self, owner: OwnerId, source: ReportSource) -> Result<(), OrchestratorError> {
        match source {
            ReportSource::FromAnalysis { analysis_id } => {
                self.get_analysis(owner, analysis_id).await?;
            }
            ReportSource::FromLiveAccount { account_id } => {
                let account = self
                    .accounts
                    .lookup(account_id)
                    .filter(|a| a.active)
                    .ok_or_else(|| OrchestratorError::NotFound(format!("active account {account_id}")))?;
                if account.owner != owner {
                    return Err(OrchestratorError::Forbidden(format!("account {account_id}")));
                }
            }
        }
        Ok(())
    }
}

fn validate_destination(notify_to: Option<String>) -> Result<Option<String>, OrchestratorError> {
    match notify_to {
        Some(dest) if dest.trim().is_empty() => Err(OrchestratorError::Validation(
            "notification destination must not be blank".to_string(),
        )),
        other => Ok(other),
    }
}
