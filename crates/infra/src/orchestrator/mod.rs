//! Job orchestration: claim, run stages, commit, then best-effort extras.
//!
//! ## Failure isolation
//!
//! - Critical stages decide the job outcome. For analyses these are Normalize
//!   and Analyze; for reports, loading the source (FetchSnapshot for live
//!   accounts) and Export. Any failure, including a timeout, commits Failed.
//! - The terminal transition is committed before anything best-effort runs, so
//!   readers see Completed even if the extras hang or fail.
//! - Best-effort stages (analysis Export, Notify) are awaited under a timeout
//!   before the worker moves on. Their failures go to the
//!   [`StageWarningSink`] and never touch the job record.
//!
//! ## Concurrency
//!
//! Workers share nothing in memory except the store handle; whoever wins the
//! store's conditional claim runs the job. Losing a race is `ClaimConflict`:
//! the worker abandons the job without side effects.

pub mod error;
pub mod pool;
pub mod warnings;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use adsight_ai::{
    AccountSnapshot, AnalysisResults, ArtifactHandle, Capabilities, CapabilityError, ExportRequest,
    ExportSource, Notification, ResultsSummary,
};
use adsight_core::{AnalysisJobId, JobRef, OwnerId, ReportJobId};
use adsight_jobs::{AnalysisJob, Claim, ReportJob, ReportSource};
use adsight_metrics::Normalizer;

use crate::jobs::JobStore;

pub use error::{OrchestratorError, Stage};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use warnings::{InMemoryStageWarningSink, StageWarning, StageWarningSink};

/// Upper bound for each stage. Exceeding it is treated as that stage failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub normalize: Duration,
    pub analyze: Duration,
    pub export: Duration,
    pub fetch_snapshot: Duration,
    pub notify: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            normalize: Duration::from_secs(30),
            analyze: Duration::from_secs(120),
            export: Duration::from_secs(60),
            fetch_snapshot: Duration::from_secs(30),
            notify: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub timeouts: StageTimeouts,
    /// Active claims older than this are recovered by other workers.
    pub stale_claim_after: chrono::Duration,
    /// How many candidates one `process_next` call looks at per job kind.
    pub candidate_batch: usize,
    pub normalizer: Normalizer,
    /// Sources larger than this fail before normalization is dispatched.
    pub max_source_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            stale_claim_after: chrono::Duration::seconds(900),
            candidate_batch: 16,
            normalizer: Normalizer::default(),
            max_source_bytes: 200 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
}

/// What happened to one claimed job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: JobRef,
    pub status: TerminalStatus,
    /// The critical failure behind a Failed outcome.
    pub failure: Option<OrchestratorError>,
    /// Best-effort failures after the commit.
    pub warnings: Vec<OrchestratorError>,
}

/// Orchestrator runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub claim_conflicts: u64,
    pub best_effort_warnings: u64,
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    capabilities: Capabilities,
    warnings: Arc<dyn StageWarningSink>,
    config: OrchestratorConfig,
    stats: Mutex<OrchestratorStats>,
}

impl core::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        capabilities: Capabilities,
        warnings: Arc<dyn StageWarningSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            capabilities,
            warnings,
            config,
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Claim and run the oldest eligible job, analyses before reports.
    ///
    /// Returns `Ok(None)` when nothing is claimable. Lost claim races are
    /// skipped, not reported.
    pub async fn process_next(&self, worker: &str) -> Result<Option<JobOutcome>, OrchestratorError> {
        let stale = self.config.stale_claim_after;
        let batch = self.config.candidate_batch;

        for id in self.store.analysis_candidates(Utc::now(), stale, batch).await? {
            match self.run_analysis(id, worker).await {
                Err(OrchestratorError::ClaimConflict(job)) => {
                    debug!(job = %job, worker, "claim lost to another worker");
                }
                other => return other.map(Some),
            }
        }

        for id in self.store.report_candidates(Utc::now(), stale, batch).await? {
            match self.run_report(id, worker).await {
                Err(OrchestratorError::ClaimConflict(job)) => {
                    debug!(job = %job, worker, "claim lost to another worker");
                }
                other => return other.map(Some),
            }
        }

        Ok(None)
    }

    /// Claim one analysis job and drive it to a terminal state.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn run_analysis(&self, id: AnalysisJobId, worker: &str) -> Result<JobOutcome, OrchestratorError> {
        let job_ref = JobRef::Analysis(id);
        let claim = Claim::new(worker, Utc::now());
        let token = claim.token;

        let mut job = self
            .store
            .claim_analysis(id, claim, self.config.stale_claim_after)
            .await
            .map_err(|e| self.on_claim_error(e.into()))?;
        info!(job_id = %id, worker, "analysis claimed");

        let failure = match self.analyze(&job).await {
            Ok(results) => {
                job.complete(token, results, Utc::now())
                    .map_err(|_| OrchestratorError::ClaimConflict(job_ref))?;
                None
            }
            Err(err) => {
                job.fail(token, err.job_error(), Utc::now())
                    .map_err(|_| OrchestratorError::ClaimConflict(job_ref))?;
                Some(err)
            }
        };

        self.store
            .commit_analysis(&job, token)
            .await
            .map_err(|e| self.on_claim_error(e.into()))?;
        let status = self.on_committed(job_ref, failure.as_ref());

        let mut warnings = Vec::new();
        if let Some(results) = job.results() {
            self.after_analysis(&job, results, &mut warnings).await;
        }

        Ok(JobOutcome {
            job: job_ref,
            status,
            failure,
            warnings,
        })
    }

    /// Claim one report job and drive it to a terminal state.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn run_report(&self, id: ReportJobId, worker: &str) -> Result<JobOutcome, OrchestratorError> {
        let job_ref = JobRef::Report(id);
        let claim = Claim::new(worker, Utc::now());
        let token = claim.token;

        let mut job = self
            .store
            .claim_report(id, claim, self.config.stale_claim_after)
            .await
            .map_err(|e| self.on_claim_error(e.into()))?;
        info!(job_id = %id, worker, source = job.source.source_type(), "report claimed");

        let (failure, summary) = match self.generate(&job).await {
            Ok((artifact, summary)) => {
                job.complete(token, artifact, Utc::now())
                    .map_err(|_| OrchestratorError::ClaimConflict(job_ref))?;
                (None, Some(summary))
            }
            Err(OrchestratorError::Store(err)) => {
                // Leave the claim in place; the job is recovered once it goes stale.
                warn!(job_id = %id, error = %err, "store unavailable while loading report source");
                return Err(OrchestratorError::Store(err));
            }
            Err(err) => {
                job.fail(token, err.job_error(), Utc::now())
                    .map_err(|_| OrchestratorError::ClaimConflict(job_ref))?;
                (Some(err), None)
            }
        };

        self.store
            .commit_report(&job, token)
            .await
            .map_err(|e| self.on_claim_error(e.into()))?;
        let status = self.on_committed(job_ref, failure.as_ref());

        let mut warnings = Vec::new();
        if let (Some(summary), Some(destination)) = (summary, job.notify_to.clone()) {
            let notification = Notification {
                destination,
                job: job_ref,
                summary,
                artifact: job.artifact().cloned(),
            };
            self.best_effort(
                &mut warnings,
                (job_ref, job.owner),
                Stage::Notify,
                self.config.timeouts.notify,
                self.capabilities.notifier.notify(&notification),
            )
            .await;
        }

        Ok(JobOutcome {
            job: job_ref,
            status,
            failure,
            warnings,
        })
    }

    /// Normalize then Analyze. Both critical.
    ///
    /// Normalization runs on the blocking pool and cannot be cancelled: when
    /// the timeout fires the job fails, but the parse keeps its thread until
    /// it finishes. The source size check bounds how long that can be.
    async fn analyze(&self, job: &AnalysisJob) -> Result<AnalysisResults, OrchestratorError> {
        let size = job.source.payload.size_bytes();
        if size > self.config.max_source_bytes {
            return Err(OrchestratorError::critical(
                Stage::Normalize,
                format!(
                    "source is {size} bytes; the limit is {}",
                    self.config.max_source_bytes
                ),
            ));
        }

        let source = job.source.clone();
        let normalizer = self.config.normalizer;
        let limit = self.config.timeouts.normalize;

        let normalizing = tokio::task::spawn_blocking(move || source.normalize(&normalizer));
        let metrics = match tokio::time::timeout(limit, normalizing).await {
            Ok(Ok(Ok(metrics))) => metrics,
            Ok(Ok(Err(malformed))) => return Err(malformed.into()),
            Ok(Err(join)) => {
                return Err(OrchestratorError::critical(
                    Stage::Normalize,
                    format!("normalizer aborted: {join}"),
                ));
            }
            Err(_) => {
                return Err(OrchestratorError::critical(
                    Stage::Normalize,
                    format!("normalize timed out after {limit:?}"),
                ));
            }
        };
        debug!(
            job_id = %job.id,
            rows = metrics.total_rows,
            metrics = metrics.metrics.len(),
            "input normalized"
        );

        bounded(
            Stage::Analyze,
            self.config.timeouts.analyze,
            self.capabilities.analyzer.analyze(&metrics),
        )
        .await
        .map_err(|message| OrchestratorError::critical(Stage::Analyze, message))
    }

    /// Load the report's data and export it. All critical.
    async fn generate(&self, job: &ReportJob) -> Result<(ArtifactHandle, ResultsSummary), OrchestratorError> {
        let (source, summary) = match job.source {
            ReportSource::FromAnalysis { analysis_id } => {
                let analysis = self
                    .store
                    .get_analysis(analysis_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound(format!("analysis {analysis_id}")))?;
                if analysis.owner != job.owner {
                    return Err(OrchestratorError::Forbidden(format!("analysis {analysis_id}")));
                }
                let results = analysis.results().ok_or_else(|| {
                    OrchestratorError::SourceNotReady(format!(
                        "analysis {analysis_id} is {}",
                        analysis.status()
                    ))
                })?;
                (
                    ExportSource::Analysis {
                        results: results.clone(),
                    },
                    results.summary(),
                )
            }
            ReportSource::FromLiveAccount { account_id } => {
                let snapshot = bounded(
                    Stage::FetchSnapshot,
                    self.config.timeouts.fetch_snapshot,
                    self.capabilities.snapshots.fetch_snapshot(account_id),
                )
                .await
                .map_err(|message| OrchestratorError::critical(Stage::FetchSnapshot, message))?;
                let summary = snapshot_summary(&snapshot);
                (ExportSource::LiveAccount { snapshot }, summary)
            }
        };

        let request = ExportRequest {
            job: JobRef::Report(job.id),
            owner: job.owner,
            source,
        };
        let artifact = bounded(
            Stage::Export,
            self.config.timeouts.export,
            self.capabilities.exporter.export(&request),
        )
        .await
        .map_err(|message| OrchestratorError::critical(Stage::Export, message))?;

        Ok((artifact, summary))
    }

    /// Post-commit extras for a completed analysis: document export, then notify.
    async fn after_analysis(
        &self,
        job: &AnalysisJob,
        results: &AnalysisResults,
        warnings: &mut Vec<OrchestratorError>,
    ) {
        let job_ref = JobRef::Analysis(job.id);
        let request = ExportRequest {
            job: job_ref,
            owner: job.owner,
            source: ExportSource::Analysis {
                results: results.clone(),
            },
        };
        let artifact = self
            .best_effort(
                warnings,
                (job_ref, job.owner),
                Stage::Export,
                self.config.timeouts.export,
                self.capabilities.exporter.export(&request),
            )
            .await;

        let Some(destination) = job.notify_to.clone() else {
            return;
        };
        let notification = Notification {
            destination,
            job: job_ref,
            summary: results.summary(),
            artifact,
        };
        self.best_effort(
            warnings,
            (job_ref, job.owner),
            Stage::Notify,
            self.config.timeouts.notify,
            self.capabilities.notifier.notify(&notification),
        )
        .await;
    }

    /// Run a stage whose failure must not affect the job: record and swallow.
    async fn best_effort<T, F>(
        &self,
        warnings: &mut Vec<OrchestratorError>,
        (job, owner): (JobRef, OwnerId),
        stage: Stage,
        limit: Duration,
        call: F,
    ) -> Option<T>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        match bounded(stage, limit, call).await {
            Ok(value) => Some(value),
            Err(message) => {
                warn!(job = %job, stage = %stage, error = %message, "best-effort stage failed");
                self.warnings.record(StageWarning {
                    job,
                    owner,
                    stage,
                    message: message.clone(),
                    recorded_at: Utc::now(),
                });
                self.bump(|s| s.best_effort_warnings += 1);
                warnings.push(OrchestratorError::best_effort(stage, message));
                None
            }
        }
    }

    fn on_claim_error(&self, err: OrchestratorError) -> OrchestratorError {
        if matches!(err, OrchestratorError::ClaimConflict(_)) {
            self.bump(|s| s.claim_conflicts += 1);
        }
        err
    }

    fn on_committed(&self, job: JobRef, failure: Option<&OrchestratorError>) -> TerminalStatus {
        match failure {
            None => {
                info!(job = %job, "job completed");
                self.bump(|s| {
                    s.jobs_processed += 1;
                    s.jobs_completed += 1;
                });
                TerminalStatus::Completed
            }
            Some(err) => {
                warn!(job = %job, error = %err, "job failed");
                self.bump(|s| {
                    s.jobs_processed += 1;
                    s.jobs_failed += 1;
                });
                TerminalStatus::Failed
            }
        }
    }

    fn bump(&self, update: impl FnOnce(&mut OrchestratorStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Await a capability call under `limit`, flattening timeout and failure into a message.
async fn bounded<T, F>(stage: Stage, limit: Duration, call: F) -> Result<T, String>
where
    F: Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.message),
        Err(_) => Err(format!("{stage} timed out after {limit:?}")),
    }
}

fn snapshot_summary(snapshot: &AccountSnapshot) -> ResultsSummary {
    let headline_insights = vec![
        format!(
            "{} campaigns on {}",
            snapshot.campaigns.len(),
            snapshot.platform
        ),
        format!("Total spend: {:.2}", snapshot.total_spend()),
        format!(
            "Impressions: {}, clicks: {}",
            snapshot.total_impressions(),
            snapshot.total_clicks()
        ),
    ];
    ResultsSummary {
        insight_count: headline_insights.len(),
        headline_insights,
        plan_summary: None,
    }
}
