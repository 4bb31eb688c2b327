use serde::Serialize;
use thiserror::Error;

use adsight_core::{DomainError, JobRef};
use adsight_metrics::MalformedInputError;

use crate::jobs::JobStoreError;

/// Pipeline step, as named in logs and warnings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Analyze,
    FetchSnapshot,
    Export,
    Notify,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Analyze => "analyze",
            Stage::FetchSnapshot => "fetch_snapshot",
            Stage::Export => "export",
            Stage::Notify => "notify",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything job submission and processing can report to a caller.
#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    /// Another worker already holds or finished the job. Nothing was changed.
    #[error("claim conflict on {0}")]
    ClaimConflict(JobRef),

    /// A stage the job's outcome depends on failed; the job is now Failed.
    #[error("{stage} failed: {message}")]
    CriticalStageFailure { stage: Stage, message: String },

    /// A stage after the terminal commit failed; the job status is unaffected.
    #[error("{stage} failed after commit: {message}")]
    BestEffortStageFailure { stage: Stage, message: String },

    #[error("malformed input: {0}")]
    MalformedInput(#[from] MalformedInputError),

    /// The report's source analysis has no results (yet, or ever).
    #[error("source not ready: {0}")]
    SourceNotReady(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(JobStoreError),
}

impl OrchestratorError {
    pub fn critical(stage: Stage, message: impl Into<String>) -> Self {
        Self::CriticalStageFailure {
            stage,
            message: message.into(),
        }
    }

    pub fn best_effort(stage: Stage, message: impl Into<String>) -> Self {
        Self::BestEffortStageFailure {
            stage,
            message: message.into(),
        }
    }

    /// Text stored in a failed job's `error` field. Capability failures keep
    /// the capability's own message.
    pub fn job_error(&self) -> String {
        match self {
            Self::CriticalStageFailure { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<JobStoreError> for OrchestratorError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::ClaimConflict(job) => Self::ClaimConflict(job),
            JobStoreError::NotFound(job) => Self::NotFound(job.to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<DomainError> for OrchestratorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound(what) => Self::NotFound(what),
            DomainError::Forbidden(what) => Self::Forbidden(what),
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::Conflict(msg)
            | DomainError::InvariantViolation(msg) => Self::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsight_core::AnalysisJobId;

    #[test]
    fn job_error_keeps_capability_message() {
        let err = OrchestratorError::critical(Stage::Analyze, "quota exceeded");
        assert_eq!(err.job_error(), "quota exceeded");
        assert_eq!(err.to_string(), "analyze failed: quota exceeded");

        let err = OrchestratorError::from(MalformedInputError::NoColumns);
        assert!(err.job_error().starts_with("malformed input"));
    }

    #[test]
    fn store_conflicts_surface_as_claim_conflicts() {
        let job = JobRef::Analysis(AnalysisJobId::new());
        assert!(matches!(
            OrchestratorError::from(JobStoreError::ClaimConflict(job)),
            OrchestratorError::ClaimConflict(j) if j == job
        ));
        assert!(matches!(
            OrchestratorError::from(JobStoreError::Storage("down".into())),
            OrchestratorError::Store(_)
        ));
    }
}
