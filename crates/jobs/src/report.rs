//! Report job: a rendered document built from a finished analysis or from a
//! live account snapshot.
//!
//! Pending -> Generating -> Completed | Failed

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use adsight_ai::ArtifactHandle;
use adsight_core::{AccountId, AnalysisJobId, OwnerId, ReportJobId};

use crate::claim::{Claim, ClaimToken};
use crate::error::TransitionError;
use crate::status::ReportStatus;

/// Where the report's data comes from. Exactly one reference, by construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum ReportSource {
    FromAnalysis { analysis_id: AnalysisJobId },
    FromLiveAccount { account_id: AccountId },
}

impl ReportSource {
    pub fn source_type(&self) -> &'static str {
        match self {
            ReportSource::FromAnalysis { .. } => "from_analysis",
            ReportSource::FromLiveAccount { .. } => "from_live_account",
        }
    }

    pub fn analysis_ref(&self) -> Option<AnalysisJobId> {
        match self {
            ReportSource::FromAnalysis { analysis_id } => Some(*analysis_id),
            ReportSource::FromLiveAccount { .. } => None,
        }
    }

    pub fn account_ref(&self) -> Option<AccountId> {
        match self {
            ReportSource::FromLiveAccount { account_id } => Some(*account_id),
            ReportSource::FromAnalysis { .. } => None,
        }
    }

    /// Rebuild from storage columns; the set reference must match the type.
    pub fn from_parts(
        source_type: &str,
        analysis_ref: Option<AnalysisJobId>,
        account_ref: Option<AccountId>,
    ) -> Result<Self, TransitionError> {
        match (source_type, analysis_ref, account_ref) {
            ("from_analysis", Some(analysis_id), None) => Ok(ReportSource::FromAnalysis { analysis_id }),
            ("from_live_account", None, Some(account_id)) => {
                Ok(ReportSource::FromLiveAccount { account_id })
            }
            (other, ..) => Err(TransitionError::invariant(format!(
                "report source '{other}' must carry exactly its own reference"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSubmission {
    pub owner: OwnerId,
    pub source: ReportSource,
    pub notify_to: Option<String>,
    pub retry_of: Option<ReportJobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportState {
    Pending,
    Generating {
        claim: Claim,
    },
    Completed {
        artifact: ArtifactHandle,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        completed_at: DateTime<Utc>,
    },
}

impl ReportState {
    pub fn status(&self) -> ReportStatus {
        match self {
            ReportState::Pending => ReportStatus::Pending,
            ReportState::Generating { .. } => ReportStatus::Generating,
            ReportState::Completed { .. } => ReportStatus::Completed,
            ReportState::Failed { .. } => ReportStatus::Failed,
        }
    }

    pub fn from_parts(
        status: ReportStatus,
        claim: Option<Claim>,
        artifact: Option<ArtifactHandle>,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Self, TransitionError> {
        match (status, claim, artifact, error, completed_at) {
            (ReportStatus::Pending, None, None, None, None) => Ok(ReportState::Pending),
            (ReportStatus::Generating, Some(claim), None, None, None) => {
                Ok(ReportState::Generating { claim })
            }
            (ReportStatus::Completed, _, Some(artifact), None, Some(completed_at)) => {
                Ok(ReportState::Completed { artifact, completed_at })
            }
            (ReportStatus::Failed, _, None, Some(error), Some(completed_at)) => {
                Ok(ReportState::Failed { error, completed_at })
            }
            (status, ..) => Err(TransitionError::invariant(format!(
                "inconsistent stored fields for {status} report job"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportJob {
    pub id: ReportJobId,
    pub owner: OwnerId,
    pub source: ReportSource,
    pub notify_to: Option<String>,
    pub retry_of: Option<ReportJobId>,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state: ReportState,
}

impl ReportJob {
    pub fn submit(id: ReportJobId, submission: ReportSubmission, now: DateTime<Utc>) -> Self {
        Self::restore(id, submission, now, now, ReportState::Pending)
    }

    pub fn restore(
        id: ReportJobId,
        submission: ReportSubmission,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        state: ReportState,
    ) -> Self {
        Self {
            id,
            owner: submission.owner,
            source: submission.source,
            notify_to: submission.notify_to,
            retry_of: submission.retry_of,
            created_at,
            updated_at,
            state,
        }
    }

    pub fn state(&self) -> &ReportState {
        &self.state
    }

    pub fn status(&self) -> ReportStatus {
        self.state.status()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn artifact(&self) -> Option<&ArtifactHandle> {
        match &self.state {
            ReportState::Completed { artifact, .. } => Some(artifact),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            ReportState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            ReportState::Completed { completed_at, .. } | ReportState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    pub fn claim(&self) -> Option<&Claim> {
        match &self.state {
            ReportState::Generating { claim } => Some(claim),
            _ => None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match &self.state {
            ReportState::Pending => true,
            ReportState::Generating { claim } => claim.is_stale(now, stale_after),
            _ => false,
        }
    }

    /// Pending -> Generating (or take over a stale Generating claim).
    pub fn start(&mut self, claim: Claim, stale_after: Duration) -> Result<(), TransitionError> {
        if !self.is_claimable(claim.claimed_at, stale_after) {
            return Err(TransitionError::illegal(self.status().as_str(), "generating"));
        }
        self.updated_at = claim.claimed_at;
        self.state = ReportState::Generating { claim };
        Ok(())
    }

    pub fn complete(
        &mut self,
        token: ClaimToken,
        artifact: ArtifactHandle,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_claim(token, "completed")?;
        self.updated_at = now;
        self.state = ReportState::Completed {
            artifact,
            completed_at: now,
        };
        Ok(())
    }

    pub fn fail(
        &mut self,
        token: ClaimToken,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_claim(token, "failed")?;
        self.updated_at = now;
        self.state = ReportState::Failed {
            error: error.into(),
            completed_at: now,
        };
        Ok(())
    }

    pub fn resubmission(&self) -> Result<ReportSubmission, TransitionError> {
        if self.status() != ReportStatus::Failed {
            return Err(TransitionError::illegal(self.status().as_str(), "resubmitted"));
        }
        Ok(ReportSubmission {
            owner: self.owner,
            source: self.source,
            notify_to: self.notify_to.clone(),
            retry_of: Some(self.id),
        })
    }

    fn check_claim(&self, token: ClaimToken, to: &'static str) -> Result<(), TransitionError> {
        match &self.state {
            ReportState::Generating { claim } if claim.token == token => Ok(()),
            ReportState::Generating { .. } => Err(TransitionError::ClaimMismatch),
            ReportState::Pending => Err(TransitionError::NotClaimed),
            other => Err(TransitionError::illegal(other.status().as_str(), to)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STALE: i64 = 900;

    fn stale_after() -> Duration {
        Duration::seconds(STALE)
    }

    fn analysis_source() -> ReportSource {
        ReportSource::FromAnalysis {
            analysis_id: AnalysisJobId::new(),
        }
    }

    fn pending_report(source: ReportSource, now: DateTime<Utc>) -> ReportJob {
        ReportJob::submit(
            ReportJobId::new(),
            ReportSubmission {
                owner: OwnerId::new(),
                source,
                notify_to: None,
                retry_of: None,
            },
            now,
        )
    }

    #[test]
    fn completed_report_carries_artifact_only() {
        let t0 = Utc::now();
        let mut job = pending_report(
            ReportSource::FromAnalysis {
                analysis_id: AnalysisJobId::new(),
            },
            t0,
        );
        let claim = Claim::new("w1", t0);
        let token = claim.token;
        job.start(claim, stale_after()).unwrap();
        assert_eq!(job.status(), ReportStatus::Generating);

        job.complete(token, ArtifactHandle::new("reports/r1.md"), t0).unwrap();

        assert_eq!(job.artifact().map(ArtifactHandle::as_str), Some("reports/r1.md"));
        assert!(job.error().is_none());
        assert!(job.fail(token, "late", t0).is_err());
    }

    #[test]
    fn failed_report_can_be_resubmitted() {
        let t0 = Utc::now();
        let account_id = AccountId::new();
        let mut job = pending_report(ReportSource::FromLiveAccount { account_id }, t0);
        let claim = Claim::new("w1", t0);
        let token = claim.token;
        job.start(claim, stale_after()).unwrap();
        job.fail(token, "snapshot unavailable", t0).unwrap();

        let retry = job.resubmission().unwrap();
        assert_eq!(retry.retry_of, Some(job.id));
        assert_eq!(retry.source.account_ref(), Some(account_id));
        assert!(job.artifact().is_none());
    }

    #[test]
    fn source_refs_match_source_type() {
        let analysis_id = AnalysisJobId::new();
        let source = ReportSource::FromAnalysis { analysis_id };
        assert_eq!(source.analysis_ref(), Some(analysis_id));
        assert_eq!(source.account_ref(), None);

        assert_eq!(
            ReportSource::from_parts("from_analysis", Some(analysis_id), None).unwrap(),
            source
        );
        assert!(ReportSource::from_parts("from_analysis", Some(analysis_id), Some(AccountId::new())).is_err());
        assert!(ReportSource::from_parts("from_live_account", None, None).is_err());
    }

    #[test]
    fn source_serializes_with_type_tag() {
        let value = serde_json::to_value(ReportSource::FromLiveAccount {
            account_id: AccountId::new(),
        })
        .unwrap();
        assert_eq!(value["source_type"], "from_live_account");
    }

    #[test]
    fn finishing_requires_the_current_claim() {
        let t0 = Utc::now();
        let mut job = pending_report(analysis_source(), t0);
        assert_eq!(
            job.complete(ClaimToken::new(), ArtifactHandle::new("r.md"), t0),
            Err(TransitionError::NotClaimed)
        );

        let claim = Claim::new("w1", t0);
        let token = claim.token;
        job.start(claim, stale_after()).unwrap();

        let stranger = ClaimToken::new();
        assert_eq!(
            job.complete(stranger, ArtifactHandle::new("r.md"), t0),
            Err(TransitionError::ClaimMismatch)
        );
        assert_eq!(job.fail(stranger, "x", t0), Err(TransitionError::ClaimMismatch));
        assert_eq!(job.status(), ReportStatus::Generating);

        job.complete(token, ArtifactHandle::new("r.md"), t0).unwrap();
        assert_eq!(
            job.complete(token, ArtifactHandle::new("other.md"), t0),
            Err(TransitionError::illegal("completed", "completed"))
        );
        assert_eq!(job.artifact().map(ArtifactHandle::as_str), Some("r.md"));
    }

    #[test]
    fn generating_claim_blocks_second_worker_until_stale() {
        let t0 = Utc::now();
        let mut job = pending_report(analysis_source(), t0);
        let first = Claim::new("w1", t0);
        let first_token = first.token;
        job.start(first, stale_after()).unwrap();

        assert!(!job.is_claimable(t0 + Duration::seconds(10), stale_after()));
        assert_eq!(
            job.start(Claim::new("w2", t0 + Duration::seconds(10)), stale_after()),
            Err(TransitionError::illegal("generating", "generating"))
        );

        let later = t0 + Duration::seconds(STALE);
        assert!(job.is_claimable(later, stale_after()));
        let takeover = Claim::new("w2", later);
        let takeover_token = takeover.token;
        job.start(takeover, stale_after()).unwrap();

        assert_eq!(
            job.fail(first_token, "late", later),
            Err(TransitionError::ClaimMismatch)
        );
        job.fail(takeover_token, "export failed", later).unwrap();
        assert!(!job.is_claimable(later + Duration::seconds(STALE * 10), stale_after()));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start { worker: u8, after_secs: i64 },
        Complete { worker: u8 },
        Fail { worker: u8 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 0i64..2_000).prop_map(|(worker, after_secs)| Op::Start { worker, after_secs }),
            (0u8..3).prop_map(|worker| Op::Complete { worker }),
            (0u8..3).prop_map(|worker| Op::Fail { worker }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn status_never_moves_backwards(ops in prop::collection::vec(op(), 1..24)) {
            let mut now = Utc::now();
            let mut job = pending_report(analysis_source(), now);
            let mut tokens: [Option<ClaimToken>; 3] = [None; 3];
            let mut terminal: Option<ReportState> = None;

            for op in ops {
                let before = job.status();
                match op {
                    Op::Start { worker, after_secs } => {
                        now += Duration::seconds(after_secs);
                        let claim = Claim::new(format!("w{worker}"), now);
                        let token = claim.token;
                        if job.start(claim, stale_after()).is_ok() {
                            tokens[worker as usize] = Some(token);
                        }
                    }
                    Op::Complete { worker } => {
                        if let Some(token) = tokens[worker as usize] {
                            let _ = job.complete(token, ArtifactHandle::new(format!("w{worker}.md")), now);
                        }
                    }
                    Op::Fail { worker } => {
                        if let Some(token) = tokens[worker as usize] {
                            let _ = job.fail(token, "failed", now);
                        }
                    }
                }

                prop_assert!(job.status().rank() >= before.rank());
                prop_assert!(!(job.artifact().is_some() && job.error().is_some()));
                prop_assert_eq!(job.completed_at().is_some(), job.is_terminal());

                if let Some(frozen) = &terminal {
                    prop_assert_eq!(frozen, job.state());
                } else if job.is_terminal() {
                    terminal = Some(job.state().clone());
                }
            }
        }
    }
}
