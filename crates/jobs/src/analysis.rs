//! Analysis job: one uploaded export, normalized and analyzed.
//!
//! Pending -> Processing -> Completed | Failed

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use adsight_ai::AnalysisResults;
use adsight_core::{AnalysisJobId, DomainError, DomainResult, OwnerId};
use adsight_metrics::{MalformedInputError, NormalizedMetrics, Normalizer, Table};

use crate::claim::{Claim, ClaimToken};
use crate::error::TransitionError;
use crate::status::AnalysisStatus;

/// Raw input as handed over by the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SourcePayload {
    /// Uploaded file content, not yet parsed.
    Csv(Vec<u8>),
    /// A row set some other component already parsed.
    Rows(Table),
}

impl SourcePayload {
    pub fn size_bytes(&self) -> usize {
        match self {
            SourcePayload::Csv(bytes) => bytes.len(),
            SourcePayload::Rows(table) => {
                let header: usize = table.columns().iter().map(String::len).sum();
                let cells: usize = table.rows().iter().flatten().map(String::len).sum();
                header + cells
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SourcePayload::Csv(bytes) => bytes.iter().all(u8::is_ascii_whitespace),
            SourcePayload::Rows(table) => table.columns().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub filename: String,
    pub payload: SourcePayload,
}

impl SourceDescriptor {
    pub fn csv(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            payload: SourcePayload::Csv(bytes.into()),
        }
    }

    pub fn rows(filename: impl Into<String>, table: Table) -> Self {
        Self {
            filename: filename.into(),
            payload: SourcePayload::Rows(table),
        }
    }

    /// Submission checks, applied before any job record exists.
    pub fn validate(&self, max_bytes: usize) -> DomainResult<()> {
        if self.filename.trim().is_empty() {
            return Err(DomainError::validation("filename is required"));
        }
        if let SourcePayload::Csv(_) = self.payload {
            let is_csv = self
                .filename
                .rsplit_once('.')
                .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("csv"));
            if !is_csv {
                return Err(DomainError::validation("only CSV files are allowed"));
            }
        }
        if self.payload.is_empty() {
            return Err(DomainError::validation("uploaded file is empty"));
        }
        let size = self.payload.size_bytes();
        if size > max_bytes {
            return Err(DomainError::validation(format!(
                "file size {size} exceeds the {max_bytes} byte limit"
            )));
        }
        Ok(())
    }

    pub fn normalize(&self, normalizer: &Normalizer) -> Result<NormalizedMetrics, MalformedInputError> {
        match &self.payload {
            SourcePayload::Csv(bytes) => normalizer.normalize_csv(bytes),
            SourcePayload::Rows(table) => Ok(normalizer.normalize(table)),
        }
    }
}

/// Everything needed to create a job, minus identity and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSubmission {
    pub owner: OwnerId,
    pub source: SourceDescriptor,
    /// Where to send the completion notification, if anywhere.
    pub notify_to: Option<String>,
    pub retry_of: Option<AnalysisJobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisState {
    Pending,
    Processing {
        claim: Claim,
    },
    Completed {
        results: AnalysisResults,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        completed_at: DateTime<Utc>,
    },
}

impl AnalysisState {
    pub fn status(&self) -> AnalysisStatus {
        match self {
            AnalysisState::Pending => AnalysisStatus::Pending,
            AnalysisState::Processing { .. } => AnalysisStatus::Processing,
            AnalysisState::Completed { .. } => AnalysisStatus::Completed,
            AnalysisState::Failed { .. } => AnalysisStatus::Failed,
        }
    }

    /// Rebuild a state from flat storage columns, rejecting combinations the
    /// lifecycle cannot produce.
    pub fn from_parts(
        status: AnalysisStatus,
        claim: Option<Claim>,
        results: Option<AnalysisResults>,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Self, TransitionError> {
        match (status, claim, results, error, completed_at) {
            (AnalysisStatus::Pending, None, None, None, None) => Ok(AnalysisState::Pending),
            (AnalysisStatus::Processing, Some(claim), None, None, None) => {
                Ok(AnalysisState::Processing { claim })
            }
            (AnalysisStatus::Completed, _, Some(results), None, Some(completed_at)) => {
                Ok(AnalysisState::Completed { results, completed_at })
            }
            (AnalysisStatus::Failed, _, None, Some(error), Some(completed_at)) => {
                Ok(AnalysisState::Failed { error, completed_at })
            }
            (status, ..) => Err(TransitionError::invariant(format!(
                "inconsistent stored fields for {status} analysis job"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: AnalysisJobId,
    pub owner: OwnerId,
    pub source: SourceDescriptor,
    pub notify_to: Option<String>,
    pub retry_of: Option<AnalysisJobId>,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state: AnalysisState,
}

impl AnalysisJob {
    /// A new Pending job.
    pub fn submit(id: AnalysisJobId, submission: AnalysisSubmission, now: DateTime<Utc>) -> Self {
        Self::restore(id, submission, now, now, AnalysisState::Pending)
    }

    /// Reassemble a job loaded from storage.
    pub fn restore(
        id: AnalysisJobId,
        submission: AnalysisSubmission,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        state: AnalysisState,
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

    pub fn state(&self) -> &AnalysisState {
        &self.state
    }

    pub fn status(&self) -> AnalysisStatus {
        self.state.status()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn results(&self) -> Option<&AnalysisResults> {
        match &self.state {
            AnalysisState::Completed { results, .. } => Some(results),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            AnalysisState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            AnalysisState::Completed { completed_at, .. } | AnalysisState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    pub fn claim(&self) -> Option<&Claim> {
        match &self.state {
            AnalysisState::Processing { claim } => Some(claim),
            _ => None,
        }
    }

    /// Pending, or Processing under a claim older than `stale_after`.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match &self.state {
            AnalysisState::Pending => true,
            AnalysisState::Processing { claim } => claim.is_stale(now, stale_after),
            _ => false,
        }
    }

    /// Pending -> Processing (or take over a stale Processing claim).
    pub fn start(&mut self, claim: Claim, stale_after: Duration) -> Result<(), TransitionError> {
        if !self.is_claimable(claim.claimed_at, stale_after) {
            return Err(TransitionError::illegal(self.status().as_str(), "processing"));
        }
        self.updated_at = claim.claimed_at;
        self.state = AnalysisState::Processing { claim };
        Ok(())
    }

    /// Processing -> Completed.
    pub fn complete(
        &mut self,
        token: ClaimToken,
        results: AnalysisResults,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_claim(token, "completed")?;
        self.updated_at = now;
        self.state = AnalysisState::Completed {
            results,
            completed_at: now,
        };
        Ok(())
    }

    /// Processing -> Failed, keeping the error text verbatim.
    pub fn fail(
        &mut self,
        token: ClaimToken,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_claim(token, "failed")?;
        self.updated_at = now;
        self.state = AnalysisState::Failed {
            error: error.into(),
            completed_at: now,
        };
        Ok(())
    }

    /// The submission a retry creates: same source, linked back to this job.
    pub fn resubmission(&self) -> Result<AnalysisSubmission, TransitionError> {
        if self.status() != AnalysisStatus::Failed {
            return Err(TransitionError::illegal(self.status().as_str(), "resubmitted"));
        }
        Ok(AnalysisSubmission {
            owner: self.owner,
            source: self.source.clone(),
            notify_to: self.notify_to.clone(),
            retry_of: Some(self.id),
        })
    }

    fn check_claim(&self, token: ClaimToken, to: &'static str) -> Result<(), TransitionError> {
        match &self.state {
            AnalysisState::Processing { claim } if claim.token == token => Ok(()),
            AnalysisState::Processing { .. } => Err(TransitionError::ClaimMismatch),
            AnalysisState::Pending => Err(TransitionError::NotClaimed),
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

    fn submission() -> AnalysisSubmission {
        AnalysisSubmission {
            owner: OwnerId::new(),
            source: SourceDescriptor::csv("ads.csv", "Impressions\n100\n"),
            notify_to: Some("owner@example.com".into()),
            retry_of: None,
        }
    }

    fn pending_job(now: DateTime<Utc>) -> AnalysisJob {
        AnalysisJob::submit(AnalysisJobId::new(), submission(), now)
    }

    #[test]
    fn happy_path_sets_results_and_completed_at() {
        let t0 = Utc::now();
        let mut job = pending_job(t0);
        let claim = Claim::new("w1", t0);
        let token = claim.token;

        job.start(claim, stale_after()).unwrap();
        assert_eq!(job.status(), AnalysisStatus::Processing);
        assert!(job.completed_at().is_none());

        let t1 = t0 + Duration::seconds(5);
        job.complete(token, AnalysisResults::default(), t1).unwrap();

        assert_eq!(job.status(), AnalysisStatus::Completed);
        assert!(job.results().is_some());
        assert!(job.error().is_none());
        assert_eq!(job.completed_at(), Some(t1));
    }

    #[test]
    fn failure_keeps_error_verbatim() {
        let t0 = Utc::now();
        let mut job = pending_job(t0);
        let claim = Claim::new("w1", t0);
        let token = claim.token;
        job.start(claim, stale_after()).unwrap();

        job.fail(token, "rate limited: try again later", t0).unwrap();

        assert_eq!(job.error(), Some("rate limited: try again later"));
        assert!(job.results().is_none());
    }

    #[test]
    fn terminal_jobs_reject_every_transition() {
        let t0 = Utc::now();
        let mut job = pending_job(t0);
        let claim = Claim::new("w1", t0);
        let token = claim.token;
        job.start(claim, stale_after()).unwrap();
        job.complete(token, AnalysisResults::default(), t0).unwrap();

        let later = t0 + Duration::seconds(STALE * 10);
        assert!(!job.is_claimable(later, stale_after()));
        assert!(job.start(Claim::new("w2", later), stale_after()).is_err());
        assert!(job.fail(token, "late", later).is_err());
        assert!(job.complete(token, AnalysisResults::default(), later).is_err());
        assert_eq!(job.completed_at(), Some(t0));
    }

    #[test]
    fn active_claim_blocks_second_worker_until_stale() {
        let t0 = Utc::now();
        let mut job = pending_job(t0);
        let first = Claim::new("w1", t0);
        let first_token = first.token;
        job.start(first, stale_after()).unwrap();

        let early = Claim::new("w2", t0 + Duration::seconds(10));
        assert_eq!(
            job.start(early, stale_after()),
            Err(TransitionError::illegal("processing", "processing"))
        );

        let late = Claim::new("w2", t0 + Duration::seconds(STALE));
        let late_token = late.token;
        job.start(late, stale_after()).unwrap();

        // The crashed worker's token no longer finishes the job.
        assert_eq!(
            job.complete(first_token, AnalysisResults::default(), t0),
            Err(TransitionError::ClaimMismatch)
        );
        job.complete(late_token, AnalysisResults::default(), t0).unwrap();
    }

    #[test]
    fn finishing_requires_a_claim() {
        let mut job = pending_job(Utc::now());
        assert_eq!(
            job.fail(ClaimToken::new(), "x", Utc::now()),
            Err(TransitionError::NotClaimed)
        );
    }

    #[test]
    fn only_failed_jobs_can_be_resubmitted() {
        let t0 = Utc::now();
        let mut job = pending_job(t0);
        assert!(job.resubmission().is_err());

        let claim = Claim::new("w1", t0);
        let token = claim.token;
        job.start(claim, stale_after()).unwrap();
        job.fail(token, "boom", t0).unwrap();

        let retry = job.resubmission().unwrap();
        assert_eq!(retry.retry_of, Some(job.id));
        assert_eq!(retry.source, job.source);
        assert_eq!(retry.owner, job.owner);
    }

    #[test]
    fn validate_checks_extension_size_and_content() {
        assert!(SourceDescriptor::csv("ads.CSV", "a\n1\n").validate(1024).is_ok());
        assert!(matches!(
            SourceDescriptor::csv("ads.xlsx", "a\n1\n").validate(1024),
            Err(DomainError::Validation(_))
        ));
        assert!(SourceDescriptor::csv("ads.csv", "  \n").validate(1024).is_err());
        assert!(SourceDescriptor::csv("ads.csv", "a\n1\n").validate(3).is_err());

        let table = Table::new(vec!["Clicks".into()], vec![vec!["1".into()]]).unwrap();
        assert!(SourceDescriptor::rows("sheet", table).validate(1024).is_ok());
    }

    #[test]
    fn extension_check_ignores_case() {
        for name in ["ads.csv", "ads.CSV", "ads.Csv", "q3.export.cSv"] {
            assert!(SourceDescriptor::csv(name, "a\n1\n").validate(1024).is_ok(), "{name}");
        }
        for name in ["ads", "ads.csv.gz", "csv", "ads.tsv"] {
            assert!(SourceDescriptor::csv(name, "a\n1\n").validate(1024).is_err(), "{name}");
        }
    }

    #[test]
    fn from_parts_rejects_inconsistent_columns() {
        let now = Utc::now();
        assert!(AnalysisState::from_parts(AnalysisStatus::Pending, None, None, None, None).is_ok());
        assert!(
            AnalysisState::from_parts(
                AnalysisStatus::Completed,
                None,
                Some(AnalysisResults::default()),
                Some("error too".into()),
                Some(now)
            )
            .is_err()
        );
        assert!(AnalysisState::from_parts(AnalysisStatus::Processing, None, None, None, None).is_err());
        assert!(
            AnalysisState::from_parts(AnalysisStatus::Failed, None, None, Some("e".into()), None).is_err()
        );
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
            let mut job = pending_job(now);
            let mut tokens: [Option<ClaimToken>; 3] = [None; 3];
            let mut terminal: Option<AnalysisState> = None;

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
                            let _ = job.complete(token, AnalysisResults::default(), now);
                        }
                    }
                    Op::Fail { worker } => {
                        if let Some(token) = tokens[worker as usize] {
                            let _ = job.fail(token, "failed", now);
                        }
                    }
                }

                prop_assert!(job.status().rank() >= before.rank());
                prop_assert!(!(job.results().is_some() && job.error().is_some()));
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
