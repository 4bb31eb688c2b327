//! In-memory job store for tests/dev.
//!
//! A single write lock around each map makes claim and commit atomic, which is
//! the same guarantee the Postgres store gets from conditional updates.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use adsight_core::{AnalysisJobId, JobRef, OwnerId, ReportJobId};
use adsight_jobs::{AnalysisJob, AnalysisStatus, Claim, ClaimToken, ReportJob, ReportStatus};

use super::store::{JobStats, JobStore, JobStoreError};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    analyses: RwLock<HashMap<AnalysisJobId, AnalysisJob>>,
    reports: RwLock<HashMap<ReportJobId, ReportJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, JobStoreError> {
    lock.read()
        .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, JobStoreError> {
    lock.write()
        .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
}

fn held_by(claim: Option<&Claim>, token: ClaimToken) -> bool {
    claim.is_some_and(|c| c.token == token)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_analysis(&self, job: &AnalysisJob) -> Result<(), JobStoreError> {
        let mut jobs = write(&self.analyses)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id.into()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_analysis(&self, id: AnalysisJobId) -> Result<Option<AnalysisJob>, JobStoreError> {
        Ok(read(&self.analyses)?.get(&id).cloned())
    }

    async fn list_analyses(
        &self,
        owner: OwnerId,
        statuses: &[AnalysisStatus],
        limit: usize,
    ) -> Result<Vec<AnalysisJob>, JobStoreError> {
        let jobs = read(&self.analyses)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.owner == owner && (statuses.is_empty() || statuses.contains(&j.status())))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn analysis_candidates(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<AnalysisJobId>, JobStoreError> {
        let jobs = read(&self.analyses)?;
        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.is_claimable(now, stale_after))
            .map(|j| (j.created_at, j.id))
            .collect();

        // FIFO
        candidates.sort();
        Ok(candidates.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn claim_analysis(
        &self,
        id: AnalysisJobId,
        claim: Claim,
        stale_after: Duration,
    ) -> Result<AnalysisJob, JobStoreError> {
        let mut jobs = write(&self.analyses)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id.into()))?;
        job.start(claim, stale_after)
            .map_err(|_| JobStoreError::ClaimConflict(id.into()))?;
        Ok(job.clone())
    }

    async fn commit_analysis(&self, job: &AnalysisJob, token: ClaimToken) -> Result<(), JobStoreError> {
        let mut jobs = write(&self.analyses)?;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id.into()))?;
        if !held_by(stored.claim(), token) || !job.is_terminal() {
            return Err(JobStoreError::ClaimConflict(job.id.into()));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn insert_report(&self, job: &ReportJob) -> Result<(), JobStoreError> {
        let mut jobs = write(&self.reports)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id.into()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_report(&self, id: ReportJobId) -> Result<Option<ReportJob>, JobStoreError> {
        Ok(read(&self.reports)?.get(&id).cloned())
    }

    async fn list_reports(
        &self,
        owner: OwnerId,
        statuses: &[ReportStatus],
        limit: usize,
    ) -> Result<Vec<ReportJob>, JobStoreError> {
        let jobs = read(&self.reports)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.owner == owner && (statuses.is_empty() || statuses.contains(&j.status())))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn report_candidates(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<ReportJobId>, JobStoreError> {
        let jobs = read(&self.reports)?;
        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.is_claimable(now, stale_after))
            .map(|j| (j.created_at, j.id))
            .collect();

        candidates.sort();
        Ok(candidates.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn claim_report(
        &self,
        id: ReportJobId,
        claim: Claim,
        stale_after: Duration,
    ) -> Result<ReportJob, JobStoreError> {
        let mut jobs = write(&self.reports)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id.into()))?;
        job.start(claim, stale_after)
            .map_err(|_| JobStoreError::ClaimConflict(id.into()))?;
        Ok(job.clone())
    }

    async fn commit_report(&self, job: &ReportJob, token: ClaimToken) -> Result<(), JobStoreError> {
        let mut jobs = write(&self.reports)?;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id.into()))?;
        if !held_by(stored.claim(), token) || !job.is_terminal() {
            return Err(JobStoreError::ClaimConflict(job.id.into()));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn stats(&self, owner: OwnerId) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();

        for job in read(&self.analyses)?.values().filter(|j| j.owner == owner) {
            stats.analyses.record(job.status(), 1);
        }
        for job in read(&self.reports)?.values().filter(|j| j.owner == owner) {
            stats.reports.record(job.status(), 1);
        }

        Ok(stats)
    }
}
