use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use adsight_core::{JobRef, OwnerId};

use super::error::Stage;

/// A best-effort stage failure, kept out of the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageWarning {
    pub job: JobRef,
    pub owner: OwnerId,
    pub stage: Stage,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Sink for best-effort stage failures.
///
/// This is intentionally separate from job storage: a warning never changes
/// a job's status or error field.
pub trait StageWarningSink: Send + Sync + 'static {
    fn record(&self, warning: StageWarning);
}

/// In-memory sink keeping the most recent warnings.
#[derive(Debug)]
pub struct InMemoryStageWarningSink {
    capacity: usize,
    inner: Mutex<VecDeque<StageWarning>>,
}

impl InMemoryStageWarningSink {
    pub const DEFAULT_CAPACITY: usize = 1_024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn all(&self) -> Vec<StageWarning> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn for_job(&self, job: JobRef) -> Vec<StageWarning> {
        self.all().into_iter().filter(|w| w.job == job).collect()
    }
}

impl Default for InMemoryStageWarningSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StageWarningSink for InMemoryStageWarningSink {
    fn record(&self, warning: StageWarning) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(warning);
    }
}
