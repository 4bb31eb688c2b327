//! Capability ports consumed by the orchestrator.
//!
//! Implementations are constructed once at process start and injected; there
//! is no ambient registry. Timeouts are applied by the caller, so an
//! implementation may simply await its I/O.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use adsight_core::{AccountId, JobRef, OwnerId};
use adsight_metrics::NormalizedMetrics;

use crate::error::CapabilityError;
use crate::result::{AnalysisResults, ResultsSummary};
use crate::snapshot::AccountSnapshot;

/// Turns normalized metrics into structured analysis results.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    async fn analyze(&self, metrics: &NormalizedMetrics) -> Result<AnalysisResults, CapabilityError>;
}

/// Opaque reference to a rendered document (path, object key, URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactHandle(String);

impl ArtifactHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Data a document is rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ExportSource {
    Analysis { results: AnalysisResults },
    LiveAccount { snapshot: AccountSnapshot },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub job: JobRef,
    pub owner: OwnerId,
    #[serde(flatten)]
    pub source: ExportSource,
}

/// Renders and stores a document.
#[async_trait]
pub trait Exporter: Send + Sync + 'static {
    async fn export(&self, request: &ExportRequest) -> Result<ArtifactHandle, CapabilityError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub destination: String,
    pub job: JobRef,
    pub summary: ResultsSummary,
    pub artifact: Option<ArtifactHandle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyAck {
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Tells a destination that a job finished.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: &Notification) -> Result<NotifyAck, CapabilityError>;
}

/// Pulls a fresh snapshot of a connected ad account.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self, account: AccountId) -> Result<AccountSnapshot, CapabilityError>;
}

/// The full set of ports, shared by every worker.
#[derive(Clone)]
pub struct Capabilities {
    pub analyzer: Arc<dyn Analyzer>,
    pub exporter: Arc<dyn Exporter>,
    pub notifier: Arc<dyn Notifier>,
    pub snapshots: Arc<dyn SnapshotSource>,
}

impl core::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

/// Notifier used when no delivery channel is configured: acknowledges without sending.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<NotifyAck, CapabilityError> {
        Ok(NotifyAck::default())
    }
}

/// Snapshot source used when no platform connector is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredSnapshotSource;

#[async_trait]
impl SnapshotSource for UnconfiguredSnapshotSource {
    async fn fetch_snapshot(&self, account: AccountId) -> Result<AccountSnapshot, CapabilityError> {
        Err(CapabilityError::unavailable(format!(
            "no snapshot source configured (account {account})"
        )))
    }
}
