//! `adsight-ai`
//!
//! **Responsibility:** boundary to the external capabilities the pipeline
//! depends on: analysis, document export, notification and live account
//! snapshots.
//!
//! This crate only describes shapes and failure modes:
//! - It does not know how a capability is reached (HTTP, local model, stub).
//! - It does not touch job state; the orchestrator decides what a failure means.
//! - Results are typed structs, not open-ended maps.

pub mod error;
pub mod ports;
pub mod result;
pub mod snapshot;

pub use error::{CapabilityError, CapabilityErrorKind};
pub use ports::{
    Analyzer, ArtifactHandle, Capabilities, ExportRequest, ExportSource, Exporter, Notification,
    Notifier, NotifyAck, NoopNotifier, SnapshotSource, UnconfiguredSnapshotSource,
};
pub use result::{
    AdPlan, AnalysisResults, CaptionWithHashtags, ContentPlan, ContentWeek, PerformanceSummary,
    ResultsSummary, SimilarEntity,
};
pub use snapshot::{AccountSnapshot, CampaignSnapshot};
