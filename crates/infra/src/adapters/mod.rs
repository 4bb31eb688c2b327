//! Concrete capability implementations wired in by the worker binary.

pub mod fs_export;
pub mod http;

pub use fs_export::FsExporter;
pub use http::{HttpAnalyzer, HttpEndpoint, HttpSnapshotSource, WebhookNotifier};
