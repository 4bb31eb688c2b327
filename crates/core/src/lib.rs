//! `adsight-core`: identifiers and error types shared by every crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, AnalysisJobId, JobRef, OwnerId, ReportJobId};
