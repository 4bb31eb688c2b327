//! `adsight-jobs`
//!
//! **Responsibility:** the lifecycle of analysis and report jobs.
//!
//! - Pure state machines: no IO, no clocks (callers pass `now`).
//! - State is an enum carrying its own data, so "results iff Completed" and
//!   "error iff Failed" hold by construction.
//! - Terminal states are final. Retrying produces a fresh submission that
//!   points back at the failed job; it never rewinds the old record.
//! - Advancing past Pending requires a [`Claim`], and finishing requires the
//!   matching [`ClaimToken`]. Stores use the token to make commits conditional.

pub mod analysis;
pub mod claim;
pub mod error;
pub mod report;
pub mod status;

pub use analysis::{AnalysisJob, AnalysisState, AnalysisSubmission, SourceDescriptor, SourcePayload};
pub use claim::{Claim, ClaimToken};
pub use error::TransitionError;
pub use report::{ReportJob, ReportSource, ReportState, ReportSubmission};
pub use status::{AnalysisStatus, ReportStatus};
