//! Durable storage for analysis and report jobs.
//!
//! ## Design
//!
//! - A job row is the only shared state between workers
//! - Claims are conditional writes: at most one worker holds a job at a time
//! - Commits are guarded by the claim token, so a worker whose claim went
//!   stale cannot overwrite the job's new holder
//! - Retries are new rows (`retry_of`), never in-place resets
//!
//! ## Components
//!
//! - `JobStore`: the storage port used by the service and the orchestrator
//! - `InMemoryJobStore`: process-local store for tests and single-node runs
//! - `PostgresJobStore`: `sqlx`-backed store

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{AnalysisCounts, JobStats, JobStore, JobStoreError, ReportCounts};
