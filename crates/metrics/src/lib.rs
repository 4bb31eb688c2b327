//! `adsight-metrics`
//!
//! **Responsibility:** turn heterogeneous advertising exports into a canonical
//! metrics summary.
//!
//! Column naming varies between exports, so discovery is best-effort: metrics
//! without a matching column are simply absent, and a column that cannot be
//! aggregated drops only that metric. The only hard failure is input that is
//! not tabular at all.

pub mod aliases;
pub mod error;
pub mod normalizer;
pub mod prompt;
pub mod table;

pub use aliases::CanonicalMetric;
pub use error::MalformedInputError;
pub use normalizer::{
    ColumnMapping, DateRange, MetricSummary, NormalizedMetrics, Normalizer, normalize, normalize_csv,
};
pub use table::Table;
