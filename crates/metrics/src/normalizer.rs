//! Column discovery and aggregation.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aliases::{self, CanonicalMetric, DATE_ALIASES, LABEL_ALIASES, RANKING_COLUMNS};
use crate::error::MalformedInputError;
use crate::table::Table;

/// Date formats tried (in order) when ordering the date column chronologically.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Aggregates of one numeric column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub total: f64,
    pub average: f64,
    pub max: f64,
    pub min: f64,
}

impl MetricSummary {
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let total: f64 = values.iter().sum();
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        Some(Self {
            total,
            average: total / values.len() as f64,
            max,
            min,
        })
    }
}

/// First and last reporting date, as written in the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

/// Which input column was chosen for each role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub metrics: BTreeMap<CanonicalMetric, String>,
    pub date: Option<String>,
    pub label: Option<String>,
    pub ranking: Option<String>,
}

/// Canonical, alias-resolved summary of one table.
///
/// Derived once when an analysis job starts processing, handed to the
/// analysis capability and then dropped; it is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMetrics {
    pub total_rows: usize,
    pub columns: Vec<String>,
    pub mapping: ColumnMapping,
    pub metrics: BTreeMap<CanonicalMetric, MetricSummary>,
    pub date_range: Option<DateRange>,
    /// Labels of the top-ranked entities, best first.
    pub top_entities: Option<Vec<String>>,
    /// Every input row, verbatim, in input order.
    pub records: Vec<Vec<String>>,
}

impl NormalizedMetrics {
    pub fn metric(&self, metric: CanonicalMetric) -> Option<&MetricSummary> {
        self.metrics.get(&metric)
    }

    /// Rows as JSON objects keyed by column name, numbers coerced where they parse.
    pub fn records_json(&self) -> Vec<serde_json::Value> {
        self.records
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(col, cell)| (col.clone(), cell_to_json(cell)))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect()
    }
}

/// Normalizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    /// How many entities the ranking pass keeps.
    pub top_n: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self { top_n: 5 }
    }
}

impl Normalizer {
    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Parse CSV bytes and normalize them.
    pub fn normalize_csv(&self, bytes: &[u8]) -> Result<NormalizedMetrics, MalformedInputError> {
        let table = Table::from_csv(bytes)?;
        Ok(self.normalize(&table))
    }

    /// Normalize an already-parsed table. Never fails: unmatched or
    /// non-numeric columns only drop the affected metric.
    pub fn normalize(&self, table: &Table) -> NormalizedMetrics {
        let columns = table.columns().to_vec();
        let mut mapping = ColumnMapping::default();
        let mut metrics = BTreeMap::new();

        for metric in CanonicalMetric::ALL {
            let Some(column) = aliases::first_present(metric.aliases(), &columns) else {
                continue;
            };
            mapping.metrics.insert(metric, column.to_string());

            match numeric_column(table, column).and_then(|values| MetricSummary::from_values(&values)) {
                Some(summary) => {
                    metrics.insert(metric, summary);
                }
                None => debug!(%metric, column, "metric column has no numeric values; omitted"),
            }
        }

        let date_range = aliases::first_present(DATE_ALIASES, &columns).and_then(|column| {
            mapping.date = Some(column.to_string());
            date_range(table, column)
        });

        let top_entities = self.rank(table, &columns, &mut mapping);

        NormalizedMetrics {
            total_rows: table.row_count(),
            columns,
            mapping,
            metrics,
            date_range,
            top_entities,
            records: table.rows().to_vec(),
        }
    }

    fn rank(&self, table: &Table, columns: &[String], mapping: &mut ColumnMapping) -> Option<Vec<String>> {
        let label = aliases::first_present(LABEL_ALIASES, columns)?;
        mapping.label = Some(label.to_string());

        let sort_by = aliases::first_present(RANKING_COLUMNS, columns)?;
        mapping.ranking = Some(sort_by.to_string());

        let label_idx = table.column_index(label)?;
        let sort_idx = table.column_index(sort_by)?;

        let ranked = match numeric_column(table, sort_by) {
            Some(_) => {
                let mut scored: Vec<(f64, &str)> = table
                    .rows()
                    .iter()
                    .filter_map(|row| {
                        parse_cell(&row[sort_idx])
                            .flatten()
                            .map(|value| (value, row[label_idx].as_str()))
                    })
                    .collect();
                // Stable: equal scores keep input order.
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                scored
                    .into_iter()
                    .take(self.top_n)
                    .map(|(_, label)| label.to_string())
                    .collect()
            }
            // Unsortable column: fall back to the first rows.
            None => table
                .rows()
                .iter()
                .take(self.top_n)
                .map(|row| row[label_idx].clone())
                .collect(),
        };

        Some(ranked)
    }
}

/// Normalize with default settings.
pub fn normalize(table: &Table) -> NormalizedMetrics {
    Normalizer::default().normalize(table)
}

/// Parse and normalize CSV bytes with default settings.
pub fn normalize_csv(bytes: &[u8]) -> Result<NormalizedMetrics, MalformedInputError> {
    Normalizer::default().normalize_csv(bytes)
}

/// `Some(None)` for a missing cell, `Some(Some(v))` for a number, `None` when
/// the cell cannot be coerced.
fn parse_cell(cell: &str) -> Option<Option<f64>> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Some(None);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(Some(v)),
        Ok(_) => Some(None),
        Err(_) => None,
    }
}

/// All present values of a column, or `None` if any cell is non-numeric.
fn numeric_column(table: &Table, column: &str) -> Option<Vec<f64>> {
    let mut values = Vec::with_capacity(table.row_count());
    for cell in table.column(column)? {
        if let Some(v) = parse_cell(cell)? {
            values.push(v);
        }
    }
    Some(values)
}

fn date_range(table: &Table, column: &str) -> Option<DateRange> {
    let cells: Vec<&str> = table
        .column(column)?
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if cells.is_empty() {
        return None;
    }

    let parsed: Option<Vec<NaiveDate>> = cells.iter().map(|c| parse_date(c)).collect();
    let (start, end) = match parsed {
        Some(dates) => {
            let first = dates.iter().enumerate().min_by_key(|(_, d)| **d)?.0;
            let last = dates.iter().enumerate().max_by_key(|(_, d)| **d)?.0;
            (cells[first], cells[last])
        }
        None => (*cells.iter().min()?, *cells.iter().max()?),
    };

    Some(DateRange {
        start: start.to_string(),
        end: end.to_string(),
    })
}

fn parse_date(cell: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cell, fmt).ok())
}

fn cell_to_json(cell: &str) -> serde_json::Value {
    match parse_cell(cell) {
        Some(None) => serde_json::Value::Null,
        Some(Some(v)) => serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::String(cell.to_string()),
    }
}
