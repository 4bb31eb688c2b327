//! Raw tabular input.

use serde::{Deserialize, Serialize};

use crate::error::MalformedInputError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A header row plus data rows, every cell kept as the original text.
///
/// Rows shorter than the header are padded with empty cells (an empty cell
/// counts as a missing value). Rows longer than the header are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table from an already-parsed row set.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, MalformedInputError> {
        if columns.is_empty() {
            return Err(MalformedInputError::NoColumns);
        }

        let expected = columns.len();
        let mut padded = Vec::with_capacity(rows.len());
        for (idx, mut row) in rows.into_iter().enumerate() {
            if row.len() > expected {
                return Err(MalformedInputError::RaggedRow {
                    row: idx + 1,
                    expected,
                    found: row.len(),
                });
            }
            row.resize(expected, String::new());
            padded.push(row);
        }

        Ok(Self {
            columns,
            rows: padded,
        })
    }

    /// Parse CSV bytes (first record is the header). A leading UTF-8 BOM is ignored.
    pub fn from_csv(bytes: &[u8]) -> Result<Self, MalformedInputError> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let text =
            std::str::from_utf8(bytes).map_err(|e| MalformedInputError::Encoding(e.to_string()))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| MalformedInputError::Csv(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();

        if columns.is_empty() || columns.iter().all(|c| c.trim().is_empty()) {
            return Err(MalformedInputError::NoColumns);
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| MalformedInputError::Csv(e.to_string()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Self::new(columns, rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Position of the first column with exactly this name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cells of the named column, top to bottom.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &str> + '_> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| row[idx].as_str()))
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<String>>) {
        (self.columns, self.rows)
    }
}
