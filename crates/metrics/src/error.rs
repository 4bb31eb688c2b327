use thiserror::Error;

/// The input could not be read as tabular data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedInputError {
    #[error("input is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("unparseable CSV: {0}")]
    Csv(String),

    #[error("input has no columns")]
    NoColumns,

    #[error("row {row} has {found} fields but the header has {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
}
