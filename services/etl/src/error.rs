//! Error types for the ETL service.
//!
//! [`Error`] covers failures that stop a whole stage or destination (a file
//! that cannot be read, a database that cannot be reached). [`RowError`]
//! covers a single bad row: it is never propagated, only counted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("workbook error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A source file parsed but held no header row.
    #[error("source '{0}' has no header row")]
    EmptySource(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a single source row was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("cannot parse date '{0}'")]
    BadDate(String),

    #[error("field '{field}': cannot parse '{value}' as a count")]
    BadNumber { field: &'static str, value: String },
}
