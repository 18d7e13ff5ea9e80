//! Epidemic case-count ETL.
//!
//! Reconciles three raw export layouts into one star schema (`calendar`,
//! `location`, `disease` dimensions plus the `data` fact table) and
//! persists it to CSV and, optionally, Postgres.

pub mod canonical;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod facts;
pub mod persist;
pub mod pipeline;
pub mod schema;
pub mod source;

pub use error::{Error, Result, RowError};
