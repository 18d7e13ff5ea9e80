//! Destinations for the assembled star schema.

pub mod csv_export;
pub mod postgres;
pub mod warehouse;

pub use csv_export::{CsvOutcome, CsvReport};
pub use postgres::PgWarehouse;
pub use warehouse::{load, LoadReport, Warehouse, DEFAULT_BATCH_SIZE};
