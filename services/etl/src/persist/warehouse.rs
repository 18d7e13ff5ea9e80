//! Relational destination: truncate, reload, verify.
//!
//! The loader talks to the store only through [`Warehouse`], so the reload
//! sequence can be exercised without a database. One invocation:
//!
//! 1. describe every table (diagnostic only)
//! 2. referential checks off, truncate `data`..`calendar`, checks back on
//! 3. dimension rows one statement each, commit per table
//! 4. fact rows in multi-row batches, commit per batch
//! 5. re-count every table and compare with the in-memory size
//!
//! Runs strictly sequentially: fact batches rely on committed dimension
//! rows.

use std::future::Future;

use serde::Serialize;

use crate::schema::{StarSchema, TableRow, Value, TABLES};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// The capabilities the loader needs from a relational store.
///
/// Writes happen inside an implicit transaction that begins with the first
/// insert and ends at [`commit`](Warehouse::commit) or
/// [`rollback`](Warehouse::rollback). `describe_table`, `truncate`,
/// `set_referential_checks` and `count_rows` run outside of it.
pub trait Warehouse: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn describe_table(
        &mut self,
        table: &'static str,
    ) -> impl Future<Output = Result<Vec<ColumnInfo>, Self::Error>> + Send + '_;

    /// Turn foreign-key enforcement off or back on for this session.
    fn set_referential_checks(
        &mut self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    fn truncate(
        &mut self,
        table: &'static str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    fn insert_row(
        &mut self,
        table: &'static str,
        columns: &'static [&'static str],
        row: Vec<Value>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Insert all `rows` with a single multi-row statement.
    fn insert_batch(
        &mut self,
        table: &'static str,
        columns: &'static [&'static str],
        rows: Vec<Vec<Value>>,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

    fn commit(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    fn rollback(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    fn count_rows(
        &mut self,
        table: &'static str,
    ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;
}

// =============================================================================
// Report
// =============================================================================

/// Rows committed for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLoad {
    pub table: &'static str,
    pub rows: usize,
    /// Committed batches; dimension tables commit once.
    pub batches: usize,
    /// Set when the table's load stopped early. Rows already committed stay
    /// counted, so a retry can resume from `rows`.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub table: &'static str,
    pub expected: usize,
    pub actual: Option<i64>,
}

impl Verification {
    pub fn matches(&self) -> bool {
        self.actual == i64::try_from(self.expected).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub tables: Vec<TableLoad>,
    pub verification: Vec<Verification>,
    /// Set when the whole load was abandoned (connection or truncate failure).
    pub aborted: Option<String>,
}

impl LoadReport {
    pub fn abandoned(reason: impl Into<String>) -> Self {
        Self {
            aborted: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn loaded(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.tables.iter().map(|t| (t.table, t.rows))
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &Verification> {
        self.verification.iter().filter(|v| !v.matches())
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Replace the contents of the four tables with `schema`.
pub async fn load<W: Warehouse>(wh: &mut W, schema: &StarSchema, batch_size: usize) -> LoadReport {
    let mut report = LoadReport::default();

    for table in TABLES {
        match wh.describe_table(table).await {
            Ok(columns) => {
                let summary: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.data_type))
                    .collect();
                tracing::info!(table, columns = %summary.join(", "), "table structure");
            }
            Err(e) => tracing::warn!(table, error = %e, "cannot inspect table structure"),
        }
    }

    if let Err(e) = truncate_all(wh).await {
        tracing::error!(error = %e, "truncate failed, abandoning relational load");
        report.aborted = Some(format!("truncate failed: {e}"));
        return report;
    }

    report.tables.push(insert_rows(wh, &schema.calendar).await);
    report.tables.push(insert_rows(wh, &schema.location).await);
    report.tables.push(insert_rows(wh, &schema.disease).await);
    report.tables.push(insert_batched(wh, &schema.data, batch_size).await);

    report.verification = verify(wh, schema).await;
    report
}

/// Truncate in reverse dependency order with referential checks off. The
/// checks are switched back on even when a truncate fails.
async fn truncate_all<W: Warehouse>(wh: &mut W) -> Result<(), W::Error> {
    wh.set_referential_checks(false).await?;

    let mut result = Ok(());
    for table in TABLES.into_iter().rev() {
        if let Err(e) = wh.truncate(table).await {
            result = Err(e);
            break;
        }
        tracing::info!(table, "truncated");
    }

    let restored = wh.set_referential_checks(true).await;
    result.and(restored)
}

/// One statement per row, one commit for the table.
async fn insert_rows<W: Warehouse, R: TableRow>(wh: &mut W, rows: &[R]) -> TableLoad {
    for row in rows {
        if let Err(e) = wh.insert_row(R::TABLE, R::COLUMNS, row.values()).await {
            return failed_table(wh, R::TABLE, 0, 0, e.to_string()).await;
        }
    }
    if let Err(e) = wh.commit().await {
        return failed_table(wh, R::TABLE, 0, 0, e.to_string()).await;
    }

    tracing::info!(table = R::TABLE, rows = rows.len(), "loaded table");
    TableLoad {
        table: R::TABLE,
        rows: rows.len(),
        batches: 1,
        error: None,
    }
}

/// Fixed-size multi-row batches, one commit per batch. A failed batch is
/// rolled back and ends the table's load; earlier batches stay committed.
async fn insert_batched<W: Warehouse, R: TableRow>(
    wh: &mut W,
    rows: &[R],
    batch_size: usize,
) -> TableLoad {
    let batch_size = batch_size.max(1);
    let total = rows.len().div_ceil(batch_size);
    let mut committed = 0;

    for (index, chunk) in rows.chunks(batch_size).enumerate() {
        let values = chunk.iter().map(R::values).collect();
        let written = match wh.insert_batch(R::TABLE, R::COLUMNS, values).await {
            Ok(_) => wh.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let error = format!("batch {}: {e}", index + 1);
            return failed_table(wh, R::TABLE, committed, index, error).await;
        }
        committed += chunk.len();
        tracing::info!(
            table = R::TABLE,
            batch = index + 1,
            of = total,
            rows = chunk.len(),
            "committed batch"
        );
    }

    tracing::info!(table = R::TABLE, rows = committed, batches = total, "loaded table");
    TableLoad {
        table: R::TABLE,
        rows: committed,
        batches: total,
        error: None,
    }
}

async fn failed_table<W: Warehouse>(
    wh: &mut W,
    table: &'static str,
    rows: usize,
    batches: usize,
    error: String,
) -> TableLoad {
    tracing::error!(table, committed_rows = rows, error = %error, "table load failed");
    if let Err(e) = wh.rollback().await {
        tracing::warn!(table, error = %e, "rollback failed");
    }
    TableLoad {
        table,
        rows,
        batches,
        error: Some(error),
    }
}

/// Compare stored row counts with the in-memory tables. Disagreement is
/// reported, never raised.
async fn verify<W: Warehouse>(wh: &mut W, schema: &StarSchema) -> Vec<Verification> {
    let mut checks = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        let expected = schema.row_count(table).unwrap_or(0);
        let actual = match wh.count_rows(table).await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(table, error = %e, "cannot count rows");
                None
            }
        };
        let check = Verification {
            table,
            expected,
            actual,
        };
        if check.matches() {
            tracing::info!(table, rows = expected, "row count verified");
        } else {
            tracing::warn!(table, expected, actual = ?actual, "row count mismatch");
        }
        checks.push(check);
    }
    checks
}

// =============================================================================
// In-memory warehouse for tests
// =============================================================================

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;

    use super::*;
    use crate::schema::DATA;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Describe(&'static str),
        Checks(bool),
        Truncate(&'static str),
        InsertRow(&'static str),
        InsertBatch(&'static str, usize),
        Commit,
        Rollback,
        Count(&'static str),
    }

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    pub struct MemoryError(pub String);

    /// Keeps committed rows per table plus a log of every call.
    #[derive(Debug, Default)]
    pub struct MemoryWarehouse {
        pub tables: BTreeMap<&'static str, Vec<Vec<Value>>>,
        pub events: Vec<Event>,
        pending: Vec<(&'static str, Vec<Value>)>,
        checks_enabled: bool,
        batch_calls: usize,
        /// Fail the n-th (0-based) `insert_batch` call.
        pub fail_batch: Option<usize>,
        pub fail_describe: bool,
        pub fail_truncate: bool,
    }

    impl MemoryWarehouse {
        pub fn new() -> Self {
            Self {
                checks_enabled: true,
                ..Default::default()
            }
        }

        pub fn rows(&self, table: &str) -> usize {
            self.tables.get(table).map(Vec::len).unwrap_or(0)
        }

        pub fn commits(&self) -> usize {
            self.events.iter().filter(|e| **e == Event::Commit).count()
        }

        pub fn batch_sizes(&self) -> Vec<usize> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::InsertBatch(_, n) => Some(*n),
                    _ => None,
                })
                .collect()
        }
    }

    impl Warehouse for MemoryWarehouse {
        type Error = MemoryError;

        async fn describe_table(
            &mut self,
            table: &'static str,
        ) -> Result<Vec<ColumnInfo>, MemoryError> {
            self.events.push(Event::Describe(table));
            if self.fail_describe {
                return Err(MemoryError(format!("relation \"{table}\" does not exist")));
            }
            Ok(vec![ColumnInfo {
                name: "id".to_string(),
                data_type: "integer".to_string(),
            }])
        }

        async fn set_referential_checks(&mut self, enabled: bool) -> Result<(), MemoryError> {
            self.events.push(Event::Checks(enabled));
            self.checks_enabled = enabled;
            Ok(())
        }

        async fn truncate(&mut self, table: &'static str) -> Result<(), MemoryError> {
            self.events.push(Event::Truncate(table));
            if self.fail_truncate {
                return Err(MemoryError("permission denied".to_string()));
            }
            if self.checks_enabled && table != DATA && self.rows(DATA) > 0 {
                return Err(MemoryError(format!("{table} is referenced by data")));
            }
            self.tables.remove(table);
            Ok(())
        }

        async fn insert_row(
            &mut self,
            table: &'static str,
            _columns: &'static [&'static str],
            row: Vec<Value>,
        ) -> Result<(), MemoryError> {
            self.events.push(Event::InsertRow(table));
            self.pending.push((table, row));
            Ok(())
        }

        async fn insert_batch(
            &mut self,
            table: &'static str,
            _columns: &'static [&'static str],
            rows: Vec<Vec<Value>>,
        ) -> Result<u64, MemoryError> {
            self.events.push(Event::InsertBatch(table, rows.len()));
            let call = self.batch_calls;
            self.batch_calls += 1;
            if self.fail_batch == Some(call) {
                return Err(MemoryError(
                    "duplicate key value violates unique constraint".to_string(),
                ));
            }
            let n = rows.len() as u64;
            self.pending.extend(rows.into_iter().map(|r| (table, r)));
            Ok(n)
        }

        async fn commit(&mut self) -> Result<(), MemoryError> {
            self.events.push(Event::Commit);
            for (table, row) in self.pending.drain(..) {
                self.tables.entry(table).or_default().push(row);
            }
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), MemoryError> {
            self.events.push(Event::Rollback);
            self.pending.clear();
            Ok(())
        }

        async fn count_rows(&mut self, table: &'static str) -> Result<i64, MemoryError> {
            self.events.push(Event::Count(table));
            Ok(self.rows(table) as i64)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
