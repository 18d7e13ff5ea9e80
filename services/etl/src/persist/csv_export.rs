//! CSV destination: one file per table, header row, no index column.
//!
//! Tables are written independently. A failure on one file is recorded in
//! the report and the remaining tables are still written.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::schema::{StarSchema, TableRow};
use crate::Result;

/// Outcome of writing one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsvOutcome {
    pub table: &'static str,
    pub path: PathBuf,
    pub rows: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CsvReport {
    pub tables: Vec<CsvOutcome>,
}

impl CsvReport {
    pub fn written(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.tables.iter().filter_map(|t| t.rows.map(|n| (t.table, n)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &CsvOutcome> {
        self.tables.iter().filter(|t| t.error.is_some())
    }
}

pub fn table_path(dir: &Path, prefix: &str, table: &str) -> PathBuf {
    dir.join(format!("{prefix}{table}.csv"))
}

/// Write every table of `schema` under `dir` as `{prefix}{table}.csv`.
pub fn export(schema: &StarSchema, dir: &Path, prefix: &str) -> CsvReport {
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::error!(dir = %dir.display(), error = %e, "cannot create csv output directory");
    }

    let tables = vec![
        write_outcome(dir, prefix, &schema.calendar),
        write_outcome(dir, prefix, &schema.location),
        write_outcome(dir, prefix, &schema.disease),
        write_outcome(dir, prefix, &schema.data),
    ];
    CsvReport { tables }
}

fn write_outcome<R: TableRow>(dir: &Path, prefix: &str, rows: &[R]) -> CsvOutcome {
    let path = table_path(dir, prefix, R::TABLE);
    match write_table(&path, rows) {
        Ok(n) => {
            tracing::info!(table = R::TABLE, path = %path.display(), rows = n, "wrote csv");
            CsvOutcome {
                table: R::TABLE,
                path,
                rows: Some(n),
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(
                table = R::TABLE,
                path = %path.display(),
                error = %e,
                "csv write failed"
            );
            CsvOutcome {
                table: R::TABLE,
                path,
                rows: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Serialize `rows` to `path`. An empty table still gets its header row.
pub fn write_table<R: TableRow>(path: &Path, rows: &[R]) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    if rows.is_empty() {
        writer.write_record(R::COLUMNS)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(rows.len())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::{build_disease, CalendarRow, LocationRow};
    use crate::facts::FactRow;

    fn schema() -> StarSchema {
        StarSchema {
            calendar: vec![
                CalendarRow { id: 1, date_value: 20200122 },
                CalendarRow { id: 2, date_value: 20220501 },
            ],
            location: vec![LocationRow {
                id: 1,
                country: "Korea, South".to_string(),
                continent: "Unknown".to_string(),
            }],
            disease: build_disease(),
            data: vec![FactRow {
                id: 1,
                total_cases: 1,
                total_deaths: 0,
                new_cases: 0,
                new_deaths: 0,
                id_location: 1,
                id_disease: 1,
                id_calendar: 1,
            }],
        }
    }

    #[test]
    fn test_export_writes_all_tables_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let report = export(&schema(), dir.path(), "sql_");

        assert_eq!(report.failures().count(), 0);
        let written: Vec<_> = report.written().collect();
        assert_eq!(
            written,
            vec![("calendar", 2), ("location", 1), ("disease", 2), ("data", 1)]
        );

        let calendar = std::fs::read_to_string(dir.path().join("sql_calendar.csv")).unwrap();
        assert_eq!(calendar, "id,date_value\n1,20200122\n2,20220501\n");

        let location = std::fs::read_to_string(dir.path().join("sql_location.csv")).unwrap();
        assert_eq!(location, "id,country,continent\n1,\"Korea, South\",Unknown\n");

        let disease = std::fs::read_to_string(dir.path().join("sql_disease.csv")).unwrap();
        assert_eq!(disease, "id,type\n1,COVID-19\n2,Monkeypox\n");

        let data = std::fs::read_to_string(dir.path().join("sql_data.csv")).unwrap();
        assert_eq!(
            data,
            "id,total_cases,total_deaths,new_cases,new_deaths,id_location,id_disease,id_calendar\n\
             1,1,0,0,0,1,1,1\n"
        );
    }

    #[test]
    fn test_empty_table_gets_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let n = write_table::<FactRow>(&path, &[]).unwrap();
        assert_eq!(n, 0);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("id,total_cases"));
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_one_failing_table_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the calendar file name makes that write fail
        std::fs::create_dir(dir.path().join("sql_calendar.csv")).unwrap();

        let report = export(&schema(), dir.path(), "sql_");
        let failed: Vec<_> = report.failures().map(|f| f.table).collect();
        assert_eq!(failed, vec!["calendar"]);
        assert_eq!(report.written().count(), 3);
        assert!(dir.path().join("sql_data.csv").is_file());
    }
}
