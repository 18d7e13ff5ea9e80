//! Raw source tables and the thin extraction layer that fills them.
//!
//! A [`RawTable`] is an already-parsed delimited file: named columns plus
//! rows of trimmed text cells. Nothing here interprets cell values; that is
//! the job of the canonicalizer and the fact assembler.

use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::dimensions::Disease;
use crate::{Error, Result};

// =============================================================================
// Source identity
// =============================================================================

/// The three raw layouts the pipeline knows how to canonicalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// `Date, Country/Region, Confirmed, Deaths, Recovered, Active`
    CleanComplete,
    /// `date, location, total_cases, total_deaths, new_cases, new_deaths, ...`
    OwidMonkeypox,
    /// `date, country, cumulative_total_cases, cumulative_total_deaths,
    /// daily_new_cases, daily_new_deaths`
    WorldometerDaily,
}

/// File-name fragments used when no explicit format tag is configured.
const FORMAT_MARKERS: &[(&str, SourceFormat)] = &[
    ("covid_19_clean_complete", SourceFormat::CleanComplete),
    ("monkeypox", SourceFormat::OwidMonkeypox),
    ("worldometer", SourceFormat::WorldometerDaily),
];

impl SourceFormat {
    /// Guess the layout from a file name. Fallback heuristic only.
    pub fn sniff(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        FORMAT_MARKERS
            .iter()
            .find(|(marker, _)| lower.contains(marker))
            .map(|(_, format)| *format)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CleanComplete => "clean_complete",
            Self::OwidMonkeypox => "owid_monkeypox",
            Self::WorldometerDaily => "worldometer_daily",
        }
    }
}

/// One input of a pipeline run: where it came from and how to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    /// `None` means the layout is unknown and the source passes through.
    pub format: Option<SourceFormat>,
    pub disease: Disease,
}

impl Source {
    /// Build a source whose format and disease are sniffed from its name.
    pub fn sniffed(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            format: SourceFormat::sniff(&name),
            disease: Disease::sniff(&name),
            name,
        }
    }

    /// Build a source with explicit tags; missing tags fall back to sniffing.
    /// Without a disease tag, the monkeypox marker is looked for in the
    /// name and in the resolved format tag.
    pub fn tagged(
        name: impl Into<String>,
        format: Option<SourceFormat>,
        disease: Option<Disease>,
    ) -> Self {
        let sniffed = Self::sniffed(name);
        let format = format.or(sniffed.format);
        let disease = disease.unwrap_or_else(|| match format {
            Some(f) if Disease::sniff(f.as_str()) == Disease::Monkeypox => Disease::Monkeypox,
            _ => sniffed.disease,
        });
        Self {
            format,
            disease,
            name: sniffed.name,
        }
    }
}

// =============================================================================
// Raw tables
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Convenience constructor for literal tables.
    pub fn from_strs(columns: &[&str], rows: &[&[&str]]) -> Self {
        let mut table = Self::new(columns.iter().map(|c| c.to_string()).collect());
        for row in rows {
            table.push_row(row.iter().map(|v| v.to_string()).collect());
        }
        table
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = RawRow<'_>> {
        self.rows.iter().enumerate().map(move |(index, values)| RawRow {
            table: self,
            values,
            index,
        })
    }
}

/// A borrowed view of one row, addressed by column name.
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    table: &'a RawTable,
    values: &'a [String],
    index: usize,
}

impl<'a> RawRow<'a> {
    /// Cell value for `column`. Missing columns, short rows and blank cells
    /// all read as `None` (null).
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = self.table.column_index(column)?;
        let value = self.values.get(idx)?.trim();
        (!value.is_empty()).then_some(value)
    }

    /// 1-based line number in the source file, header included.
    pub fn line(&self) -> usize {
        self.index + 2
    }
}

// =============================================================================
// Extraction
// =============================================================================

const SOURCE_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls"];

/// List readable source files in `dir`, sorted by file name so that source
/// processing order (and with it fact ids) is stable across runs.
pub async fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SOURCE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if supported {
            paths.push(path);
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

/// Read one source file into a [`RawTable`].
pub async fn read_source(path: &Path) -> Result<RawTable> {
    let is_workbook = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_lowercase().as_str(), "xlsx" | "xls"))
        .unwrap_or(false);

    if is_workbook {
        return read_workbook(path);
    }

    let bytes = fs::read(path).await?;
    let content = decode_text(&bytes);
    let table = parse_csv(&content)?;
    if table.columns().is_empty() {
        return Err(Error::EmptySource(path.display().to_string()));
    }
    Ok(table)
}

/// Decode file bytes as UTF-8, falling back to Windows-1252 for legacy
/// exports. A leading BOM is removed.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Parse comma-delimited text with a header row.
pub fn parse_csv(content: &str) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let mut table = RawTable::new(columns);

    for (line_idx, result) in reader.records().enumerate() {
        match result {
            Ok(record) => table.push_row(record.iter().map(|v| v.to_string()).collect()),
            Err(e) => {
                tracing::debug!(line = line_idx + 2, error = %e, "skipping malformed csv record");
            }
        }
    }

    Ok(table)
}

/// Read the first sheet of a workbook; the first row is the header.
fn read_workbook(path: &Path) -> Result<RawTable> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| Error::EmptySource(path.display().to_string()))?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| Error::EmptySource(path.display().to_string()))?;
    let mut table = RawTable::new(header.iter().map(cell_text).collect());

    for row in rows {
        table.push_row(row.iter().map(cell_text).collect());
    }

    tracing::debug!(
        path = %path.display(),
        sheet = %sheet_name,
        rows = table.len(),
        "read workbook"
    );
    Ok(table)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_known_file_names() {
        assert_eq!(
            SourceFormat::sniff("covid_19_clean_complete.csv"),
            Some(SourceFormat::CleanComplete)
        );
        assert_eq!(
            SourceFormat::sniff("owid-monkeypox-data.csv"),
            Some(SourceFormat::OwidMonkeypox)
        );
        assert_eq!(
            SourceFormat::sniff("worldometer_coronavirus_daily_data.csv"),
            Some(SourceFormat::WorldometerDaily)
        );
        assert_eq!(SourceFormat::sniff("unrelated.csv"), None);
    }

    #[test]
    fn test_sniff_is_case_insensitive() {
        assert_eq!(
            SourceFormat::sniff("OWID-MONKEYPOX-2023.csv"),
            Some(SourceFormat::OwidMonkeypox)
        );
    }

    #[test]
    fn test_explicit_tags_override_sniffing() {
        let source = Source::tagged(
            "export.csv",
            Some(SourceFormat::OwidMonkeypox),
            Some(Disease::Monkeypox),
        );
        assert_eq!(source.format, Some(SourceFormat::OwidMonkeypox));
        assert_eq!(source.disease, Disease::Monkeypox);

        let fallback = Source::tagged("owid-monkeypox-data.csv", None, None);
        assert_eq!(fallback.format, Some(SourceFormat::OwidMonkeypox));
        assert_eq!(fallback.disease, Disease::Monkeypox);
    }

    #[test]
    fn test_format_tag_carries_monkeypox_marker() {
        let source = Source::tagged("export.csv", Some(SourceFormat::OwidMonkeypox), None);
        assert_eq!(source.disease, Disease::Monkeypox);
        assert_eq!(source.disease.id(), 2);

        let covid = Source::tagged("export.csv", Some(SourceFormat::WorldometerDaily), None);
        assert_eq!(covid.disease, Disease::Covid19);

        // An explicit disease tag still wins over the format
        let forced = Source::tagged(
            "export.csv",
            Some(SourceFormat::OwidMonkeypox),
            Some(Disease::Covid19),
        );
        assert_eq!(forced.disease, Disease::Covid19);
    }

    #[test]
    fn test_parse_csv_trims_and_reads_nulls() {
        let table = parse_csv("date,location,total_cases\n 2022-05-01 , US ,\n").unwrap();
        assert_eq!(table.len(), 1);
        let row = table.rows().next().unwrap();
        assert_eq!(row.get("date"), Some("2022-05-01"));
        assert_eq!(row.get("location"), Some("US"));
        assert_eq!(row.get("total_cases"), None);
        assert_eq!(row.get("no_such_column"), None);
        assert_eq!(row.line(), 2);
    }

    #[test]
    fn test_parse_csv_short_rows_read_as_null() {
        let table = parse_csv("a,b,c\n1,2\n").unwrap();
        let row = table.rows().next().unwrap();
        assert_eq!(row.get("a"), Some("1"));
        assert_eq!(row.get("c"), None);
    }

    #[test]
    fn test_decode_text_strips_bom() {
        let bytes = b"\xEF\xBB\xBFdate,country\n";
        assert_eq!(decode_text(bytes), "date,country\n");
    }

    #[test]
    fn test_decode_text_falls_back_to_windows_1252() {
        // "Curaçao" with 0xE7 for 'ç'
        let bytes = b"Cura\xE7ao";
        assert_eq!(decode_text(bytes), "Curaçao");
    }

    #[tokio::test]
    async fn test_discover_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.csv", "notes.txt", "c.xlsx"] {
            std::fs::write(dir.path().join(name), "x\n").unwrap();
        }
        let found = discover(dir.path()).await.unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.csv", "c.xlsx"]);
    }

    #[tokio::test]
    async fn test_read_source_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owid-monkeypox-data.csv");
        std::fs::write(&path, "date,location\n2022-05-01,US\n").unwrap();
        let table = read_source(&path).await.unwrap();
        assert!(table.has_column("location"));
        assert_eq!(table.len(), 1);
    }
}
