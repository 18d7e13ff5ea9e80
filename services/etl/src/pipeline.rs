//! Pipeline orchestration.
//!
//! extract -> canonicalize -> dimensions -> facts -> persist. Stages run
//! strictly in that order; dimensions need every source canonicalized
//! before the first fact can be keyed. Nothing below `run` returns an
//! error: each stage reports its counts and the run always completes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::canonical::{canonicalize, CanonicalStats};
use crate::config::PipelineConfig;
use crate::dimensions::{
    build_calendar, build_disease, build_location, CalendarIndex, LocationIndex,
};
use crate::facts::{AssemblyStats, FactAssembler};
use crate::persist::{self, csv_export, CsvReport, LoadReport, Warehouse};
use crate::schema::{StarSchema, TABLES};
use crate::source::{self, RawTable, Source};
use crate::Result;

// =============================================================================
// Extraction
// =============================================================================

/// Source files read for one run, in file-name order.
#[derive(Debug, Default)]
pub struct Extracted {
    pub inputs: Vec<(Source, RawTable)>,
    /// Files that were found but could not be read, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Read every supported file in `config.input_dir`. Only a missing or
/// unreadable directory is an error; bad files are skipped.
pub async fn extract(config: &PipelineConfig) -> Result<Extracted> {
    let mut out = Extracted::default();

    for path in source::discover(&config.input_dir).await? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match source::read_source(&path).await {
            Ok(raw) => {
                let source = config.source_for(&name);
                tracing::info!(
                    source = %name,
                    format = source.format.map(|f| f.as_str()).unwrap_or("unknown"),
                    rows = raw.len(),
                    "extracted source"
                );
                out.inputs.push((source, raw));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable source");
                out.skipped.push((path, e.to_string()));
            }
        }
    }

    Ok(out)
}

// =============================================================================
// Assembly
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub format: Option<&'static str>,
    pub disease: &'static str,
    pub canonical: CanonicalStats,
    pub assembly: AssemblyStats,
}

#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub schema: StarSchema,
    pub sources: Vec<SourceReport>,
}

/// Build the star schema from already-parsed sources. Pure: the same
/// inputs in the same order produce the same tables.
pub fn build_schema(inputs: &[(Source, RawTable)]) -> Assembly {
    let canonical: Vec<_> = inputs
        .iter()
        .map(|(source, raw)| canonicalize(source, raw))
        .collect();

    let records = canonical.iter().flat_map(|c| c.records.iter());
    let calendar = build_calendar(records.clone());
    let location = build_location(records);
    let disease = build_disease();
    tracing::info!(
        calendar = calendar.len(),
        location = location.len(),
        disease = disease.len(),
        "built dimensions"
    );

    let calendar_index = CalendarIndex::new(&calendar);
    let location_index = LocationIndex::new(&location);
    let mut assembler = FactAssembler::new(&calendar_index, &location_index);

    let mut data = Vec::new();
    let mut sources = Vec::with_capacity(inputs.len());
    for ((source, raw), canonicalized) in inputs.iter().zip(canonical) {
        let assembled = assembler.assemble(source, raw);
        data.extend(assembled.facts);
        sources.push(SourceReport {
            name: source.name.clone(),
            format: source.format.map(|f| f.as_str()),
            disease: source.disease.label(),
            canonical: canonicalized.stats,
            assembly: assembled.stats,
        });
    }
    tracing::info!(facts = assembler.emitted(), "assembled fact table");

    Assembly {
        schema: StarSchema {
            calendar,
            location,
            disease,
            data,
        },
        sources,
    }
}

// =============================================================================
// Run
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    /// Raw rows read across all sources.
    pub extracted: usize,
    /// Canonical records produced across all sources.
    pub canonicalized: usize,
    pub sources: Vec<SourceReport>,
    /// In-memory size of every table.
    pub tables: Vec<(&'static str, usize)>,
    pub csv: CsvReport,
    /// `None` when the relational destination was not requested.
    pub load: Option<LoadReport>,
}

impl RunReport {
    /// Facts that never made it into the table, across all sources.
    pub fn dropped(&self) -> usize {
        self.sources.iter().map(|s| s.assembly.dropped()).sum()
    }

    /// Write the report as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Assemble `inputs` and persist them: CSV always, the warehouse when one
/// was requested. `relational` carries the outcome of connecting; a failed
/// connection only abandons the relational load. The warehouse load starts
/// after the CSV export and does not depend on its outcome.
pub async fn run<W: Warehouse>(
    config: &PipelineConfig,
    inputs: &[(Source, RawTable)],
    relational: Option<Result<W>>,
) -> RunReport {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    tracing::info!(%run_id, sources = inputs.len(), "pipeline run started");

    let Assembly { schema, sources } = build_schema(inputs);

    let extracted = inputs.iter().map(|(_, raw)| raw.len()).sum();
    let canonicalized = sources.iter().map(|s| s.canonical.rows_out).sum();
    let tables = TABLES
        .into_iter()
        .map(|t| (t, schema.row_count(t).unwrap_or(0)))
        .collect();

    let csv = csv_export::export(&schema, &config.output_dir, &config.csv_prefix);

    let load = match relational {
        None => None,
        Some(Ok(mut wh)) => Some(persist::load(&mut wh, &schema, config.batch_size).await),
        Some(Err(e)) => {
            tracing::error!(error = %e, "cannot reach database, skipping relational load");
            Some(LoadReport::abandoned(format!("connection failed: {e}")))
        }
    };

    let elapsed_ms = (Utc::now() - started_at).num_milliseconds();
    tracing::info!(%run_id, elapsed_ms, "pipeline run finished");

    RunReport {
        run_id,
        started_at,
        elapsed_ms,
        extracted,
        canonicalized,
        sources,
        tables,
        csv,
        load,
    }
}

// =============================================================================
// TESTS
// =============================================================================
