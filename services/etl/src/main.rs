//! ETL Service - Builds the epidemic star schema from raw case-count exports
//!
//! Responsibilities:
//! - Discover and read source files (CSV/XLS) from the input directory
//! - Canonicalize each layout and build the shared dimensions
//! - Assemble the fact table with contiguous ids
//! - Write one CSV per table, optionally reload Postgres and verify counts
//!
//! Same input directory = same tables, same ids.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use etl::config::PipelineConfig;
use etl::persist::PgWarehouse;
use etl::pipeline::{self, RunReport};

const REPORT_FILE: &str = "run_report.json";

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Builds the epidemic star schema from raw exports")]
struct Args {
    /// Path to the JSON config file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Also reload the relational store
    #[arg(long, default_value = "false")]
    load_to_db: bool,

    /// Override the configured input directory
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Override the configured output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override the fact insert batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Write the effective config to --config and exit
    #[arg(long, default_value = "false")]
    init_config: bool,
}

impl Args {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.input_dir {
            config.input_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Open the warehouse and make sure the four tables exist.
async fn connect(config: &PipelineConfig) -> etl::Result<PgWarehouse> {
    let warehouse = PgWarehouse::connect(config.connect_options()?).await?;
    warehouse.ensure_schema().await?;
    Ok(warehouse)
}

fn print_summary(report: &RunReport) {
    println!("\n=== ETL Summary ===");
    println!("Run ID: {}", report.run_id);
    println!("Elapsed: {:.2}s", report.elapsed_ms as f64 / 1000.0);
    println!("Rows extracted: {}", report.extracted);
    println!("Rows canonicalized: {}", report.canonicalized);
    println!("Rows dropped during assembly: {}", report.dropped());

    println!("\nSources:");
    for source in &report.sources {
        println!(
            "  {} [{}, {}]: {} rows -> {} facts (skipped {}, dropped {})",
            source.name,
            source.format.unwrap_or("unknown"),
            source.disease,
            source.canonical.rows_in,
            source.assembly.emitted,
            source.canonical.skipped(),
            source.assembly.dropped()
        );
    }

    println!("\nTables:");
    for (table, rows) in &report.tables {
        println!("  {}: {} rows", table, rows);
    }

    println!("\nCSV files:");
    for outcome in &report.csv.tables {
        match (&outcome.rows, &outcome.error) {
            (Some(rows), _) => println!("  {}: {} rows", outcome.path.display(), rows),
            (None, Some(e)) => println!("  {}: FAILED ({})", outcome.path.display(), e),
            (None, None) => println!("  {}: not written", outcome.path.display()),
        }
    }

    let Some(load) = &report.load else {
        return;
    };
    println!("\nDatabase:");
    if let Some(reason) = &load.aborted {
        println!("  Load aborted: {}", reason);
        return;
    }
    for table in &load.tables {
        match &table.error {
            None => println!(
                "  {}: {} rows in {} commit(s)",
                table.table, table.rows, table.batches
            ),
            Some(e) => println!(
                "  {}: {} rows committed, then FAILED ({})",
                table.table, table.rows, e
            ),
        }
    }
    for check in &load.verification {
        let actual = check
            .actual
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        let status = if check.matches() { "OK" } else { "MISMATCH" };
        println!(
            "  verify {}: expected {}, found {} {}",
            check.table, check.expected, actual, status
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let mut config = PipelineConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.init_config {
        config
            .save(&args.config)
            .with_context(|| format!("Failed to write config {}", args.config.display()))?;
        println!("Configuration written to {}", args.config.display());
        return Ok(());
    }

    println!("=== Epidemic Star Schema ETL ===");
    println!("Input: {}", config.input_dir.display());
    println!("Output: {}", config.output_dir.display());
    println!("Mode: {}", if args.load_to_db { "csv + database" } else { "csv only" });

    let extracted = pipeline::extract(&config).await.with_context(|| {
        format!("Failed to read input directory {}", config.input_dir.display())
    })?;

    for (path, reason) in &extracted.skipped {
        println!("Skipped {}: {}", path.display(), reason);
    }
    if extracted.inputs.is_empty() {
        println!("No source files found in {}", config.input_dir.display());
        return Ok(());
    }
    println!("Sources: {}", extracted.inputs.len());

    // A connection failure only cancels the database load
    let relational = if args.load_to_db {
        Some(connect(&config).await)
    } else {
        None
    };
    let report = pipeline::run(&config, &extracted.inputs, relational).await;

    let report_path = config.output_dir.join(REPORT_FILE);
    match report.save(&report_path) {
        Ok(()) => tracing::info!(path = %report_path.display(), "wrote run report"),
        Err(e) => {
            tracing::warn!(path = %report_path.display(), error = %e, "cannot write run report")
        }
    }

    print_summary(&report);
    println!("\n=== ETL Complete ===");

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
