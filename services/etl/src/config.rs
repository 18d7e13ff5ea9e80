//! Pipeline configuration.
//!
//! Read from a JSON file (default `config.json`). Every key is optional; a
//! missing file yields the defaults. `DB_URL` in the environment (or `.env`)
//! takes precedence over the `database` block.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::dimensions::Disease;
use crate::persist::DEFAULT_BATCH_SIZE;
use crate::source::{Source, SourceFormat};
use crate::{Error, Result};

/// Postgres caps a statement at 65535 bind parameters; `data` has 8 columns.
pub const MAX_BATCH_SIZE: usize = 8000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// CSV files are written as `{csv_prefix}{table}.csv`.
    #[serde(default = "default_csv_prefix")]
    pub csv_prefix: String,

    /// Fact rows per insert statement and commit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Explicit layout/disease tags. Files not listed here are sniffed
    /// from their name.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// File name inside `input_dir`.
    pub file: String,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default)]
    pub disease: Option<Disease>,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("processed")
}

fn default_csv_prefix() -> String {
    "sql_".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "epiviz".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            csv_prefix: default_csv_prefix(),
            batch_size: default_batch_size(),
            database: DatabaseConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
        }
    }
}

impl PipelineConfig {
    /// Load `path`, or the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::info!(path = %path.display(), "saved config");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(Error::Config(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.csv_prefix.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "csv_prefix must not contain a path separator: '{}'",
                self.csv_prefix
            )));
        }
        Ok(())
    }

    /// Identity of the file `file_name`: configured tags first, then sniffing.
    pub fn source_for(&self, file_name: &str) -> Source {
        match self.sources.iter().find(|s| s.file == file_name) {
            Some(entry) => Source::tagged(file_name, entry.format, entry.disease),
            None => Source::sniffed(file_name),
        }
    }

    /// Connection options: `DB_URL` when set, the `database` block otherwise.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        self.connect_options_from(std::env::var("DB_URL").ok().as_deref())
    }

    fn connect_options_from(&self, db_url: Option<&str>) -> Result<PgConnectOptions> {
        if let Some(url) = db_url.filter(|u| !u.is_empty()) {
            return Ok(url.parse::<PgConnectOptions>()?);
        }
        let db = &self.database;
        Ok(PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.user)
            .password(&db.password)
            .database(&db.database))
    }
}

// =============================================================================
// TESTS
// =============================================================================
