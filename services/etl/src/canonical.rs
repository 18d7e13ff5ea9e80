//! Canonicalizer - maps each raw layout onto one common record shape.
//!
//! Every known layout becomes a sequence of [`CanonicalRecord`]s
//! `{region, date, confirmed, deaths, recovered, active}`. Missing counts
//! read as zero, `active` is derived as `confirmed - deaths` when the
//! layout does not carry it, and the clean-complete layout is aggregated
//! by `(region, date)`.
//!
//! This module is DETERMINISTIC: same table = same records, same order.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::error::RowError;
use crate::source::{RawRow, RawTable, Source, SourceFormat};

/// A row normalized to the common shape, independent of its source layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub region: String,
    pub date: NaiveDate,
    pub confirmed: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub active: i64,
}

/// Column names of one raw layout. Optional columns are not present in
/// every layout.
#[derive(Debug)]
pub struct Layout {
    pub date: &'static str,
    pub region: &'static str,
    pub confirmed: &'static str,
    pub deaths: &'static str,
    pub recovered: Option<&'static str>,
    pub active: Option<&'static str>,
    pub new_cases: Option<&'static str>,
    pub new_deaths: Option<&'static str>,
}

static CLEAN_COMPLETE: Layout = Layout {
    date: "Date",
    region: "Country/Region",
    confirmed: "Confirmed",
    deaths: "Deaths",
    recovered: Some("Recovered"),
    active: Some("Active"),
    new_cases: None,
    new_deaths: None,
};

static OWID_MONKEYPOX: Layout = Layout {
    date: "date",
    region: "location",
    confirmed: "total_cases",
    deaths: "total_deaths",
    recovered: None,
    active: None,
    new_cases: Some("new_cases"),
    new_deaths: Some("new_deaths"),
};

static WORLDOMETER_DAILY: Layout = Layout {
    date: "date",
    region: "country",
    confirmed: "cumulative_total_cases",
    deaths: "cumulative_total_deaths",
    recovered: None,
    active: None,
    new_cases: Some("daily_new_cases"),
    new_deaths: Some("daily_new_deaths"),
};

impl SourceFormat {
    pub fn layout(self) -> &'static Layout {
        match self {
            Self::CleanComplete => &CLEAN_COMPLETE,
            Self::OwidMonkeypox => &OWID_MONKEYPOX,
            Self::WorldometerDaily => &WORLDOMETER_DAILY,
        }
    }
}

/// Per-source canonicalization counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanonicalStats {
    pub rows_in: usize,
    pub rows_out: usize,
    pub skipped_missing_field: usize,
    pub skipped_bad_date: usize,
    pub skipped_bad_number: usize,
    /// Negative counts that were clamped to zero.
    pub clamped_negative: usize,
    /// The layout was not recognized; the source contributed nothing.
    pub passthrough: bool,
}

impl CanonicalStats {
    pub fn skipped(&self) -> usize {
        self.skipped_missing_field + self.skipped_bad_date + self.skipped_bad_number
    }

    pub(crate) fn record_skip(&mut self, err: &RowError) {
        match err {
            RowError::MissingField(_) => self.skipped_missing_field += 1,
            RowError::BadDate(_) => self.skipped_bad_date += 1,
            RowError::BadNumber { .. } => self.skipped_bad_number += 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Canonicalized {
    pub records: Vec<CanonicalRecord>,
    pub stats: CanonicalStats,
}

/// Canonicalize one source. Bad rows are skipped and counted; an unknown
/// layout yields no records.
pub fn canonicalize(source: &Source, raw: &RawTable) -> Canonicalized {
    let Some(format) = source.format else {
        tracing::warn!(
            source = %source.name,
            rows = raw.len(),
            "no canonicalizer for source, passing through"
        );
        return Canonicalized {
            records: Vec::new(),
            stats: CanonicalStats {
                rows_in: raw.len(),
                passthrough: true,
                ..Default::default()
            },
        };
    };

    let mut stats = CanonicalStats {
        rows_in: raw.len(),
        ..Default::default()
    };

    let records = match format {
        SourceFormat::CleanComplete => aggregate_clean_complete(raw, &mut stats),
        SourceFormat::OwidMonkeypox | SourceFormat::WorldometerDaily => {
            map_cumulative(raw, format.layout(), &mut stats)
        }
    };
    stats.rows_out = records.len();

    tracing::info!(
        source = %source.name,
        format = format.as_str(),
        rows_in = stats.rows_in,
        rows_out = stats.rows_out,
        skipped = stats.skipped(),
        "canonicalized source"
    );

    Canonicalized { records, stats }
}

/// Clean-complete rows: nulls become zero, then duplicate `(region, date)`
/// pairs (one per province) are summed. Ordered by region, then date.
pub(crate) fn aggregate_clean_complete(
    raw: &RawTable,
    stats: &mut CanonicalStats,
) -> Vec<CanonicalRecord> {
    let layout = SourceFormat::CleanComplete.layout();
    let active_present = layout.active.map(|c| raw.has_column(c)).unwrap_or(false);

    // BTreeMap keeps the output order deterministic
    let mut groups: BTreeMap<(String, NaiveDate), [i64; 4]> = BTreeMap::new();

    for row in raw.rows() {
        let parsed = parse_head(&row, layout, stats).and_then(|head| {
            let recovered = optional_count(&row, layout.recovered, stats)?;
            let active = if active_present {
                optional_count(&row, layout.active, stats)?
            } else {
                (head.confirmed - head.deaths).max(0)
            };
            Ok((head, recovered, active))
        });

        match parsed {
            Ok((head, recovered, active)) => {
                let sums = groups.entry((head.region, head.date)).or_insert([0; 4]);
                for (sum, value) in sums
                    .iter_mut()
                    .zip([head.confirmed, head.deaths, recovered, active])
                {
                    *sum = sum.saturating_add(value);
                }
            }
            Err(e) => skip(&row, &e, stats),
        }
    }

    groups
        .into_iter()
        .map(|((region, date), [confirmed, deaths, recovered, active])| CanonicalRecord {
            region,
            date,
            confirmed,
            deaths,
            recovered,
            active,
        })
        .collect()
}

/// Layouts that carry cumulative totals only: rename, `recovered = 0`,
/// `active = confirmed - deaths`.
fn map_cumulative(
    raw: &RawTable,
    layout: &'static Layout,
    stats: &mut CanonicalStats,
) -> Vec<CanonicalRecord> {
    let mut records = Vec::with_capacity(raw.len());
    for row in raw.rows() {
        match parse_head(&row, layout, stats) {
            Ok(head) => records.push(CanonicalRecord {
                active: (head.confirmed - head.deaths).max(0),
                region: head.region,
                date: head.date,
                confirmed: head.confirmed,
                deaths: head.deaths,
                recovered: 0,
            }),
            Err(e) => skip(&row, &e, stats),
        }
    }
    records
}

fn skip(row: &RawRow<'_>, err: &RowError, stats: &mut CanonicalStats) {
    tracing::debug!(line = row.line(), error = %err, "skipping row");
    stats.record_skip(err);
}

/// The fields every layout shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowHead {
    pub region: String,
    pub date: NaiveDate,
    pub confirmed: i64,
    pub deaths: i64,
}

pub(crate) fn parse_head(
    row: &RawRow<'_>,
    layout: &Layout,
    stats: &mut CanonicalStats,
) -> Result<RowHead, RowError> {
    let date = row
        .get(layout.date)
        .ok_or(RowError::MissingField(layout.date))
        .and_then(parse_date)?;
    let region = row
        .get(layout.region)
        .ok_or(RowError::MissingField(layout.region))?
        .to_string();
    let confirmed = optional_count(row, Some(layout.confirmed), stats)?;
    let deaths = optional_count(row, Some(layout.deaths), stats)?;
    Ok(RowHead {
        region,
        date,
        confirmed,
        deaths,
    })
}

/// Read a count column; null (or an absent column) reads as zero and
/// negative values are clamped to zero.
pub(crate) fn optional_count(
    row: &RawRow<'_>,
    column: Option<&'static str>,
    stats: &mut CanonicalStats,
) -> Result<i64, RowError> {
    let Some(column) = column else {
        return Ok(0);
    };
    match row.get(column) {
        None => Ok(0),
        Some(value) => {
            let count = parse_count(column, value)?;
            if count < 0 {
                stats.clamped_negative += 1;
                Ok(0)
            } else {
                Ok(count)
            }
        }
    }
}

// =============================================================================
// Value parsing
// =============================================================================

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse a calendar date in any of the layouts found in the exports.
pub fn parse_date(value: &str) -> Result<NaiveDate, RowError> {
    let value = value.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Ok(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt.date());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.date_naive());
    }
    Err(RowError::BadDate(value.to_string()))
}

/// Parse an integer count. Whole floats such as `"12.0"` are accepted
/// because spreadsheet exports write counts that way.
pub fn parse_count(field: &'static str, value: &str) -> Result<i64, RowError> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Ok(n);
    }
    match value.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(RowError::BadNumber {
            field,
            value: value.to_string(),
        }),
    }
}

// =============================================================================
// TESTS
// =============================================================================
