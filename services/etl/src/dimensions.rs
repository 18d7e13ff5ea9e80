//! Dimension builder - calendar, location and disease tables.
//!
//! Calendar and location ids are dense surrogate keys `1..N`, assigned in
//! ascending date order and lexicographic country order. Both are derived
//! only from the set of values seen, so the same inputs always yield the
//! same ids (the reload-and-verify cycle relies on this).

use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalRecord;

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarRow {
    pub id: i64,
    /// `YYYYMMDD`
    pub date_value: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationRow {
    pub id: i64,
    pub country: String,
    pub continent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiseaseRow {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

// =============================================================================
// Disease
// =============================================================================

/// The fixed disease dimension. Never derived from input data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disease {
    #[serde(rename = "covid19", alias = "covid", alias = "covid-19")]
    Covid19,
    Monkeypox,
}

impl Disease {
    pub const ALL: [Disease; 2] = [Disease::Covid19, Disease::Monkeypox];

    pub fn id(self) -> i64 {
        match self {
            Self::Covid19 => 1,
            Self::Monkeypox => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Covid19 => "COVID-19",
            Self::Monkeypox => "Monkeypox",
        }
    }

    /// Monkeypox when the source name carries the marker, COVID-19 otherwise.
    pub fn sniff(name: &str) -> Self {
        if name.to_lowercase().contains("monkeypox") {
            Self::Monkeypox
        } else {
            Self::Covid19
        }
    }
}

pub fn build_disease() -> Vec<DiseaseRow> {
    Disease::ALL
        .iter()
        .map(|d| DiseaseRow {
            id: d.id(),
            kind: d.label().to_string(),
        })
        .collect()
}

// =============================================================================
// Calendar
// =============================================================================

/// Encode a date as the integer `YYYY*10000 + MM*100 + DD`.
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

/// One row per distinct date across all sources, ascending.
pub fn build_calendar<'a, I>(records: I) -> Vec<CalendarRow>
where
    I: IntoIterator<Item = &'a CanonicalRecord>,
{
    let dates: BTreeSet<NaiveDate> = records.into_iter().map(|r| r.date).collect();
    dates
        .into_iter()
        .zip(1..)
        .map(|(date, id)| CalendarRow {
            id,
            date_value: date_key(date),
        })
        .collect()
}

/// `date_value -> id` lookup over a finished calendar.
#[derive(Debug, Clone, Default)]
pub struct CalendarIndex(HashMap<i32, i64>);

impl CalendarIndex {
    pub fn new(rows: &[CalendarRow]) -> Self {
        Self(rows.iter().map(|r| (r.date_value, r.id)).collect())
    }

    pub fn id_of(&self, date: NaiveDate) -> Option<i64> {
        self.0.get(&date_key(date)).copied()
    }
}

// =============================================================================
// Location
// =============================================================================

pub const UNKNOWN_CONTINENT: &str = "Unknown";

/// Best-effort continent lookup. Not authoritative: names not listed here
/// (including aggregates such as "World") map to [`UNKNOWN_CONTINENT`].
const CONTINENTS: &[(&str, &str)] = &[
    ("Argentina", "South America"),
    ("Australia", "Oceania"),
    ("Austria", "Europe"),
    ("Bangladesh", "Asia"),
    ("Belgium", "Europe"),
    ("Brazil", "South America"),
    ("Canada", "North America"),
    ("Chile", "South America"),
    ("China", "Asia"),
    ("Colombia", "South America"),
    ("Egypt", "Africa"),
    ("France", "Europe"),
    ("Germany", "Europe"),
    ("India", "Asia"),
    ("Indonesia", "Asia"),
    ("Iran", "Asia"),
    ("Ireland", "Europe"),
    ("Israel", "Asia"),
    ("Italy", "Europe"),
    ("Japan", "Asia"),
    ("Kenya", "Africa"),
    ("Mexico", "North America"),
    ("Morocco", "Africa"),
    ("Netherlands", "Europe"),
    ("New Zealand", "Oceania"),
    ("Nigeria", "Africa"),
    ("Pakistan", "Asia"),
    ("Peru", "South America"),
    ("Philippines", "Asia"),
    ("Poland", "Europe"),
    ("Portugal", "Europe"),
    ("Russia", "Europe"),
    ("Saudi Arabia", "Asia"),
    ("South Africa", "Africa"),
    ("South Korea", "Asia"),
    ("Spain", "Europe"),
    ("Sweden", "Europe"),
    ("Switzerland", "Europe"),
    ("Turkey", "Asia"),
    ("UK", "Europe"),
    ("US", "North America"),
    ("United Kingdom", "Europe"),
    ("United States", "North America"),
    ("USA", "North America"),
];

pub fn continent_of(country: &str) -> &'static str {
    CONTINENTS
        .iter()
        .find(|(name, _)| *name == country)
        .map(|(_, continent)| *continent)
        .unwrap_or(UNKNOWN_CONTINENT)
}

/// One row per distinct non-empty region, in lexicographic order.
pub fn build_location<'a, I>(records: I) -> Vec<LocationRow>
where
    I: IntoIterator<Item = &'a CanonicalRecord>,
{
    let countries: BTreeSet<&str> = records
        .into_iter()
        .map(|r| r.region.as_str())
        .filter(|r| !r.is_empty())
        .collect();
    countries
        .into_iter()
        .zip(1..)
        .map(|(country, id)| LocationRow {
            id,
            country: country.to_string(),
            continent: continent_of(country).to_string(),
        })
        .collect()
}

/// `country -> id` lookup over a finished location table. Exact match only.
#[derive(Debug, Clone, Default)]
pub struct LocationIndex(HashMap<String, i64>);

impl LocationIndex {
    pub fn new(rows: &[LocationRow]) -> Self {
        Self(rows.iter().map(|r| (r.country.clone(), r.id)).collect())
    }

    pub fn id_of(&self, country: &str) -> Option<i64> {
        self.0.get(country).copied()
    }
}

// =============================================================================
// TESTS
// =============================================================================
