//! The star schema: three dimension tables plus the `data` fact table.

use std::collections::HashSet;

use serde::Serialize;

use crate::dimensions::{CalendarRow, DiseaseRow, LocationRow};
use crate::facts::FactRow;

pub const CALENDAR: &str = "calendar";
pub const LOCATION: &str = "location";
pub const DISEASE: &str = "disease";
pub const DATA: &str = "data";

/// Tables in dependency order: dimensions first, the fact table last.
/// Truncation walks this list backwards.
pub const TABLES: [&str; 4] = [CALENDAR, LOCATION, DISEASE, DATA];

/// A cell bound into an insert statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
}

/// A row that knows its table, its column list and its cell values.
/// `Serialize` must emit fields in `COLUMNS` order (it drives the CSV header).
pub trait TableRow: Serialize {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn values(&self) -> Vec<Value>;
}

impl TableRow for CalendarRow {
    const TABLE: &'static str = CALENDAR;
    const COLUMNS: &'static [&'static str] = &["id", "date_value"];

    fn values(&self) -> Vec<Value> {
        vec![Value::Int(self.id), Value::Int(i64::from(self.date_value))]
    }
}

impl TableRow for LocationRow {
    const TABLE: &'static str = LOCATION;
    const COLUMNS: &'static [&'static str] = &["id", "country", "continent"];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Int(self.id),
            Value::Text(self.country.clone()),
            Value::Text(self.continent.clone()),
        ]
    }
}

impl TableRow for DiseaseRow {
    const TABLE: &'static str = DISEASE;
    const COLUMNS: &'static [&'static str] = &["id", "type"];

    fn values(&self) -> Vec<Value> {
        vec![Value::Int(self.id), Value::Text(self.kind.clone())]
    }
}

impl TableRow for FactRow {
    const TABLE: &'static str = DATA;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "total_cases",
        "total_deaths",
        "new_cases",
        "new_deaths",
        "id_location",
        "id_disease",
        "id_calendar",
    ];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Int(self.id),
            Value::Int(self.total_cases),
            Value::Int(self.total_deaths),
            Value::Int(self.new_cases),
            Value::Int(self.new_deaths),
            Value::Int(self.id_location),
            Value::Int(self.id_disease),
            Value::Int(self.id_calendar),
        ]
    }
}

/// The four assembled tables of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StarSchema {
    pub calendar: Vec<CalendarRow>,
    pub location: Vec<LocationRow>,
    pub disease: Vec<DiseaseRow>,
    pub data: Vec<FactRow>,
}

impl StarSchema {
    /// In-memory row count of `table`, or `None` for a foreign name.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        match table {
            CALENDAR => Some(self.calendar.len()),
            LOCATION => Some(self.location.len()),
            DISEASE => Some(self.disease.len()),
            DATA => Some(self.data.len()),
            _ => None,
        }
    }

    /// Facts pointing at a dimension row that does not exist.
    pub fn dangling_facts(&self) -> usize {
        let calendar: HashSet<i64> = self.calendar.iter().map(|r| r.id).collect();
        let location: HashSet<i64> = self.location.iter().map(|r| r.id).collect();
        let disease: HashSet<i64> = self.disease.iter().map(|r| r.id).collect();
        self.data
            .iter()
            .filter(|f| {
                !(calendar.contains(&f.id_calendar)
                    && location.contains(&f.id_location)
                    && disease.contains(&f.id_disease))
            })
            .count()
    }
}
