//! Fact assembler - resolves source rows to dimension keys.
//!
//! Each source is re-walked in its own layout so that the fields the
//! canonical shape drops (`new_cases`, `new_deaths`) can be read back. A row
//! whose date or region has no dimension key is dropped and counted, never
//! emitted with a missing key.

use serde::Serialize;

use crate::canonical::{self, CanonicalStats, RowHead};
use crate::dimensions::{CalendarIndex, LocationIndex};
use crate::error::RowError;
use crate::source::{RawTable, Source, SourceFormat};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactRow {
    pub id: i64,
    pub total_cases: i64,
    pub total_deaths: i64,
    pub new_cases: i64,
    pub new_deaths: i64,
    pub id_location: i64,
    pub id_disease: i64,
    pub id_calendar: i64,
}

/// Per-source assembly counters.
///
/// Every raw row lands in exactly one bucket:
/// `rows_seen == emitted + dropped() + merged`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyStats {
    /// Raw rows of the source.
    pub rows_seen: usize,
    pub emitted: usize,
    pub dropped_unknown_date: usize,
    pub dropped_unknown_location: usize,
    pub dropped_invalid: usize,
    /// Valid rows summed into another row's `(region, date)` fact.
    pub merged: usize,
}

impl AssemblyStats {
    pub fn dropped(&self) -> usize {
        self.dropped_unknown_date + self.dropped_unknown_location + self.dropped_invalid
    }
}

#[derive(Debug, Clone, Default)]
pub struct Assembled {
    pub facts: Vec<FactRow>,
    pub stats: AssemblyStats,
}

/// Emits fact rows for a whole run.
///
/// Holds the finished dimension key maps and the run-wide fact id counter:
/// ids start at 1 and advance by exactly one per emitted fact, in source
/// order and then row order.
pub struct FactAssembler<'a> {
    calendar: &'a CalendarIndex,
    location: &'a LocationIndex,
    next_id: i64,
}

impl<'a> FactAssembler<'a> {
    pub fn new(calendar: &'a CalendarIndex, location: &'a LocationIndex) -> Self {
        Self {
            calendar,
            location,
            next_id: 1,
        }
    }

    /// Number of facts emitted so far in this run.
    pub fn emitted(&self) -> i64 {
        self.next_id - 1
    }

    pub fn assemble(&mut self, source: &Source, raw: &RawTable) -> Assembled {
        let mut out = Assembled::default();
        let disease_id = source.disease.id();

        match source.format {
            None => {
                tracing::debug!(source = %source.name, "no fact layout for source");
            }
            Some(SourceFormat::CleanComplete) => {
                // One fact per country and day: the same aggregate the
                // canonicalizer builds. This layout has no daily split.
                let mut scratch = CanonicalStats::default();
                let records = canonical::aggregate_clean_complete(raw, &mut scratch);
                out.stats.rows_seen = raw.len();
                out.stats.dropped_invalid = scratch.skipped();
                out.stats.merged = raw
                    .len()
                    .saturating_sub(scratch.skipped() + records.len());
                for record in records {
                    let head = RowHead {
                        region: record.region,
                        date: record.date,
                        confirmed: record.confirmed,
                        deaths: record.deaths,
                    };
                    self.push(&mut out, head, 0, 0, disease_id);
                }
            }
            Some(format) => {
                let layout = format.layout();
                let mut scratch = CanonicalStats::default();
                for row in raw.rows() {
                    out.stats.rows_seen += 1;
                    let parsed = canonical::parse_head(&row, layout, &mut scratch)
                        .and_then(|head| {
                            let new_cases =
                                canonical::optional_count(&row, layout.new_cases, &mut scratch)?;
                            let new_deaths =
                                canonical::optional_count(&row, layout.new_deaths, &mut scratch)?;
                            Ok::<_, RowError>((head, new_cases, new_deaths))
                        });
                    match parsed {
                        Ok((head, new_cases, new_deaths)) => {
                            self.push(&mut out, head, new_cases, new_deaths, disease_id)
                        }
                        Err(e) => {
                            tracing::debug!(
                                source = %source.name,
                                line = row.line(),
                                error = %e,
                                "dropping row"
                            );
                            out.stats.dropped_invalid += 1;
                        }
                    }
                }
            }
        }

        if out.stats.dropped() > 0 {
            tracing::warn!(
                source = %source.name,
                unknown_date = out.stats.dropped_unknown_date,
                unknown_location = out.stats.dropped_unknown_location,
                invalid = out.stats.dropped_invalid,
                "rows dropped during fact assembly"
            );
        }
        tracing::info!(source = %source.name, facts = out.stats.emitted, "assembled facts");

        out
    }

    fn push(
        &mut self,
        out: &mut Assembled,
        head: RowHead,
        new_cases: i64,
        new_deaths: i64,
        disease_id: i64,
    ) {
        let Some(id_calendar) = self.calendar.id_of(head.date) else {
            out.stats.dropped_unknown_date += 1;
            return;
        };
        let Some(id_location) = self.location.id_of(&head.region) else {
            out.stats.dropped_unknown_location += 1;
            return;
        };

        out.facts.push(FactRow {
            id: self.next_id,
            total_cases: head.confirmed,
            total_deaths: head.deaths,
            new_cases,
            new_deaths,
            id_location,
            id_disease: disease_id,
            id_calendar,
        });
        out.stats.emitted += 1;
        self.next_id += 1;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;
    use crate::dimensions::{build_calendar, build_location, Disease};

    fn owid(rows: &[&[&str]]) -> RawTable {
        RawTable::from_strs(
            &["date", "location", "total_cases", "total_deaths", "new_cases", "new_deaths"],
            rows,
        )
    }

    fn worldometer(rows: &[&[&str]]) -> RawTable {
        RawTable::from_strs(
            &[
                "date",
                "country",
                "cumulative_total_cases",
                "daily_new_cases",
                "active_cases",
                "cumulative_total_deaths",
                "daily_new_deaths",
            ],
            rows,
        )
    }

    fn clean(rows: &[&[&str]]) -> RawTable {
        RawTable::from_strs(
            &["Country/Region", "Date", "Confirmed", "Deaths", "Recovered", "Active"],
            rows,
        )
    }

    /// Build dimensions from the given sources, then assemble every source.
    fn run(sources: &[(Source, RawTable)]) -> (Vec<FactRow>, Vec<AssemblyStats>) {
        let canonical: Vec<_> = sources
            .iter()
            .flat_map(|(s, raw)| canonicalize(s, raw).records)
            .collect();
        let calendar = CalendarIndex::new(&build_calendar(&canonical));
        let location = LocationIndex::new(&build_location(&canonical));
        let mut assembler = FactAssembler::new(&calendar, &location);
        let mut facts = Vec::new();
        let mut stats = Vec::new();
        for (source, raw) in sources {
            let out = assembler.assemble(source, raw);
            facts.extend(out.facts);
            stats.push(out.stats);
        }
        (facts, stats)
    }

    #[test]
    fn test_owid_reads_daily_fields_from_raw_row() {
        let sources = vec![(
            Source::sniffed("owid-monkeypox-data.csv"),
            owid(&[&["2022-05-01", "US", "30", "1", "3", "1"]]),
        )];
        let (facts, _) = run(&sources);
        assert_eq!(
            facts,
            vec![FactRow {
                id: 1,
                total_cases: 30,
                total_deaths: 1,
                new_cases: 3,
                new_deaths: 1,
                id_location: 1,
                id_disease: 2,
                id_calendar: 1,
            }]
        );
    }

    #[test]
    fn test_worldometer_reads_daily_fields_from_raw_row() {
        let sources = vec![(
            Source::sniffed("worldometer_coronavirus_daily_data.csv"),
            worldometer(&[&["2020-2-15", "China", "68500", "2641", "57000", "1665", "143"]]),
        )];
        let (facts, _) = run(&sources);
        assert_eq!(facts[0].total_cases, 68500);
        assert_eq!(facts[0].total_deaths, 1665);
        assert_eq!(facts[0].new_cases, 2641);
        assert_eq!(facts[0].new_deaths, 143);
        assert_eq!(facts[0].id_disease, 1);
    }

    #[test]
    fn test_clean_complete_has_no_daily_split() {
        let sources = vec![(
            Source::sniffed("covid_19_clean_complete.csv"),
            clean(&[
                &["China", "2020-01-22", "444", "17", "28", "399"],
                &["China", "2020-01-22", "14", "0", "0", "14"],
            ]),
        )];
        let (facts, stats) = run(&sources);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].total_cases, 458);
        assert_eq!((facts[0].new_cases, facts[0].new_deaths), (0, 0));
        assert_eq!(stats[0].rows_seen, 2);
        assert_eq!(stats[0].merged, 1);
    }

    #[test]
    fn test_clean_complete_tallies_cover_every_raw_row() {
        let sources = vec![(
            Source::sniffed("covid_19_clean_complete.csv"),
            clean(&[
                &["China", "2020-01-22", "444", "17", "28", "399"],
                &["China", "2020-01-22", "14", "0", "0", "14"],
                &["China", "2020-01-23", "many", "0", "0", "0"],
                &["US", "2020-01-22", "1", "0", "0", "1"],
            ]),
        )];
        let (facts, stats) = run(&sources);
        let s = &stats[0];
        assert_eq!(facts.len(), 2);
        assert_eq!(s.rows_seen, 4);
        assert_eq!((s.emitted, s.dropped_invalid, s.merged), (2, 1, 1));
        assert_eq!(s.emitted + s.dropped() + s.merged, s.rows_seen);
    }

    #[test]
    fn test_unknown_location_is_dropped_and_counted() {
        let calendar_source = owid(&[&["2022-05-01", "US", "1", "0", "1", "0"]]);
        let canonical =
            canonicalize(&Source::sniffed("owid-monkeypox-data.csv"), &calendar_source).records;
        let calendar = CalendarIndex::new(&build_calendar(&canonical));
        let location = LocationIndex::new(&build_location(&canonical));
        let mut assembler = FactAssembler::new(&calendar, &location);

        // "Narnia" never went through the canonicalizer
        let raw = owid(&[
            &["2022-05-01", "Narnia", "5", "0", "5", "0"],
            &["2022-05-01", "US", "1", "0", "1", "0"],
        ]);
        let out = assembler.assemble(&Source::sniffed("owid-monkeypox-data.csv"), &raw);
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.stats.dropped_unknown_location, 1);
        assert_eq!(out.stats.rows_seen, 2);
    }

    #[test]
    fn test_unknown_date_is_dropped_and_counted() {
        let canonical = canonicalize(
            &Source::sniffed("owid-monkeypox-data.csv"),
            &owid(&[&["2022-05-01", "US", "1", "0", "1", "0"]]),
        )
        .records;
        let calendar = CalendarIndex::new(&build_calendar(&canonical));
        let location = LocationIndex::new(&build_location(&canonical));
        let mut assembler = FactAssembler::new(&calendar, &location);

        let raw = owid(&[&["2022-06-01", "US", "1", "0", "1", "0"]]);
        let out = assembler.assemble(&Source::sniffed("owid-monkeypox-data.csv"), &raw);
        assert!(out.facts.is_empty());
        assert_eq!(out.stats.dropped_unknown_date, 1);
    }

    #[test]
    fn test_invalid_rows_are_dropped() {
        let sources = vec![(
            Source::sniffed("owid-monkeypox-data.csv"),
            owid(&[
                &["2022-05-01", "US", "3", "0", "3", "0"],
                &["garbage", "US", "3", "0", "3", "0"],
                &["2022-05-02", "US", "4", "0", "x", "0"],
            ]),
        )];
        let (facts, stats) = run(&sources);
        assert_eq!(facts.len(), 1);
        assert_eq!(stats[0].dropped_invalid, 2);
    }

    #[test]
    fn test_fact_ids_are_contiguous_across_sources() {
        let sources = vec![
            (
                Source::sniffed("covid_19_clean_complete.csv"),
                clean(&[
                    &["US", "2020-01-22", "1", "0", "0", "1"],
                    &["China", "2020-01-22", "548", "17", "28", "503"],
                ]),
            ),
            (
                Source::sniffed("owid-monkeypox-data.csv"),
                owid(&[
                    &["2022-05-01", "US", "3", "0", "3", "0"],
                    &["2022-05-02", "US", "4", "0", "1", "0"],
                    &["2022-05-03", "US", "5", "0", "1", "0"],
                ]),
            ),
            (
                Source::sniffed("worldometer_coronavirus_daily_data.csv"),
                worldometer(&[
                    &["2020-01-23", "China", "643", "95", "600", "18", "1"],
                    &["2020-01-24", "China", "920", "277", "870", "26", "8"],
                ]),
            ),
            (
                Source::tagged(
                    "extra.csv",
                    Some(SourceFormat::OwidMonkeypox),
                    Some(Disease::Monkeypox),
                ),
                owid(&[&["2022-05-04", "US", "6", "0", "1", "0"]]),
            ),
        ];
        let (facts, _) = run(&sources);
        let ids: Vec<i64> = facts.iter().map(|f| f.id).collect();
        assert_eq!(ids, (1..=8).collect::<Vec<i64>>());
    }

    #[test]
    fn test_unknown_format_emits_nothing() {
        let calendar = CalendarIndex::default();
        let location = LocationIndex::default();
        let mut assembler = FactAssembler::new(&calendar, &location);
        let raw = RawTable::from_strs(&["a"], &[&["1"]]);
        let out = assembler.assemble(&Source::sniffed("mystery.csv"), &raw);
        assert!(out.facts.is_empty());
        assert_eq!(assembler.emitted(), 0);
    }
}
