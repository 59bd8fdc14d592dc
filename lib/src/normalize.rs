//! Turning source rows into [`ClinicalEvent`]s.
//!
//! Extracts from different sources name their columns differently and write dates and codes in
//! their own way. Bad rows are counted by reason and dropped, so a handful of junk rows never
//! stops a run.
use crate::{
    util, ArcStr, ClinicalEvent, Code, CodingSystem, Cohort, DataQualityWarning, EventType,
    Events,
};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

/// A row as found in an extract. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawRecord {
    #[serde(
        default,
        alias = "PatID",
        alias = "patid",
        deserialize_with = "util::optional_string"
    )]
    pub patient_id: Option<ArcStr>,
    #[serde(
        default,
        alias = "EntryDate",
        alias = "eventdate",
        alias = "date",
        deserialize_with = "util::optional_string"
    )]
    pub event_date: Option<ArcStr>,
    #[serde(
        default,
        alias = "CodingSystem",
        alias = "system",
        deserialize_with = "util::optional_string"
    )]
    pub coding_system: Option<ArcStr>,
    #[serde(
        default,
        alias = "Code",
        alias = "ReadCode",
        alias = "readcode",
        deserialize_with = "util::optional_string"
    )]
    pub code: Option<ArcStr>,
    #[serde(
        default,
        alias = "EventType",
        alias = "type",
        deserialize_with = "util::optional_string"
    )]
    pub event_type: Option<ArcStr>,
}

impl RawRecord {
    pub fn new(patient_id: &str, event_date: &str, coding_system: &str, code: &str) -> Self {
        let field = |s: &str| Some(ArcStr::from(s));
        Self {
            patient_id: field(patient_id),
            event_date: field(event_date),
            coding_system: field(coding_system),
            code: field(code),
            event_type: None,
        }
    }

    pub fn with_event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// `chrono` format strings, tried in order.
    pub date_formats: Vec<String>,
    /// Dates the source writes when it doesn't know the real one.
    pub placeholder_dates: BTreeSet<NaiveDate>,
    /// Used for rows without a coding system, e.g. single system extracts.
    pub default_coding_system: Option<CodingSystem>,
}

impl NormalizeOptions {
    pub fn default_date_formats() -> Vec<String> {
        ["%Y-%m-%d", "%d/%m/%Y", "%Y%m%d", "%d/%m/%Y %H:%M:%S"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn default_placeholder_dates() -> BTreeSet<NaiveDate> {
        NaiveDate::from_ymd_opt(1900, 1, 1).into_iter().collect()
    }
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            date_formats: Self::default_date_formats(),
            placeholder_dates: Self::default_placeholder_dates(),
            default_coding_system: None,
        }
    }
}

/// What happened to a single raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Event(ClinicalEvent),
    Skipped(DataQualityWarning),
    /// The record is fine but the patient isn't in the study.
    OutOfCohort,
}

/// Tallies of what normalization did with the records it was given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQualityCounters {
    pub records_read: usize,
    pub events_accepted: usize,
    pub out_of_cohort: usize,
    pub skipped: BTreeMap<DataQualityWarning, usize>,
}

impl DataQualityCounters {
    pub fn record(&mut self, outcome: &Normalized) {
        self.records_read += 1;
        match outcome {
            Normalized::Event(_) => self.events_accepted += 1,
            Normalized::OutOfCohort => self.out_of_cohort += 1,
            Normalized::Skipped(warning) => self.skip(*warning),
        }
    }

    fn skip(&mut self, warning: DataQualityWarning) {
        *self.skipped.entry(warning).or_insert(0) += 1;
    }

    pub fn skipped(&self, warning: DataQualityWarning) -> usize {
        self.skipped.get(&warning).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn term_table(&self) -> term_data_table::Table<'_> {
        use term_data_table::{Cell, Row, Table};
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Records"))
                .with_cell(Cell::from("Count")),
        );
        let mut row = |label: String, count: usize| {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(label))
                    .with_cell(Cell::from(count.to_string())),
            );
        };
        row("read".into(), self.records_read);
        row("accepted".into(), self.events_accepted);
        row("not in cohort".into(), self.out_of_cohort);
        for warning in DataQualityWarning::ALL {
            row(format!("skipped: {}", warning), self.skipped(warning));
        }
        table
    }
}

pub struct Normalizer<'a> {
    cohort: &'a Cohort,
    options: NormalizeOptions,
}

impl<'a> Normalizer<'a> {
    pub fn new(cohort: &'a Cohort, options: NormalizeOptions) -> Self {
        Self { cohort, options }
    }

    pub fn normalize(&self, record: &RawRecord) -> Normalized {
        match self.try_normalize(record) {
            Ok(Some(event)) => Normalized::Event(event),
            Ok(None) => Normalized::OutOfCohort,
            Err(warning) => Normalized::Skipped(warning),
        }
    }

    // Ok(None) means the patient isn't ours. That is checked after the patient id itself so
    // that rows with no id are still reported.
    fn try_normalize(
        &self,
        record: &RawRecord,
    ) -> std::result::Result<Option<ClinicalEvent>, DataQualityWarning> {
        let patient_id = record
            .patient_id
            .as_ref()
            .ok_or(DataQualityWarning::MissingPatientId)?;
        if !self.cohort.contains(patient_id) {
            return Ok(None);
        }

        let date = record
            .event_date
            .as_deref()
            .and_then(|raw| util::parse_date(raw, &self.options.date_formats))
            .ok_or(DataQualityWarning::UnparseableDate)?;
        if self.options.placeholder_dates.contains(&date) {
            return Err(DataQualityWarning::PlaceholderDate);
        }

        let system = match record.coding_system.as_deref() {
            Some(raw) => raw
                .parse::<CodingSystem>()
                .map_err(|_| DataQualityWarning::UnknownCodingSystem)?,
            None => self
                .options
                .default_coding_system
                .ok_or(DataQualityWarning::UnknownCodingSystem)?,
        };
        let code = record
            .code
            .as_deref()
            .ok_or(DataQualityWarning::MalformedCode)
            .and_then(|raw| {
                Code::parse(system, raw).map_err(|_| DataQualityWarning::MalformedCode)
            })?;

        let event_type = match record.event_type.as_deref() {
            Some(raw) => raw.parse::<EventType>()?,
            None => EventType::default_for(system),
        };

        Ok(Some(ClinicalEvent::new(
            patient_id.clone(),
            code,
            date,
            event_type,
        )))
    }

    /// Normalize a batch of records, keeping the accepted events and counting the rest.
    pub fn normalize_all<'r>(
        &self,
        records: impl IntoIterator<Item = &'r RawRecord>,
    ) -> (Events, DataQualityCounters) {
        let mut counters = DataQualityCounters::default();
        let events = records
            .into_iter()
            .filter_map(|record| self.accept(record, &mut counters))
            .collect();
        (events, counters)
    }

    /// Normalize the rows of a csv extract.
    ///
    /// Rows the csv reader can't make sense of are counted as unreadable. Failing to open the
    /// file is an error.
    pub fn normalize_csv(&self, path: impl AsRef<Path>) -> Result<(Events, DataQualityCounters)> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("while opening \"{}\"", path.display()))?;

        let mut counters = DataQualityCounters::default();
        let mut events = vec![];
        for row in reader.deserialize::<RawRecord>() {
            match row {
                Ok(record) => events.extend(self.accept(&record, &mut counters)),
                Err(error) => {
                    event!(Level::DEBUG, "unreadable record: {}", error);
                    counters.records_read += 1;
                    counters.skip(DataQualityWarning::UnreadableRecord);
                }
            }
        }
        event!(
            Level::INFO,
            "read {} records from \"{}\", accepted {}",
            counters.records_read,
            path.display(),
            counters.events_accepted
        );
        Ok((events.into_iter().collect(), counters))
    }

    fn accept(
        &self,
        record: &RawRecord,
        counters: &mut DataQualityCounters,
    ) -> Option<ClinicalEvent> {
        let outcome = self.normalize(record);
        counters.record(&outcome);
        match outcome {
            Normalized::Event(event) => Some(event),
            Normalized::Skipped(warning) => {
                event!(Level::DEBUG, "skipping record {:?}: {}", record, warning);
                None
            }
            Normalized::OutOfCohort => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{NormalizeOptions, Normalized, Normalizer, RawRecord};
    use crate::{
        test_util::{date, icd},
        Cohort, CohortMember, CodingSystem, DataQualityWarning, EventType,
    };

    fn cohort() -> Cohort {
        [CohortMember::new("p1", date(2015, 1, 1), date(2020, 1, 1))]
            .into_iter()
            .collect()
    }

    #[test]
    fn maps_source_field_names() {
        let text = "\
PatID,EntryDate,CodingSystem,ReadCode
p1,17/11/2016,ICD-10,e11.9
";
        let record: RawRecord = csv::Reader::from_reader(text.as_bytes())
            .deserialize()
            .next()
            .unwrap()
            .unwrap();
        let cohort = cohort();
        let normalizer = Normalizer::new(&cohort, NormalizeOptions::default());
        match normalizer.normalize(&record) {
            Normalized::Event(event) => {
                assert_eq!(&*event.patient_id, "p1");
                assert_eq!(event.code, icd("E119"));
                assert_eq!(event.date, date(2016, 11, 17));
                assert_eq!(event.event_type, EventType::Diagnosis);
            }
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn bad_records_are_counted() {
        let cohort = cohort();
        let normalizer = Normalizer::new(&cohort, NormalizeOptions::default());
        let records = vec![
            RawRecord::new("p1", "2016-01-01", "icd10", "E11"),
            RawRecord::new("p1", "2016-13-01", "icd10", "E11"),
            RawRecord::new("p1", "1900-01-01", "icd10", "E11"),
            RawRecord::new("p1", "2016-01-01", "loinc", "1234-5"),
            RawRecord::new("p1", "2016-01-01", "icd10", "???"),
            RawRecord::new("p1", "2016-01-01", "icd10", "E11").with_event_type("lab"),
            RawRecord::new("p2", "2016-01-01", "icd10", "E11"),
            RawRecord {
                patient_id: None,
                ..RawRecord::new("", "2016-01-01", "icd10", "E11")
            },
        ];
        let (events, counters) = normalizer.normalize_all(&records);
        assert_eq!(events.len(), 1);
        assert_eq!(counters.records_read, 8);
        assert_eq!(counters.events_accepted, 1);
        assert_eq!(counters.out_of_cohort, 1);
        assert_eq!(counters.total_skipped(), 6);
        for warning in [
            DataQualityWarning::UnparseableDate,
            DataQualityWarning::PlaceholderDate,
            DataQualityWarning::UnknownCodingSystem,
            DataQualityWarning::MalformedCode,
            DataQualityWarning::UnknownEventType,
            DataQualityWarning::MissingPatientId,
        ] {
            assert_eq!(counters.skipped(warning), 1, "{:?}", warning);
        }
    }

    #[test]
    fn defaults_from_coding_system() {
        let cohort = cohort();
        let options = NormalizeOptions {
            default_coding_system: Some(CodingSystem::Opcs4),
            ..NormalizeOptions::default()
        };
        let normalizer = Normalizer::new(&cohort, options);
        let record = RawRecord {
            coding_system: None,
            ..RawRecord::new("p1", "20160101", "", "W37.1")
        };
        match normalizer.normalize(&record) {
            Normalized::Event(event) => {
                assert_eq!(event.code.system(), CodingSystem::Opcs4);
                assert_eq!(event.event_type, EventType::Procedure);
            }
            other => panic!("expected an event, got {:?}", other),
        }

        let strict = Normalizer::new(&cohort, NormalizeOptions::default());
        assert_eq!(
            strict.normalize(&record),
            Normalized::Skipped(DataQualityWarning::UnknownCodingSystem)
        );
    }
}
