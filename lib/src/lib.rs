pub mod burden;
pub mod codes;
pub mod config;
mod error;
pub mod matcher;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod report;
mod util;

pub use anyhow::{Context, Error};
use chrono::NaiveDate;
use itertools::Either;
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs, io, iter,
    ops::Deref,
    path::Path,
    str::FromStr,
    sync::Arc,
};

pub use crate::{
    burden::{aggregate, BurdenSummary, Horizon, Horizons},
    codes::{Code, CodingSystem, ReadCode},
    config::StudyConfig,
    error::{ConfigError, DataQualityWarning, InvariantError},
    matcher::{match_conditions, ConditionEpisode},
    normalize::{DataQualityCounters, NormalizeOptions, Normalized, Normalizer, RawRecord},
    pipeline::{CohortResult, Diagnostics, PatientFailure, Pipeline},
    reconcile::{reconcile, reconcile_all, CanonicalEpisode},
    registry::{CodeListEntry, ConditionRules, Registry},
    report::CohortReport,
    util::header,
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
pub type PatientId = ArcStr;

/// Whether an event records a diagnosis or a procedure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Diagnosis,
    Procedure,
}

impl EventType {
    /// What to assume when the source doesn't say.
    ///
    /// OPCS-4 only codes procedures. Everything else in our extracts is overwhelmingly diagnostic.
    pub fn default_for(system: CodingSystem) -> Self {
        match system {
            CodingSystem::Opcs4 => EventType::Procedure,
            _ => EventType::Diagnosis,
        }
    }
}

impl FromStr for EventType {
    type Err = DataQualityWarning;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "diagnosis" | "dx" | "d" => Ok(EventType::Diagnosis),
            "procedure" | "px" | "p" | "operation" => Ok(EventType::Procedure),
            _ => Err(DataQualityWarning::UnknownEventType),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::Diagnosis => f.write_str("diagnosis"),
            EventType::Procedure => f.write_str("procedure"),
        }
    }
}

/// A coded event from a patient's record, after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalEvent {
    pub patient_id: PatientId,
    pub code: Code,
    pub date: NaiveDate,
    pub event_type: EventType,
}

impl ClinicalEvent {
    pub fn new(
        patient_id: impl Into<PatientId>,
        code: Code,
        date: NaiveDate,
        event_type: EventType,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            code,
            date,
            event_type,
        }
    }
}

/// The parsed list of events, with a pre-built index for the `patient_id` field.
#[derive(Clone)]
pub struct Events {
    els: Arc<Vec<ClinicalEvent>>,
    id_idx: BTreeMap<PatientId, Vec<usize>>,
}

impl Events {
    pub fn events_for_patient<'a>(
        &'a self,
        patient_id: &str,
    ) -> impl Iterator<Item = &'a ClinicalEvent> + Clone + 'a {
        let evt_idxs = match self.id_idx.get(patient_id) {
            Some(idxs) => idxs,
            None => return Either::Left(iter::empty()),
        };
        Either::Right(evt_idxs.iter().filter_map(move |idx| self.els.get(*idx)))
    }

    /// Iterate over events in this store.
    pub fn iter(&self) -> impl Iterator<Item = &ClinicalEvent> + '_ {
        self.els.iter()
    }

    /// Number of distinct patients with at least one event.
    pub fn patient_count(&self) -> usize {
        self.id_idx.len()
    }

    fn new(els: Vec<ClinicalEvent>) -> Self {
        let mut this = Events {
            els: Arc::new(els),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_id_map();
        this
    }

    fn rebuild_id_map(&mut self) {
        self.id_idx.clear();
        for (idx, event) in self.els.iter().enumerate() {
            self.id_idx
                .entry(event.patient_id.clone())
                .or_insert_with(Vec::new)
                .push(idx);
        }
    }
}

impl Deref for Events {
    type Target = [ClinicalEvent];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl<'a> IntoIterator for &'a Events {
    type IntoIter = <&'a [ClinicalEvent] as IntoIterator>::IntoIter;
    type Item = &'a ClinicalEvent;
    fn into_iter(self) -> Self::IntoIter {
        self.els.iter()
    }
}

impl FromIterator<ClinicalEvent> for Events {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = ClinicalEvent>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// A row in the cohort dataset.
///
/// Eligibility has already been decided upstream. Index and censor dates are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortMember {
    #[serde(alias = "PatID", alias = "patid")]
    pub patient_id: PatientId,
    /// Date of lymphoma diagnosis.
    #[serde(alias = "IndexDate")]
    pub index_date: NaiveDate,
    /// Last date the patient was under observation.
    #[serde(alias = "CensorDate")]
    pub censor_date: NaiveDate,
}

impl CohortMember {
    pub fn new(
        patient_id: impl Into<PatientId>,
        index_date: NaiveDate,
        censor_date: NaiveDate,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            index_date,
            censor_date,
        }
    }
}

/// The study cohort, with a pre-built index for the `patient_id` field.
pub struct Cohort {
    els: Arc<Vec<CohortMember>>,
    id_idx: BTreeMap<PatientId, usize>,
}

impl Cohort {
    /// Load the cohort from a csv file with `patient_id`, `index_date` and `censor_date` columns.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self::new(load_csv(path)?))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_idx.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CohortMember> + '_ {
        self.els.iter()
    }

    /// Build one timeline per cohort member from the normalized events.
    ///
    /// Members without events get an empty timeline. They still count towards denominators.
    pub fn timelines(&self, events: &Events) -> Vec<Result<PatientTimeline, InvariantError>> {
        self.iter()
            .map(|member| {
                PatientTimeline::new(
                    member.patient_id.clone(),
                    member.index_date,
                    member.censor_date,
                    events.events_for_patient(&member.patient_id).cloned().collect(),
                )
            })
            .collect()
    }

    /// A patient listed more than once keeps the position of their first row and the dates of
    /// their last.
    fn new(rows: Vec<CohortMember>) -> Self {
        let mut els: Vec<CohortMember> = Vec::with_capacity(rows.len());
        let mut id_idx = BTreeMap::new();
        for row in rows {
            match id_idx.get(&row.patient_id) {
                Some(&idx) => {
                    event!(
                        Level::WARN,
                        "patient {} appears more than once in the cohort, keeping the last row",
                        row.patient_id
                    );
                    els[idx] = row;
                }
                None => {
                    id_idx.insert(row.patient_id.clone(), els.len());
                    els.push(row);
                }
            }
        }
        Cohort {
            els: els.into(),
            id_idx,
        }
    }
}

impl Deref for Cohort {
    type Target = [CohortMember];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<CohortMember> for Cohort {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = CohortMember>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// One patient's follow-up: index and censor dates, and their events in date order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientTimeline {
    patient_id: PatientId,
    index_date: NaiveDate,
    censor_date: NaiveDate,
    events: Vec<ClinicalEvent>,
}

impl PatientTimeline {
    pub fn new(
        patient_id: impl Into<PatientId>,
        index_date: NaiveDate,
        censor_date: NaiveDate,
        mut events: Vec<ClinicalEvent>,
    ) -> Result<Self, InvariantError> {
        let patient_id = patient_id.into();
        if censor_date < index_date {
            return Err(InvariantError::CensoredBeforeIndex {
                patient_id,
                index: index_date,
                censor: censor_date,
            });
        }
        if let Some(other) = events.iter().find(|evt| evt.patient_id != patient_id) {
            return Err(InvariantError::PatientMismatch {
                expected: patient_id,
                found: other.patient_id.clone(),
            });
        }
        // stable, so same-day events keep their extract order
        events.sort_by_key(|evt| evt.date);
        Ok(Self {
            patient_id,
            index_date,
            censor_date,
            events,
        })
    }

    pub fn patient_id(&self) -> &PatientId {
        &self.patient_id
    }

    pub fn index_date(&self) -> NaiveDate {
        self.index_date
    }

    pub fn censor_date(&self) -> NaiveDate {
        self.censor_date
    }

    pub fn events(&self) -> &[ClinicalEvent] {
        &self.events
    }
}

/// Load data saved by `save`.
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        bincode::deserialize_from(reader).map_err(Into::into)
    }
    let path = path.as_ref();
    check_extension(path, "bin")?;

    inner(path).with_context(|| format!("unable to load data from \"{}\"", path.display()))
}

/// Save data to disk.
pub fn save<T: Serialize>(contents: &[T], path: impl AsRef<Path>, overwrite: bool) -> Result {
    fn inner<T: Serialize>(contents: &[T], path: &Path, overwrite: bool) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if util::path_exists(path)? {
            ensure!(overwrite, "file already exists");
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        bincode::serialize_into(&mut out, contents)?;
        Ok(())
    }
    let path = path.as_ref();
    check_extension(path, "bin")?;

    inner(contents, path, overwrite)
        .with_context(|| format!("unable to save data to \"{}\"", path.display()))
}

/// Load rows from a csv file with headers.
pub fn load_csv<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, anyhow::Error> {
    let path = path.as_ref();
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("while opening \"{}\"", path.display()))?
        .into_deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("while loading \"{}\"", path.display()))
}

pub fn check_extension(path: &Path, ext: &str) -> Result<()> {
    ensure!(
        matches!(path.extension(), Some(p) if p == ext),
        "filename should end with `.{}`",
        ext
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::{ClinicalEvent, Code, CodingSystem, EventType};
    use chrono::NaiveDate;

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn icd(code: &str) -> Code {
        Code::parse(CodingSystem::Icd10, code).unwrap()
    }

    pub fn read(code: &str) -> Code {
        Code::parse(CodingSystem::Read2, code).unwrap()
    }

    pub fn event(patient_id: &str, code: Code, on: NaiveDate) -> ClinicalEvent {
        ClinicalEvent::new(patient_id, code, on, EventType::Diagnosis)
    }
}

#[cfg(test)]
mod test {
    use super::{
        test_util::{date, event, icd},
        Cohort, CohortMember, EventType, Events, InvariantError, PatientTimeline,
    };

    #[test]
    fn timeline_sorts_events() {
        let timeline = PatientTimeline::new(
            "p1",
            date(2015, 1, 1),
            date(2020, 1, 1),
            vec![
                event("p1", icd("I10"), date(2018, 1, 1)),
                event("p1", icd("E11"), date(2016, 1, 1)),
            ],
        )
        .unwrap();
        let dates: Vec<_> = timeline.events().iter().map(|evt| evt.date).collect();
        assert_eq!(dates, [date(2016, 1, 1), date(2018, 1, 1)]);
    }

    #[test]
    fn timeline_rejects_bad_input() {
        let err = PatientTimeline::new("p1", date(2015, 1, 1), date(2014, 1, 1), vec![]);
        assert!(matches!(err, Err(InvariantError::CensoredBeforeIndex { .. })));

        let err = PatientTimeline::new(
            "p1",
            date(2015, 1, 1),
            date(2016, 1, 1),
            vec![event("p2", icd("I10"), date(2015, 6, 1))],
        );
        assert!(matches!(err, Err(InvariantError::PatientMismatch { .. })));
    }

    #[test]
    fn cohort_timelines_group_events() {
        let cohort: Cohort = [
            CohortMember::new("a", date(2010, 1, 1), date(2020, 1, 1)),
            CohortMember::new("b", date(2011, 1, 1), date(2012, 1, 1)),
        ]
        .into_iter()
        .collect();
        let events: Events = [
            event("a", icd("I10"), date(2012, 1, 1)),
            event("c", icd("I10"), date(2012, 1, 1)),
            event("a", icd("E11"), date(2011, 1, 1)),
        ]
        .into_iter()
        .collect();

        let timelines: Vec<_> = cohort
            .timelines(&events)
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(timelines.len(), 2);
        assert_eq!(timelines[0].events().len(), 2);
        assert!(timelines[1].events().is_empty());
        assert!(cohort.contains("b"));
        assert!(!cohort.contains("c"));
    }

    #[test]
    fn duplicate_cohort_rows_keep_the_last() {
        let cohort: Cohort = [
            CohortMember::new("p1", date(2010, 1, 1), date(2020, 1, 1)),
            CohortMember::new("p2", date(2011, 1, 1), date(2020, 1, 1)),
            CohortMember::new("p1", date(2015, 1, 1), date(2020, 1, 1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(cohort.len(), 2);
        assert_eq!(&*cohort[0].patient_id, "p1");
        assert_eq!(cohort[0].index_date, date(2015, 1, 1));

        let events: Events = [event("p1", icd("E11"), date(2015, 6, 1))]
            .into_iter()
            .collect();
        let timelines: Vec<_> = cohort
            .timelines(&events)
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(timelines.len(), 2);
        assert_eq!(timelines[0].index_date(), date(2015, 1, 1));
        assert_eq!(timelines[0].events().len(), 1);
    }

    #[test]
    fn event_type_parsing() {
        assert_eq!("Dx".parse::<EventType>().unwrap(), EventType::Diagnosis);
        assert_eq!("PROCEDURE".parse::<EventType>().unwrap(), EventType::Procedure);
        assert!("lab".parse::<EventType>().is_err());
    }
}
