//! Running the whole cohort: match, reconcile and aggregate each patient, in parallel.
use crate::{
    aggregate, match_conditions, reconcile_all, BurdenSummary, Cohort, DataQualityCounters,
    Events, Horizons, InvariantError, PatientId, PatientTimeline, Registry,
};
use qu::ick_use::*;
use rayon::prelude::*;
use serde::Serialize;

/// Everything needed to process one patient. Cheap to share between threads.
#[derive(Debug, Copy, Clone)]
pub struct Pipeline<'a> {
    registry: &'a Registry,
    horizons: &'a Horizons,
}

/// A patient that couldn't be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientFailure {
    pub patient_id: PatientId,
    pub error: InvariantError,
}

/// Run-level counts, to judge whether the results can be trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub data_quality: DataQualityCounters,
    pub patients_processed: usize,
    pub patients_with_zero_conditions: usize,
    pub patients_failed: usize,
}

impl Diagnostics {
    pub fn term_table(&self) -> term_data_table::Table<'_> {
        use term_data_table::{Cell, Row, Table};
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Patients"))
                .with_cell(Cell::from("Count")),
        );
        for (label, count) in [
            ("processed", self.patients_processed),
            ("with no conditions", self.patients_with_zero_conditions),
            ("failed", self.patients_failed),
        ] {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(label))
                    .with_cell(Cell::from(count.to_string())),
            );
        }
        table
    }
}

pub struct CohortResult {
    /// One per successfully processed patient, ordered by patient id.
    pub summaries: Vec<BurdenSummary>,
    pub failures: Vec<PatientFailure>,
    pub diagnostics: Diagnostics,
}

impl<'a> Pipeline<'a> {
    pub fn new(registry: &'a Registry, horizons: &'a Horizons) -> Self {
        Self { registry, horizons }
    }

    pub fn horizons(&self) -> &'a Horizons {
        self.horizons
    }

    pub fn run_patient(&self, timeline: &PatientTimeline) -> Result<BurdenSummary, InvariantError> {
        self.process(timeline).map(|(summary, _)| summary)
    }

    // Also returns the number of conditions found, whether or not they fall in follow-up.
    fn process(
        &self,
        timeline: &PatientTimeline,
    ) -> Result<(BurdenSummary, usize), InvariantError> {
        let raw = match_conditions(timeline, self.registry);
        let canonical = reconcile_all(&raw)?;
        let summary = aggregate(timeline, &canonical, self.horizons)?;
        Ok((summary, canonical.len()))
    }

    /// Process every timeline. A patient that fails is logged and reported, and doesn't affect
    /// anyone else.
    pub fn run(&self, timelines: &[PatientTimeline]) -> CohortResult {
        let outcomes: Vec<_> = timelines
            .par_iter()
            .map(|timeline| (timeline.patient_id().clone(), self.process(timeline)))
            .collect();

        let mut result = CohortResult {
            summaries: Vec::with_capacity(outcomes.len()),
            failures: vec![],
            diagnostics: Diagnostics::default(),
        };
        for (patient_id, outcome) in outcomes {
            match outcome {
                Ok((summary, conditions)) => {
                    result.diagnostics.patients_processed += 1;
                    if conditions == 0 {
                        result.diagnostics.patients_with_zero_conditions += 1;
                    }
                    result.summaries.push(summary);
                }
                Err(error) => result.fail(patient_id, error),
            }
        }
        result
            .summaries
            .sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        result
            .failures
            .sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        event!(
            Level::INFO,
            "processed {} patients, {} failed",
            result.diagnostics.patients_processed,
            result.diagnostics.patients_failed
        );
        result
    }

    /// Build timelines for the cohort and process them.
    ///
    /// Cohort members whose timeline can't be built (censored before index) are reported as
    /// failures.
    pub fn run_cohort(
        &self,
        cohort: &Cohort,
        events: &Events,
        data_quality: DataQualityCounters,
    ) -> CohortResult {
        let mut timelines = Vec::with_capacity(cohort.len());
        let mut failures = vec![];
        for (member, timeline) in cohort.iter().zip(cohort.timelines(events)) {
            match timeline {
                Ok(timeline) => timelines.push(timeline),
                Err(error) => failures.push((member.patient_id.clone(), error)),
            }
        }

        let mut result = self.run(&timelines);
        for (patient_id, error) in failures {
            result.fail(patient_id, error);
        }
        result
            .failures
            .sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        result.diagnostics.data_quality = data_quality;
        result
    }
}

impl CohortResult {
    fn fail(&mut self, patient_id: PatientId, error: InvariantError) {
        event!(Level::ERROR, "skipping patient {}: {}", patient_id, error);
        self.diagnostics.patients_failed += 1;
        self.failures.push(PatientFailure { patient_id, error });
    }
}

#[cfg(test)]
mod test {
    use super::Pipeline;
    use crate::{
        test_util::{date, event, icd},
        CodeListEntry, Cohort, CohortMember, DataQualityCounters, Events, Horizon, Horizons,
        InvariantError, PatientTimeline, Registry,
    };

    fn registry() -> Registry {
        Registry::new([
            CodeListEntry::include("Diabetes", icd("E11")),
            CodeListEntry::include("Hypertension", icd("I10")),
        ])
        .unwrap()
    }

    #[test]
    fn run_patient() {
        let registry = registry();
        let horizons = Horizons::new([1, 5]).unwrap();
        let pipeline = Pipeline::new(&registry, &horizons);
        let timeline = PatientTimeline::new(
            "p1",
            date(2015, 1, 1),
            date(2021, 1, 1),
            vec![
                event("p1", icd("I10"), date(2013, 1, 1)),
                event("p1", icd("E11"), date(2015, 6, 1)),
                event("p1", icd("E11"), date(2018, 6, 1)),
            ],
        )
        .unwrap();
        let summary = pipeline.run_patient(&timeline).unwrap();
        assert_eq!(summary.count_at(Horizon::new(1)), Some(1));
        assert_eq!(summary.count_at(Horizon::new(5)), Some(1));
        assert_eq!(summary.pre_existing.len(), 1);
        assert_eq!(summary.incident.len(), 1);
        assert_eq!(summary.incident[0].onset_date, date(2015, 6, 1));
    }

    #[test]
    fn failures_are_isolated() {
        let registry = registry();
        let horizons = Horizons::new([1]).unwrap();
        let pipeline = Pipeline::new(&registry, &horizons);
        let cohort: Cohort = [
            CohortMember::new("b", date(2015, 1, 1), date(2020, 1, 1)),
            CohortMember::new("bad", date(2015, 1, 1), date(2014, 1, 1)),
            CohortMember::new("a", date(2015, 1, 1), date(2015, 6, 1)),
        ]
        .into_iter()
        .collect();
        let events: Events = [event("b", icd("E11"), date(2015, 2, 1))]
            .into_iter()
            .collect();

        let result = pipeline.run_cohort(&cohort, &events, DataQualityCounters::default());
        let ids: Vec<_> = result
            .summaries
            .iter()
            .map(|s| s.patient_id.to_string())
            .collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(result.summaries[0].count_at(Horizon::new(1)), None);
        assert_eq!(result.summaries[1].count_at(Horizon::new(1)), Some(1));
        assert_eq!(result.failures.len(), 1);
        assert_eq!(&*result.failures[0].patient_id, "bad");
        assert!(matches!(
            result.failures[0].error,
            InvariantError::CensoredBeforeIndex { .. }
        ));
        assert_eq!(result.diagnostics.patients_processed, 2);
        assert_eq!(result.diagnostics.patients_with_zero_conditions, 1);
        assert_eq!(result.diagnostics.patients_failed, 1);
    }

    #[test]
    fn one_summary_per_patient() {
        let registry = registry();
        let horizons = Horizons::new([1]).unwrap();
        let pipeline = Pipeline::new(&registry, &horizons);
        let cohort: Cohort = [
            CohortMember::new("p1", date(2010, 1, 1), date(2020, 1, 1)),
            CohortMember::new("p1", date(2015, 1, 1), date(2020, 1, 1)),
        ]
        .into_iter()
        .collect();
        let events: Events = [event("p1", icd("E11"), date(2015, 6, 1))]
            .into_iter()
            .collect();

        let result = pipeline.run_cohort(&cohort, &events, DataQualityCounters::default());
        assert_eq!(result.summaries.len(), 1);
        assert_eq!(result.summaries[0].index_date, date(2015, 1, 1));
        assert_eq!(result.summaries[0].count_at(Horizon::new(1)), Some(1));
        assert_eq!(result.diagnostics.patients_processed, 1);
    }
}
