use chrono::{Duration, NaiveDate};
use comorbidity_burden::{
    aggregate, output, registry, CanonicalEpisode, Cohort, CohortMember, CohortReport,
    DataQualityWarning, Horizon, Horizons, NormalizeOptions, Normalizer, PatientTimeline,
    Pipeline, RawRecord, Registry, StudyConfig,
};
use proptest::prelude::*;
use std::{fs, path::PathBuf};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

const CODE_LISTS: &str = "\
condition,coding_system,code,min_occurrences,count_repeats,role
Diabetes,icd10,E11,2,,
Diabetes,read2,C10F.,,,
Hypertension,icd10,I10,,,
Hypertension,read2,G20..,,,
COPD,icd10,J44,,,
";

fn registry() -> Registry {
    Registry::new(registry::read_long_csv(CODE_LISTS.as_bytes()).unwrap()).unwrap()
}

#[test]
fn cohort_end_to_end() {
    let registry = registry();
    let horizons = Horizons::new([1, 5, 10]).unwrap();
    let cohort: Cohort = [
        // followed for 11 years
        CohortMember::new("long", date(2008, 3, 1), date(2019, 6, 1)),
        // censored after 2 years
        CohortMember::new("short", date(2015, 1, 1), date(2017, 1, 1)),
        // no events at all
        CohortMember::new("quiet", date(2012, 1, 1), date(2020, 1, 1)),
    ]
    .into_iter()
    .collect();

    let records = vec![
        RawRecord::new("long", "2005-04-01", "read2", "G20.."),
        RawRecord::new("long", "2009-01-10", "icd10", "E11"),
        // only one diabetes code on its own would not be enough
        RawRecord::new("long", "2010-06-01", "read", "C10F.00"),
        RawRecord::new("long", "2016-02-01", "ICD-10", "J44."),
        RawRecord::new("short", "2015/01/01", "icd10", "J44"),
        RawRecord::new("short", "2015-08-01", "icd10", "J44"),
        RawRecord::new("short", "1900-01-01", "icd10", "I10"),
        RawRecord::new("outsider", "2015-08-01", "icd10", "I10"),
    ];
    let normalizer = Normalizer::new(&cohort, NormalizeOptions::default());
    let (events, counters) = normalizer.normalize_all(&records);
    assert_eq!(counters.records_read, 8);
    assert_eq!(counters.out_of_cohort, 1);
    assert_eq!(counters.skipped(DataQualityWarning::UnparseableDate), 1);
    assert_eq!(counters.skipped(DataQualityWarning::PlaceholderDate), 1);

    let pipeline = Pipeline::new(&registry, &horizons);
    let result = pipeline.run_cohort(&cohort, &events, counters);
    assert!(result.failures.is_empty());
    let ids: Vec<_> = result
        .summaries
        .iter()
        .map(|s| s.patient_id.to_string())
        .collect();
    assert_eq!(ids, ["long", "quiet", "short"]);

    let long = &result.summaries[0];
    assert_eq!(long.count_at(Horizon::new(1)), Some(1));
    assert_eq!(long.count_at(Horizon::new(5)), Some(1));
    assert_eq!(long.count_at(Horizon::new(10)), Some(2));
    assert_eq!(long.pre_existing.len(), 1);
    assert_eq!(&*long.pre_existing[0].condition, "Hypertension");
    assert_eq!(long.incident[0].onset_date, date(2009, 1, 10));

    // followed for 8 years, so the 10 year horizon is unobserved rather than zero
    let quiet = &result.summaries[1];
    assert_eq!(quiet.count_at(Horizon::new(1)), Some(0));
    assert_eq!(quiet.count_at(Horizon::new(5)), Some(0));
    assert_eq!(quiet.count_at(Horizon::new(10)), None);

    let short = &result.summaries[2];
    assert_eq!(short.count_at(Horizon::new(1)), Some(1));
    assert_eq!(short.count_at(Horizon::new(5)), None);
    assert_eq!(short.count_at(Horizon::new(10)), None);

    assert_eq!(result.diagnostics.patients_processed, 3);
    assert_eq!(result.diagnostics.patients_with_zero_conditions, 1);

    let report = CohortReport::new(&result.summaries, registry.conditions(), &horizons);
    assert_eq!(report.total(Some(Horizon::new(5))), 2);
    assert_eq!(report.count("COPD", Some(Horizon::new(1))), Some(1));
    assert_eq!(report.count("COPD", Some(Horizon::new(10))), Some(1));
    assert_eq!(report.count("Hypertension", None), Some(1));
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "comorbidity-burden-{}-{}",
        name,
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn from_config_files() {
    let dir = scratch_dir("config");
    fs::write(
        dir.join("study.toml"),
        r#"
horizons = [1, 2]

[[code_lists]]
path = "conditions.csv"

[conditions.COPD]
match_descendants = true
"#,
    )
    .unwrap();
    fs::write(dir.join("conditions.csv"), CODE_LISTS).unwrap();
    fs::write(
        dir.join("cohort.csv"),
        "PatID,IndexDate,CensorDate\np1,2015-01-01,2018-01-01\n",
    )
    .unwrap();
    fs::write(
        dir.join("events.csv"),
        "PatID,EntryDate,CodingSystem,Code\n\
         p1,2015-05-01,icd10,J44.1\n\
         p1,2016-05-01,icd10\n\
         p1,not a date,icd10,I10\n",
    )
    .unwrap();

    let config = StudyConfig::load(dir.join("study.toml")).unwrap();
    let horizons = config.horizons().unwrap();
    let registry = config.build_registry().unwrap();
    assert_eq!(registry.len(), 3);
    assert!(registry.rules("COPD").unwrap().match_descendants);

    let cohort = Cohort::load_csv(config.cohort_path()).unwrap();
    let normalizer = Normalizer::new(&cohort, config.normalize_options().unwrap());
    let (events, counters) = normalizer.normalize_csv(config.events_path()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(counters.records_read, 3);
    assert_eq!(counters.total_skipped(), 2);

    let result = Pipeline::new(&registry, &horizons).run_cohort(&cohort, &events, counters);
    assert_eq!(result.summaries[0].count_at(Horizon::new(2)), Some(1));

    let out = config.output_dir();
    output::save_results(&result, &horizons, &out, false).unwrap();
    assert!(out.join(output::SUMMARIES_BIN).exists());
    assert!(out.join(output::HORIZON_COUNTS_CSV).exists());
    // a second run must not clobber the first unless asked to
    assert!(output::save_results(&result, &horizons, &out, false).is_err());
    output::save_results(&result, &horizons, &out, true).unwrap();

    let reloaded: Vec<comorbidity_burden::BurdenSummary> =
        comorbidity_burden::load(out.join(output::SUMMARIES_BIN)).unwrap();
    assert_eq!(reloaded, result.summaries);
    let _ = fs::remove_dir_all(&dir);
}

/// A patient with episodes at the given day offsets from the index date (negative is before).
fn patient(
    follow_up_days: i64,
    onsets: &[i64],
) -> (PatientTimeline, Vec<CanonicalEpisode>) {
    let index = date(2010, 1, 1);
    let censor = index + Duration::days(follow_up_days);
    let timeline = PatientTimeline::new("p", index, censor, vec![]).unwrap();
    let episodes = onsets
        .iter()
        .enumerate()
        .map(|(idx, offset)| {
            let onset = index + Duration::days(*offset);
            CanonicalEpisode::new("p", format!("condition {}", idx), onset, onset, 1).unwrap()
        })
        .collect();
    (timeline, episodes)
}

proptest! {
    /// Counts never go down as the horizon gets longer, and once a horizon is not observed no
    /// longer one is.
    #[test]
    fn counts_are_monotone(
        follow_up_days in 0i64..6000,
        onsets in proptest::collection::vec(-3000i64..6000, 0..12),
    ) {
        let horizons = Horizons::new([1, 2, 5, 10, 15]).unwrap();
        let (timeline, episodes) = patient(follow_up_days, &onsets);
        let summary = aggregate(&timeline, &episodes, &horizons).unwrap();

        let mut last_count = 0;
        let mut seen_unobserved = false;
        for horizon in horizons.iter() {
            match summary.count_at(horizon) {
                Some(count) => {
                    prop_assert!(!seen_unobserved, "observed after an unobserved horizon");
                    prop_assert!(count >= last_count);
                    last_count = count;
                }
                None => seen_unobserved = true,
            }
        }
        prop_assert!(summary.incident.len() + summary.pre_existing.len() <= episodes.len());
        for onset in &summary.incident {
            prop_assert!(onset.years_since_index >= 0.);
            prop_assert!(onset.onset_date <= summary.censor_date);
        }
    }

    #[test]
    fn aggregate_is_idempotent(
        follow_up_days in 0i64..6000,
        onsets in proptest::collection::vec(-3000i64..6000, 0..12),
    ) {
        let horizons = Horizons::new([1, 5, 10]).unwrap();
        let (timeline, episodes) = patient(follow_up_days, &onsets);
        let first = aggregate(&timeline, &episodes, &horizons).unwrap();
        let second = aggregate(&timeline, &episodes, &horizons).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn no_episodes_means_zero_wherever_observed(follow_up_days in 0i64..6000) {
        let horizons = Horizons::new([1, 5, 10]).unwrap();
        let (timeline, _) = patient(follow_up_days, &[]);
        let summary = aggregate(&timeline, &[], &horizons).unwrap();
        for horizon in horizons.iter() {
            let end = horizon.end(timeline.index_date()).unwrap();
            let expected = if end <= timeline.censor_date() { Some(0) } else { None };
            prop_assert_eq!(summary.count_at(horizon), expected);
        }
    }
}
