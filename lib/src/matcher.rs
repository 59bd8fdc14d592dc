//! Finding conditions in a patient's events.
use crate::{reconcile::counted_dates, ArcStr, Code, PatientId, PatientTimeline, Registry};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All the evidence for one condition in one patient's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionEpisode {
    pub patient_id: PatientId,
    pub condition: ArcStr,
    /// Dates of matching events, in order.
    pub event_dates: Vec<NaiveDate>,
    pub occurrence_count: usize,
    /// Whether same-day repeats were counted separately.
    pub count_repeats: bool,
}

/// Find the conditions recorded in `timeline`, ordered by condition name.
///
/// A condition is only returned once it has been seen often enough (and close enough together,
/// where the condition has a corroboration window).
pub fn match_conditions(timeline: &PatientTimeline, registry: &Registry) -> Vec<ConditionEpisode> {
    let hits = timeline.events().iter().fold(
        BTreeMap::<ArcStr, Vec<(NaiveDate, &Code)>>::new(),
        |mut hits, event| {
            for condition in registry.lookup(&event.code) {
                hits.entry(condition)
                    .or_insert_with(Vec::new)
                    .push((event.date, &event.code));
            }
            hits
        },
    );

    hits.into_iter()
        .filter_map(|(condition, mut hits)| {
            let rules = registry.rules(&condition).cloned().unwrap_or_default();
            if !rules.count_repeats {
                // the same code twice on one day is one occurrence
                hits.sort();
                hits.dedup();
            }
            let event_dates: Vec<NaiveDate> = hits.into_iter().map(|(date, _)| date).collect();
            let counted = counted_dates(&event_dates, rules.count_repeats);
            if !corroborated(
                &counted,
                rules.min_occurrences,
                rules.corroboration_window_days,
            ) {
                return None;
            }
            Some(ConditionEpisode {
                patient_id: timeline.patient_id().clone(),
                condition,
                event_dates,
                occurrence_count: counted.len(),
                count_repeats: rules.count_repeats,
            })
        })
        .collect()
}

/// Whether `min` of the (sorted) `counted` dates fall within `window_days` of each other.
fn corroborated(counted: &[NaiveDate], min: u32, window_days: Option<u32>) -> bool {
    let min = (min as usize).max(1);
    if counted.len() < min {
        return false;
    }
    match window_days {
        None => true,
        Some(days) => counted
            .windows(min)
            .any(|run| (run[min - 1] - run[0]).num_days() <= i64::from(days)),
    }
}
