use crate::{ArcStr, ConditionEpisode, InvariantError, PatientId};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// The single record of a condition for a patient: when it was first and last seen, and how
/// often.
///
/// Can only be built through [`CanonicalEpisode::new`], which checks the dates and count make
/// sense.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CanonicalEpisode {
    patient_id: PatientId,
    condition: ArcStr,
    onset_date: NaiveDate,
    last_seen_date: NaiveDate,
    occurrence_count: usize,
}

impl CanonicalEpisode {
    pub fn new(
        patient_id: impl Into<PatientId>,
        condition: impl Into<ArcStr>,
        onset_date: NaiveDate,
        last_seen_date: NaiveDate,
        occurrence_count: usize,
    ) -> Result<Self, InvariantError> {
        let patient_id = patient_id.into();
        let condition = condition.into();
        if onset_date > last_seen_date {
            return Err(InvariantError::OnsetAfterLastSeen {
                patient_id,
                condition,
                onset: onset_date,
                last_seen: last_seen_date,
            });
        }
        if occurrence_count == 0 {
            return Err(InvariantError::ZeroOccurrences {
                patient_id,
                condition,
            });
        }
        Ok(Self {
            patient_id,
            condition,
            onset_date,
            last_seen_date,
            occurrence_count,
        })
    }

    pub fn patient_id(&self) -> &PatientId {
        &self.patient_id
    }

    pub fn condition(&self) -> &ArcStr {
        &self.condition
    }

    pub fn onset_date(&self) -> NaiveDate {
        self.onset_date
    }

    pub fn last_seen_date(&self) -> NaiveDate {
        self.last_seen_date
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrence_count
    }
}

/// The dates that count as separate occurrences, in order.
///
/// Repeats on the same day only count when `count_repeats` is set.
pub(crate) fn counted_dates(dates: &[NaiveDate], count_repeats: bool) -> Vec<NaiveDate> {
    let mut dates = dates.to_vec();
    dates.sort_unstable();
    if !count_repeats {
        dates.dedup();
    }
    dates
}

/// Collapse a raw episode into its canonical form.
pub fn reconcile(episode: &ConditionEpisode) -> Result<CanonicalEpisode, InvariantError> {
    let counted = counted_dates(&episode.event_dates, episode.count_repeats);
    match (counted.first(), counted.last()) {
        (Some(onset), Some(last_seen)) => CanonicalEpisode::new(
            episode.patient_id.clone(),
            episode.condition.clone(),
            *onset,
            *last_seen,
            counted.len(),
        ),
        _ => Err(InvariantError::EmptyEpisode {
            patient_id: episode.patient_id.clone(),
            condition: episode.condition.clone(),
        }),
    }
}

/// Reconcile the raw episodes of one patient, merging any that are for the same condition.
///
/// The result has one episode per condition, ordered by condition name.
pub fn reconcile_all(
    episodes: &[ConditionEpisode],
) -> Result<Vec<CanonicalEpisode>, InvariantError> {
    let mut merged: BTreeMap<&ArcStr, ConditionEpisode> = BTreeMap::new();
    let mut patient_id: Option<&PatientId> = None;
    for episode in episodes {
        match patient_id {
            Some(expected) if *expected != episode.patient_id => {
                return Err(InvariantError::PatientMismatch {
                    expected: expected.clone(),
                    found: episode.patient_id.clone(),
                })
            }
            Some(_) => (),
            None => patient_id = Some(&episode.patient_id),
        }
        match merged.get_mut(&episode.condition) {
            Some(existing) => {
                if existing.count_repeats != episode.count_repeats {
                    return Err(InvariantError::MixedRepeatRules {
                        patient_id: episode.patient_id.clone(),
                        condition: episode.condition.clone(),
                    });
                }
                existing.event_dates.extend_from_slice(&episode.event_dates);
                existing.event_dates.sort_unstable();
                existing.occurrence_count =
                    counted_dates(&existing.event_dates, existing.count_repeats).len();
            }
            None => {
                merged.insert(&episode.condition, episode.clone());
            }
        }
    }
    merged.values().map(reconcile).collect()
}

#[cfg(test)]
mod test {
    use super::{counted_dates, reconcile, reconcile_all, CanonicalEpisode};
    use crate::{test_util::date, ConditionEpisode, InvariantError};
    use chrono::NaiveDate;

    fn raw(
        patient: &str,
        condition: &str,
        dates: &[NaiveDate],
        count_repeats: bool,
    ) -> ConditionEpisode {
        ConditionEpisode {
            patient_id: patient.into(),
            condition: condition.into(),
            event_dates: dates.to_vec(),
            occurrence_count: counted_dates(dates, count_repeats).len(),
            count_repeats,
        }
    }

    #[test]
    fn same_day_repeats() {
        let dates = [date(2019, 3, 1), date(2019, 3, 1), date(2020, 1, 15)];
        let episode = reconcile(&raw("p1", "COPD", &dates, false)).unwrap();
        assert_eq!(episode.onset_date(), date(2019, 3, 1));
        assert_eq!(episode.last_seen_date(), date(2020, 1, 15));
        assert_eq!(episode.occurrence_count(), 2);

        let episode = reconcile(&raw("p1", "COPD", &dates, true)).unwrap();
        assert_eq!(episode.occurrence_count(), 3);
    }

    #[test]
    fn unordered_dates() {
        let dates = [date(2020, 1, 15), date(2018, 6, 1), date(2019, 3, 1)];
        let episode = reconcile(&raw("p1", "COPD", &dates, false)).unwrap();
        assert_eq!(episode.onset_date(), date(2018, 6, 1));
        assert_eq!(episode.last_seen_date(), date(2020, 1, 15));
    }

    #[test]
    fn invariants() {
        assert!(matches!(
            reconcile(&raw("p1", "COPD", &[], false)),
            Err(InvariantError::EmptyEpisode { .. })
        ));
        assert!(matches!(
            CanonicalEpisode::new("p1", "COPD", date(2020, 1, 1), date(2019, 1, 1), 1),
            Err(InvariantError::OnsetAfterLastSeen { .. })
        ));
        assert!(matches!(
            CanonicalEpisode::new("p1", "COPD", date(2019, 1, 1), date(2019, 1, 1), 0),
            Err(InvariantError::ZeroOccurrences { .. })
        ));
    }

    #[test]
    fn merges_by_condition() {
        let episodes = [
            raw("p1", "COPD", &[date(2019, 3, 1)], false),
            raw("p1", "Asthma", &[date(2017, 3, 1)], false),
            raw("p1", "COPD", &[date(2018, 3, 1), date(2019, 3, 1)], false),
        ];
        let canonical = reconcile_all(&episodes).unwrap();
        assert_eq!(canonical.len(), 2);
        assert_eq!(&**canonical[0].condition(), "Asthma");
        assert_eq!(canonical[1].onset_date(), date(2018, 3, 1));
        assert_eq!(canonical[1].occurrence_count(), 2);

        let mixed = [
            raw("p1", "COPD", &[date(2019, 3, 1)], false),
            raw("p1", "COPD", &[date(2019, 3, 1)], true),
        ];
        assert!(matches!(
            reconcile_all(&mixed),
            Err(InvariantError::MixedRepeatRules { .. })
        ));

        let two_patients = [
            raw("p1", "COPD", &[date(2019, 3, 1)], false),
            raw("p2", "Asthma", &[date(2019, 3, 1)], false),
        ];
        assert!(matches!(
            reconcile_all(&two_patients),
            Err(InvariantError::PatientMismatch { .. })
        ));
        assert_eq!(reconcile_all(&[]).unwrap(), vec![]);
    }
}
