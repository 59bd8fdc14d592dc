//! Censoring-aware burden metrics.
//!
//! A patient only tells us something about a horizon if we followed them up to it. Someone
//! censored 3 years after their lymphoma diagnosis has no 10 year count: they are left out of the
//! 10 year denominator instead of being counted as having no conditions.
use crate::{ArcStr, CanonicalEpisode, ConfigError, InvariantError, PatientId, PatientTimeline};
use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Days per year used for all follow-up durations.
pub const DAYS_PER_YEAR: f64 = 365.25;

/// Exact years between two dates, negative if `to` is before `from`.
///
/// Counts days and divides by 365.25, so leap years and month lengths don't bias durations.
pub fn years_between(from: NaiveDate, to: NaiveDate) -> f64 {
    to.signed_duration_since(from).num_days() as f64 / DAYS_PER_YEAR
}

/// A follow-up duration in whole years after the index date.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Horizon(u32);

impl Horizon {
    pub const fn new(years: u32) -> Self {
        Horizon(years)
    }

    pub fn years(self) -> u32 {
        self.0
    }

    /// The last day covered by this horizon for a patient with the given index date.
    ///
    /// Calendar years, with 29 February mapping to 28 February. `None` only if the date would be
    /// out of range.
    pub fn end(self, index_date: NaiveDate) -> Option<NaiveDate> {
        index_date.checked_add_months(Months::new(self.0.checked_mul(12)?))
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} years", self.0)
    }
}

/// The horizons burden is reported at, shortest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizons(Vec<Horizon>);

impl Horizons {
    /// Horizons may be given in any order, but must be non-empty, non-zero, and distinct.
    pub fn new(years: impl IntoIterator<Item = u32>) -> Result<Self, ConfigError> {
        let mut seen = BTreeSet::new();
        for year in years {
            if year == 0 {
                return Err(ConfigError::ZeroHorizon);
            }
            if !seen.insert(year) {
                return Err(ConfigError::DuplicateHorizon(year));
            }
        }
        if seen.is_empty() {
            return Err(ConfigError::NoHorizons);
        }
        Ok(Horizons(seen.into_iter().map(Horizon).collect()))
    }

    pub fn iter(&self) -> impl Iterator<Item = Horizon> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A condition first recorded during follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentOnset {
    pub condition: ArcStr,
    pub onset_date: NaiveDate,
    pub years_since_index: f64,
}

/// A condition first recorded before the index date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreExistingCondition {
    pub condition: ArcStr,
    pub onset_date: NaiveDate,
    pub years_before_index: f64,
}

/// One patient's comorbidity burden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurdenSummary {
    pub patient_id: PatientId,
    pub index_date: NaiveDate,
    pub censor_date: NaiveDate,
    /// Conditions with onset in `[index, index + horizon]`. `None` when the patient was censored
    /// before the end of the horizon.
    pub cumulative_condition_count: BTreeMap<Horizon, Option<usize>>,
    /// Ordered by onset date, then condition name.
    pub incident: Vec<IncidentOnset>,
    /// Ordered by onset date, then condition name.
    pub pre_existing: Vec<PreExistingCondition>,
}

impl BurdenSummary {
    /// The cumulative count at `horizon`, or `None` if the patient wasn't observed that long (or
    /// the horizon wasn't requested).
    pub fn count_at(&self, horizon: Horizon) -> Option<usize> {
        self.cumulative_condition_count
            .get(&horizon)
            .copied()
            .flatten()
    }

    pub fn is_observed_at(&self, horizon: Horizon) -> bool {
        self.count_at(horizon).is_some()
    }

    pub fn follow_up_years(&self) -> f64 {
        years_between(self.index_date, self.censor_date)
    }

    /// The cumulative count of incident conditions as a step function of follow-up time.
    ///
    /// One point per distinct onset time, giving the count reached at that time.
    pub fn cumulative_curve(&self) -> Vec<(f64, usize)> {
        let mut curve: Vec<(f64, usize)> = Vec::with_capacity(self.incident.len());
        for (idx, onset) in self.incident.iter().enumerate() {
            match curve.last_mut() {
                Some(last) if last.0 == onset.years_since_index => last.1 = idx + 1,
                _ => curve.push((onset.years_since_index, idx + 1)),
            }
        }
        curve
    }
}

/// Compute burden metrics for one patient from their canonical episodes.
///
/// Episodes must belong to the timeline's patient, one per condition.
pub fn aggregate(
    timeline: &PatientTimeline,
    episodes: &[CanonicalEpisode],
    horizons: &Horizons,
) -> Result<BurdenSummary, InvariantError> {
    let patient_id = timeline.patient_id();
    let index = timeline.index_date();
    let censor = timeline.censor_date();

    let mut seen = BTreeSet::new();
    for episode in episodes {
        if episode.patient_id() != patient_id {
            return Err(InvariantError::PatientMismatch {
                expected: patient_id.clone(),
                found: episode.patient_id().clone(),
            });
        }
        if !seen.insert(episode.condition()) {
            return Err(InvariantError::DuplicateEpisode {
                patient_id: patient_id.clone(),
                condition: episode.condition().clone(),
            });
        }
    }

    let cumulative_condition_count = horizons
        .iter()
        .map(|horizon| {
            let count = horizon.end(index).filter(|end| *end <= censor).map(|end| {
                episodes
                    .iter()
                    .filter(|ep| ep.onset_date() >= index && ep.onset_date() <= end)
                    .count()
            });
            (horizon, count)
        })
        .collect();

    let mut incident: Vec<_> = episodes
        .iter()
        .filter(|ep| ep.onset_date() >= index && ep.onset_date() <= censor)
        .map(|ep| IncidentOnset {
            condition: ep.condition().clone(),
            onset_date: ep.onset_date(),
            years_since_index: years_between(index, ep.onset_date()),
        })
        .collect();
    incident.sort_by(|a, b| {
        (a.onset_date, &a.condition).cmp(&(b.onset_date, &b.condition))
    });

    let mut pre_existing: Vec<_> = episodes
        .iter()
        .filter(|ep| ep.onset_date() < index)
        .map(|ep| PreExistingCondition {
            condition: ep.condition().clone(),
            onset_date: ep.onset_date(),
            years_before_index: years_between(ep.onset_date(), index),
        })
        .collect();
    pre_existing.sort_by(|a, b| {
        (a.onset_date, &a.condition).cmp(&(b.onset_date, &b.condition))
    });

    Ok(BurdenSummary {
        patient_id: patient_id.clone(),
        index_date: index,
        censor_date: censor,
        cumulative_condition_count,
        incident,
        pre_existing,
    })
}
