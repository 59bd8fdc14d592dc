//! The three kinds of failure the engine distinguishes.
//!
//! - [`ConfigError`] means the study configuration can't be trusted, so nothing is processed.
//! - [`DataQualityWarning`] is a single bad input row. It is counted and the row is dropped.
//! - [`InvariantError`] is a bug. It aborts the patient it happened for, and nobody else.
use crate::{ArcStr, PatientId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown coding system \"{system}\" in code list for \"{condition}\"")]
    UnknownCodingSystem { condition: ArcStr, system: String },
    #[error("invalid code \"{code}\" in code list for \"{condition}\": {reason}")]
    InvalidCode {
        condition: ArcStr,
        code: String,
        reason: String,
    },
    #[error("code list entry has an empty condition name")]
    EmptyConditionName,
    #[error("code {code} appears more than once in the code list for \"{condition}\"")]
    DuplicateCode { condition: ArcStr, code: String },
    #[error("code {code} is both included and excluded for \"{condition}\"")]
    IncludedAndExcluded { condition: ArcStr, code: String },
    #[error("conflicting minimum occurrences for \"{condition}\": {first} and {second}")]
    ConflictingMinOccurrences {
        condition: ArcStr,
        first: u32,
        second: u32,
    },
    #[error("conflicting repeat counting rules for \"{condition}\"")]
    ConflictingCountRepeats { condition: ArcStr },
    #[error("minimum occurrences for \"{condition}\" must be at least 1")]
    ZeroMinOccurrences { condition: ArcStr },
    #[error("corroboration window for \"{condition}\" must be at least 1 day")]
    ZeroWindow { condition: ArcStr },
    #[error("condition \"{condition}\" has exclusions but no codes")]
    NoIncludedCodes { condition: ArcStr },
    #[error("rules configured for \"{condition}\", which has no code list")]
    RulesForUnknownCondition { condition: ArcStr },
    #[error("no follow-up horizons configured")]
    NoHorizons,
    #[error("follow-up horizons must be at least 1 year")]
    ZeroHorizon,
    #[error("follow-up horizon of {0} years is listed more than once")]
    DuplicateHorizon(u32),
    #[error("invalid date format \"{0}\"")]
    InvalidDateFormat(String),
    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

/// Why a raw record was skipped.
///
/// These are counted, not raised. The derived ordering is only there so counts can be kept in a
/// `BTreeMap`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Error,
)]
pub enum DataQualityWarning {
    #[error("missing patient id")]
    MissingPatientId,
    #[error("unparseable date")]
    UnparseableDate,
    #[error("placeholder date")]
    PlaceholderDate,
    #[error("unknown coding system")]
    UnknownCodingSystem,
    #[error("malformed code")]
    MalformedCode,
    #[error("unknown event type")]
    UnknownEventType,
    #[error("unreadable record")]
    UnreadableRecord,
}

impl DataQualityWarning {
    pub const ALL: [DataQualityWarning; 7] = [
        DataQualityWarning::MissingPatientId,
        DataQualityWarning::UnparseableDate,
        DataQualityWarning::PlaceholderDate,
        DataQualityWarning::UnknownCodingSystem,
        DataQualityWarning::MalformedCode,
        DataQualityWarning::UnknownEventType,
        DataQualityWarning::UnreadableRecord,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantError {
    #[error("episode of \"{condition}\" for patient {patient_id} has no event dates")]
    EmptyEpisode {
        patient_id: PatientId,
        condition: ArcStr,
    },
    #[error(
        "episode of \"{condition}\" for patient {patient_id} has onset {onset} after last seen \
         {last_seen}"
    )]
    OnsetAfterLastSeen {
        patient_id: PatientId,
        condition: ArcStr,
        onset: NaiveDate,
        last_seen: NaiveDate,
    },
    #[error("episode of \"{condition}\" for patient {patient_id} has a zero occurrence count")]
    ZeroOccurrences {
        patient_id: PatientId,
        condition: ArcStr,
    },
    #[error("episodes for patients {expected} and {found} were mixed together")]
    PatientMismatch {
        expected: PatientId,
        found: PatientId,
    },
    #[error("episodes of \"{condition}\" for patient {patient_id} use different repeat rules")]
    MixedRepeatRules {
        patient_id: PatientId,
        condition: ArcStr,
    },
    #[error(
        "more than one canonical episode of \"{condition}\" for patient {patient_id}"
    )]
    DuplicateEpisode {
        patient_id: PatientId,
        condition: ArcStr,
    },
    #[error("patient {patient_id} is censored ({censor}) before their index date ({index})")]
    CensoredBeforeIndex {
        patient_id: PatientId,
        index: NaiveDate,
        censor: NaiveDate,
    },
}
