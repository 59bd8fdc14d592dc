//! Clinical codes tagged with the coding system they come from.
//!
//! The same string can mean different things in different systems, so a code is never looked at
//! without its system. Each system has its own canonical form, which is what gets compared.

mod read2;
pub use read2::ReadCode;

use crate::ArcStr;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// The coding systems we know how to canonicalise.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CodingSystem {
    /// Read version 2 (UK primary care).
    Read2,
    /// ICD-10 diagnoses (secondary care).
    Icd10,
    /// OPCS-4 procedures (secondary care).
    Opcs4,
    /// SNOMED CT concept ids.
    SnomedCt,
}

impl CodingSystem {
    pub const ALL: [CodingSystem; 4] = [
        CodingSystem::Read2,
        CodingSystem::Icd10,
        CodingSystem::Opcs4,
        CodingSystem::SnomedCt,
    ];

    pub fn label(self) -> &'static str {
        match self {
            CodingSystem::Read2 => "Read v2",
            CodingSystem::Icd10 => "ICD-10",
            CodingSystem::Opcs4 => "OPCS-4",
            CodingSystem::SnomedCt => "SNOMED CT",
        }
    }
}

impl fmt::Display for CodingSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CodingSystem::Read2 => "read2",
            CodingSystem::Icd10 => "icd10",
            CodingSystem::Opcs4 => "opcs4",
            CodingSystem::SnomedCt => "snomedct",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("\"{0}\" is not a known coding system")]
pub struct UnknownCodingSystem(pub String);

impl FromStr for CodingSystem {
    type Err = UnknownCodingSystem;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let key: String = input
            .trim()
            .chars()
            .filter(|ch| !matches!(ch, ' ' | '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "read" | "read2" | "readv2" | "readcode" => Ok(CodingSystem::Read2),
            "icd10" | "icd" => Ok(CodingSystem::Icd10),
            "opcs4" | "opcs" => Ok(CodingSystem::Opcs4),
            "snomed" | "snomedct" | "sct" => Ok(CodingSystem::SnomedCt),
            _ => Err(UnknownCodingSystem(input.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("empty code")]
    Empty,
    #[error("\"{code}\" is not a valid {system} code")]
    Invalid { system: CodingSystem, code: String },
}

/// A code in canonical form, together with its coding system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Code {
    system: CodingSystem,
    value: ArcStr,
}

static PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s.\-/*+]").expect("punctuation regex is valid"));
static ICD10: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][0-9][0-9A-Z]{1,5}$").expect("ICD-10 regex is valid"));
static OPCS4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][0-9]{2}[0-9A-Z]{0,3}$").expect("OPCS-4 regex is valid"));
static SNOMED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{6,18}$").expect("SNOMED regex is valid"));

impl Code {
    /// Canonicalise `raw` as a code of the given system.
    pub fn parse(system: CodingSystem, raw: &str) -> Result<Self, CodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CodeError::Empty);
        }
        let invalid = || CodeError::Invalid {
            system,
            code: raw.to_owned(),
        };
        let value: ArcStr = match system {
            // Read v2 is case sensitive and uses `.` as padding, so leave both alone.
            CodingSystem::Read2 => ReadCode::parse_lenient(trimmed)
                .map_err(|_| invalid())?
                .as_str()
                .into(),
            CodingSystem::Icd10 => {
                let mut value = PUNCTUATION.replace_all(trimmed, "").to_ascii_uppercase();
                // NHS extracts pad 3 character codes with an `X` filler (`I10X`).
                if value.len() == 4 && value.ends_with('X') {
                    value.truncate(3);
                }
                if !ICD10.is_match(&value) {
                    return Err(invalid());
                }
                value.into()
            }
            CodingSystem::Opcs4 => {
                let value = PUNCTUATION.replace_all(trimmed, "").to_ascii_uppercase();
                if !OPCS4.is_match(&value) {
                    return Err(invalid());
                }
                value.into()
            }
            CodingSystem::SnomedCt => {
                if !SNOMED.is_match(trimmed) {
                    return Err(invalid());
                }
                trimmed.into()
            }
        };
        Ok(Code { system, value })
    }

    pub fn system(&self) -> CodingSystem {
        self.system
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Codes above this one in its system's hierarchy, nearest first.
    ///
    /// Read v2 encodes the hierarchy in the `.` padding. ICD-10 and OPCS-4 codes are refined by
    /// appending characters to a 3 character category. SNOMED CT ids carry no hierarchy.
    pub fn ancestors(&self) -> Vec<Code> {
        let system = self.system;
        let wrap = |value: ArcStr| Code { system, value };
        match system {
            CodingSystem::Read2 => match ReadCode::from_str(&self.value) {
                Ok(code) => code
                    .ancestors()
                    .map(|anc| wrap(anc.as_str().into()))
                    .collect(),
                Err(_) => vec![],
            },
            CodingSystem::Icd10 | CodingSystem::Opcs4 => (3..self.value.len())
                .rev()
                .map(|len| wrap(self.value[..len].into()))
                .collect(),
            CodingSystem::SnomedCt => vec![],
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.value)
    }
}
