//! Code lists: which codes define which conditions, and how occurrences of them are counted.
//!
//! A [`Registry`] is built once from all the code lists of a study and then only read, so it can
//! be shared between the threads processing patients.
use crate::{ArcStr, Code, CodingSystem, ConfigError};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs, io,
    path::Path,
};

/// Whether a code list row adds a code to a condition or carves it out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    #[default]
    Include,
    Exclude,
}

/// One row of a code list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeListEntry {
    pub condition: ArcStr,
    pub code: Code,
    pub min_occurrences: Option<u32>,
    pub count_repeats: Option<bool>,
    pub role: EntryRole,
}

impl CodeListEntry {
    pub fn include(condition: impl Into<ArcStr>, code: Code) -> Self {
        Self {
            condition: condition.into(),
            code,
            min_occurrences: None,
            count_repeats: None,
            role: EntryRole::Include,
        }
    }

    pub fn exclude(condition: impl Into<ArcStr>, code: Code) -> Self {
        Self {
            role: EntryRole::Exclude,
            ..Self::include(condition, code)
        }
    }

    pub fn with_min_occurrences(mut self, min_occurrences: u32) -> Self {
        self.min_occurrences = Some(min_occurrences);
        self
    }

    pub fn with_count_repeats(mut self, count_repeats: bool) -> Self {
        self.count_repeats = Some(count_repeats);
        self
    }

    /// Build an entry from the strings found in a code list file.
    pub fn from_raw(condition: &str, system: &str, code: &str) -> Result<Self, ConfigError> {
        let condition = condition.trim();
        if condition.is_empty() {
            return Err(ConfigError::EmptyConditionName);
        }
        let system: CodingSystem =
            system
                .parse()
                .map_err(|_| ConfigError::UnknownCodingSystem {
                    condition: condition.into(),
                    system: system.to_owned(),
                })?;
        let code = Code::parse(system, code).map_err(|e| ConfigError::InvalidCode {
            condition: condition.into(),
            code: code.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self::include(condition, code))
    }
}

/// Rules for a condition as written in configuration. Anything left out falls back to the code
/// list, then to the defaults in [`ConditionRules`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub min_occurrences: Option<u32>,
    pub count_repeats: Option<bool>,
    pub match_descendants: Option<bool>,
    pub corroboration_window_days: Option<u32>,
}

/// The resolved rules for a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRules {
    /// How many occurrences are needed before the condition counts. At least 1.
    pub min_occurrences: u32,
    /// Count every matching event rather than every distinct date.
    pub count_repeats: bool,
    /// Let codes below a listed code in the hierarchy match too.
    pub match_descendants: bool,
    /// The `min_occurrences` occurrences must fall within this many days of each other.
    pub corroboration_window_days: Option<u32>,
}

impl Default for ConditionRules {
    fn default() -> Self {
        Self {
            min_occurrences: 1,
            count_repeats: false,
            match_descendants: false,
            corroboration_window_days: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Condition {
    rules: ConditionRules,
    includes: BTreeSet<Code>,
    excludes: BTreeSet<Code>,
}

/// Maps codes to the conditions they define.
#[derive(Debug, Clone)]
pub struct Registry {
    conditions: BTreeMap<ArcStr, Condition>,
    includes: HashMap<Code, Vec<ArcStr>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Shortcut for a registry with no extra rules.
    pub fn new(entries: impl IntoIterator<Item = CodeListEntry>) -> Result<Self, ConfigError> {
        Self::builder().entries(entries).build()
    }

    /// All conditions `code` counts towards.
    ///
    /// Empty if the code isn't in any code list.
    pub fn lookup(&self, code: &Code) -> BTreeSet<ArcStr> {
        let ancestors = code.ancestors();
        let mut found: BTreeSet<ArcStr> = self
            .includes
            .get(code)
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        for ancestor in &ancestors {
            for condition in self.includes.get(ancestor).into_iter().flatten() {
                if self.conditions[condition].rules.match_descendants {
                    found.insert(condition.clone());
                }
            }
        }
        found.retain(|name| {
            let condition = &self.conditions[name];
            !(condition.excludes.contains(code)
                || (condition.rules.match_descendants
                    && ancestors.iter().any(|anc| condition.excludes.contains(anc))))
        });
        found
    }

    /// Minimum occurrences for `condition`, 1 if it isn't registered.
    pub fn min_occurrences(&self, condition: &str) -> u32 {
        self.rules(condition)
            .map(|rules| rules.min_occurrences)
            .unwrap_or(1)
    }

    pub fn count_repeats(&self, condition: &str) -> bool {
        self.rules(condition)
            .map(|rules| rules.count_repeats)
            .unwrap_or(false)
    }

    pub fn rules(&self, condition: &str) -> Option<&ConditionRules> {
        self.conditions.get(condition).map(|c| &c.rules)
    }

    /// Condition names, sorted.
    pub fn conditions(&self) -> impl Iterator<Item = &ArcStr> + '_ {
        self.conditions.keys()
    }

    pub fn contains(&self, condition: &str) -> bool {
        self.conditions.contains_key(condition)
    }

    /// Number of conditions.
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn term_table(&self) -> term_data_table::Table<'_> {
        use term_data_table::{Cell, Row, Table};
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Condition"))
                .with_cell(Cell::from("Codes"))
                .with_cell(Cell::from("Excluded"))
                .with_cell(Cell::from("Min occurrences"))
                .with_cell(Cell::from("Count repeats"))
                .with_cell(Cell::from("Descendants"))
                .with_cell(Cell::from("Window (days)")),
        );
        for (name, condition) in &self.conditions {
            let rules = &condition.rules;
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(name.to_string()))
                    .with_cell(Cell::from(condition.includes.len().to_string()))
                    .with_cell(Cell::from(condition.excludes.len().to_string()))
                    .with_cell(Cell::from(rules.min_occurrences.to_string()))
                    .with_cell(Cell::from(yes_no(rules.count_repeats)))
                    .with_cell(Cell::from(yes_no(rules.match_descendants)))
                    .with_cell(Cell::from(match rules.corroboration_window_days {
                        Some(days) => days.to_string(),
                        None => "-".to_string(),
                    })),
            );
        }
        table
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

#[derive(Default)]
struct PendingCondition {
    includes: BTreeSet<Code>,
    excludes: BTreeSet<Code>,
    min_occurrences: Option<u32>,
    count_repeats: Option<bool>,
}

/// Collects code list entries and configured rules, and checks they agree.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<CodeListEntry>,
    rules: BTreeMap<ArcStr, RuleConfig>,
}

impl RegistryBuilder {
    pub fn entry(mut self, entry: CodeListEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(mut self, entries: impl IntoIterator<Item = CodeListEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    pub fn rules(mut self, condition: impl Into<ArcStr>, rules: RuleConfig) -> Self {
        self.rules.insert(condition.into(), rules);
        self
    }

    pub fn build(self) -> Result<Registry, ConfigError> {
        let mut pending: BTreeMap<ArcStr, PendingCondition> = BTreeMap::new();
        for entry in self.entries {
            let name: ArcStr = entry.condition.trim().into();
            if name.is_empty() {
                return Err(ConfigError::EmptyConditionName);
            }
            let cond = pending.entry(name.clone()).or_default();
            let (same, other) = match entry.role {
                EntryRole::Include => (&mut cond.includes, &cond.excludes),
                EntryRole::Exclude => (&mut cond.excludes, &cond.includes),
            };
            if other.contains(&entry.code) {
                return Err(ConfigError::IncludedAndExcluded {
                    condition: name,
                    code: entry.code.to_string(),
                });
            }
            if !same.insert(entry.code.clone()) {
                return Err(ConfigError::DuplicateCode {
                    condition: name,
                    code: entry.code.to_string(),
                });
            }
            merge_min(&name, &mut cond.min_occurrences, entry.min_occurrences)?;
            merge_repeats(&name, &mut cond.count_repeats, entry.count_repeats)?;
        }

        let mut configured = self.rules;
        let mut conditions = BTreeMap::new();
        let mut includes: HashMap<Code, Vec<ArcStr>> = HashMap::new();
        for (name, mut cond) in pending {
            let config = configured.remove(&name).unwrap_or_default();
            merge_min(&name, &mut cond.min_occurrences, config.min_occurrences)?;
            merge_repeats(&name, &mut cond.count_repeats, config.count_repeats)?;
            if config.corroboration_window_days == Some(0) {
                return Err(ConfigError::ZeroWindow { condition: name });
            }
            if cond.includes.is_empty() {
                return Err(ConfigError::NoIncludedCodes { condition: name });
            }

            let defaults = ConditionRules::default();
            let rules = ConditionRules {
                min_occurrences: cond.min_occurrences.unwrap_or(defaults.min_occurrences),
                count_repeats: cond.count_repeats.unwrap_or(defaults.count_repeats),
                match_descendants: config
                    .match_descendants
                    .unwrap_or(defaults.match_descendants),
                corroboration_window_days: config.corroboration_window_days,
            };
            for code in &cond.includes {
                includes
                    .entry(code.clone())
                    .or_insert_with(Vec::new)
                    .push(name.clone());
            }
            conditions.insert(
                name,
                Condition {
                    rules,
                    includes: cond.includes,
                    excludes: cond.excludes,
                },
            );
        }
        if let Some(condition) = configured.into_keys().next() {
            return Err(ConfigError::RulesForUnknownCondition { condition });
        }

        Ok(Registry {
            conditions,
            includes,
        })
    }
}

fn merge_min(
    condition: &ArcStr,
    current: &mut Option<u32>,
    new: Option<u32>,
) -> Result<(), ConfigError> {
    match (*current, new) {
        (_, Some(0)) => Err(ConfigError::ZeroMinOccurrences {
            condition: condition.clone(),
        }),
        (Some(first), Some(second)) if first != second => {
            Err(ConfigError::ConflictingMinOccurrences {
                condition: condition.clone(),
                first,
                second,
            })
        }
        (None, Some(new)) => {
            *current = Some(new);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn merge_repeats(
    condition: &ArcStr,
    current: &mut Option<bool>,
    new: Option<bool>,
) -> Result<(), ConfigError> {
    match (*current, new) {
        (Some(first), Some(second)) if first != second => {
            Err(ConfigError::ConflictingCountRepeats {
                condition: condition.clone(),
            })
        }
        (None, Some(new)) => {
            *current = Some(new);
            Ok(())
        }
        _ => Ok(()),
    }
}

// Loaders

#[derive(Debug, Deserialize)]
struct LongRow {
    condition: String,
    coding_system: String,
    code: String,
    #[serde(default)]
    min_occurrences: Option<u32>,
    #[serde(default)]
    count_repeats: Option<bool>,
    #[serde(default)]
    role: Option<EntryRole>,
}

/// Read a code list with one `condition,coding_system,code` row per code.
///
/// Optional `min_occurrences`, `count_repeats` and `role` (`include`/`exclude`) columns may
/// follow.
pub fn read_long_csv(reader: impl io::Read) -> Result<Vec<CodeListEntry>> {
    let mut entries = vec![];
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    for (idx, row) in reader.deserialize::<LongRow>().enumerate() {
        // header is line 1
        let line = idx + 2;
        let row = row.with_context(|| format!("reading line {}", line))?;
        let mut entry = CodeListEntry::from_raw(&row.condition, &row.coding_system, &row.code)
            .with_context(|| format!("on line {}", line))?;
        entry.min_occurrences = row.min_occurrences;
        entry.count_repeats = row.count_repeats;
        entry.role = row.role.unwrap_or_default();
        entries.push(entry);
    }
    Ok(entries)
}

pub fn load_long_csv(path: impl AsRef<Path>) -> Result<Vec<CodeListEntry>> {
    let path = path.as_ref();
    let file = fs::File::open(path)
        .with_context(|| format!("opening code list \"{}\"", path.display()))?;
    read_long_csv(io::BufReader::new(file))
        .with_context(|| format!("loading code list from \"{}\"", path.display()))
}

/// Read a code list in the cprd@cambridge medcodes format.
///
/// These files list one condition each, mixing coding systems. Only rows tagged `readcode` are
/// kept.
pub fn read_camb(reader: impl io::Read, condition: &str) -> Result<Vec<CodeListEntry>> {
    csv::Reader::from_reader(reader)
        .into_records()
        .filter_map(|record| {
            let record = match record {
                Ok(r) => r,
                Err(e) => return Some(Err(Error::from(e))),
            };
            if !matches!(record.get(3), Some(v) if v.trim() == "readcode") {
                return None;
            }
            let raw = match record.get(1) {
                Some(raw) => raw,
                None => return Some(Err(format_err!("readcode row without a code column"))),
            };
            Some(CodeListEntry::from_raw(condition, "read2", raw).map_err(Error::from))
        })
        .collect()
}

pub fn load_camb(path: impl AsRef<Path>, condition: &str) -> Result<Vec<CodeListEntry>> {
    let path = path.as_ref();
    let file = fs::File::open(path)
        .with_context(|| format!("opening code list \"{}\"", path.display()))?;
    read_camb(io::BufReader::new(file), condition)
        .with_context(|| format!("loading code list from \"{}\"", path.display()))
}
