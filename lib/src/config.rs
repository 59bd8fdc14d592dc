//! Study configuration, read from a TOML file.
//!
//! ```toml
//! horizons = [1, 5, 10]
//!
//! [paths]
//! cohort = "cohort.csv"
//! events = "events.csv"
//!
//! [[code_lists]]
//! path = "code_lists/conditions.csv"
//!
//! [[code_lists]]
//! path = "camb_codesets/DIB132.csv"
//! format = "camb"
//! condition = "Diabetes"
//!
//! [conditions.Diabetes]
//! min_occurrences = 2
//! ```
//!
//! Relative paths are resolved against the directory containing the configuration file.
use crate::{
    normalize::NormalizeOptions,
    registry::{self, RuleConfig},
    ArcStr, CodingSystem, ConfigError, Horizons, Registry,
};
use chrono::{
    format::{Item, StrftimeItems},
    NaiveDate,
};
use qu::ick_use::*;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    /// Follow-up horizons in years.
    #[serde(default = "default_horizons")]
    pub horizons: Vec<u32>,
    #[serde(default = "NormalizeOptions::default_date_formats")]
    pub date_formats: Vec<String>,
    #[serde(default = "NormalizeOptions::default_placeholder_dates")]
    pub placeholder_dates: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub default_coding_system: Option<CodingSystem>,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub code_lists: Vec<CodeListSource>,
    /// Per-condition rules, keyed by condition name.
    #[serde(default)]
    pub conditions: BTreeMap<ArcStr, RuleConfig>,
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_horizons() -> Vec<u32> {
    vec![1, 5, 10]
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Relative to `data_dir`.
    pub cohort: PathBuf,
    /// Relative to `data_dir`.
    pub events: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            data_dir: ".".into(),
            output_dir: "output".into(),
            cohort: "cohort.csv".into(),
            events: "events.csv".into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeListFormat {
    /// `condition,coding_system,code` rows.
    #[default]
    Long,
    /// cprd@cambridge medcodes, one condition per file.
    Camb,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeListSource {
    /// Relative to `data_dir`.
    pub path: PathBuf,
    #[serde(default)]
    pub format: CodeListFormat,
    /// Required for `camb` files, which don't name their condition.
    pub condition: Option<String>,
}

impl StudyConfig {
    /// Load and check the configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config from \"{}\"", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base_dir)
            .with_context(|| format!("in config file \"{}\"", path.display()))
    }

    /// Parse configuration text, resolving relative paths against `base_dir`.
    pub fn parse(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut config: StudyConfig = toml::from_str(text)?;
        config.base_dir = base_dir.into();
        config.validate()?;
        Ok(config)
    }

    /// Everything that can be checked without touching other files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.horizons()?;
        self.normalize_options()?;
        for source in &self.code_lists {
            if source.format == CodeListFormat::Camb
                && source.condition.as_deref().map_or(true, |c| c.trim().is_empty())
            {
                return Err(ConfigError::Invalid(format!(
                    "code list \"{}\" is in camb format but has no condition",
                    source.path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn horizons(&self) -> Result<Horizons, ConfigError> {
        Horizons::new(self.horizons.iter().copied())
    }

    pub fn normalize_options(&self) -> Result<NormalizeOptions, ConfigError> {
        if self.date_formats.is_empty() {
            return Err(ConfigError::Invalid("no date formats configured".into()));
        }
        for format in &self.date_formats {
            if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(ConfigError::InvalidDateFormat(format.clone()));
            }
        }
        Ok(NormalizeOptions {
            date_formats: self.date_formats.clone(),
            placeholder_dates: self.placeholder_dates.clone(),
            default_coding_system: self.default_coding_system,
        })
    }

    /// Load every code list and combine them with the configured rules.
    pub fn build_registry(&self) -> Result<Registry> {
        let mut builder = Registry::builder();
        for source in &self.code_lists {
            let path = self.data_path(&source.path);
            let entries = match source.format {
                CodeListFormat::Long => registry::load_long_csv(&path)?,
                CodeListFormat::Camb => {
                    let condition = source.condition.as_deref().unwrap_or_default();
                    registry::load_camb(&path, condition)?
                }
            };
            event!(
                Level::DEBUG,
                "{} entries from \"{}\"",
                entries.len(),
                path.display()
            );
            builder = builder.entries(entries);
        }
        for (condition, rules) in &self.conditions {
            builder = builder.rules(condition.clone(), rules.clone());
        }
        let registry = builder.build()?;
        event!(Level::INFO, "loaded code lists for {} conditions", registry.len());
        Ok(registry)
    }

    pub fn cohort_path(&self) -> PathBuf {
        self.data_path(&self.paths.cohort)
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_path(&self.paths.events)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base_dir.join(&self.paths.output_dir)
    }

    fn data_path(&self, path: &Path) -> PathBuf {
        self.base_dir.join(&self.paths.data_dir).join(path)
    }
}
