//! Writing results to disk.
//!
//! Every file refuses to replace an existing one unless `overwrite` is set.
use crate::{save, util, BurdenSummary, CohortResult, Diagnostics, Horizons, PatientFailure};
use qu::ick_use::*;
use serde::Serialize;
use std::{
    fs,
    io::{self, Write},
    path::Path,
};

pub const SUMMARIES_BIN: &str = "summaries.bin";
pub const SUMMARIES_JSONL: &str = "summaries.jsonl";
pub const HORIZON_COUNTS_CSV: &str = "horizon_counts.csv";
pub const DIAGNOSTICS_JSON: &str = "diagnostics.json";
pub const FAILURES_CSV: &str = "failures.csv";

/// Write all outputs of a run into `dir`.
pub fn save_results(
    result: &CohortResult,
    horizons: &Horizons,
    dir: impl AsRef<Path>,
    overwrite: bool,
) -> Result {
    let dir = dir.as_ref();
    save(&result.summaries, dir.join(SUMMARIES_BIN), overwrite)?;
    write_file(&dir.join(SUMMARIES_JSONL), overwrite, |out| {
        write_json_lines(&result.summaries, out)
    })?;
    write_file(&dir.join(HORIZON_COUNTS_CSV), overwrite, |out| {
        write_horizon_counts(&result.summaries, horizons, out)
    })?;
    write_file(&dir.join(DIAGNOSTICS_JSON), overwrite, |out| {
        write_diagnostics(&result.diagnostics, out)
    })?;
    write_file(&dir.join(FAILURES_CSV), overwrite, |out| {
        write_failures(&result.failures, out)
    })?;
    event!(Level::INFO, "results saved to \"{}\"", dir.display());
    Ok(())
}

fn write_file(
    path: &Path,
    overwrite: bool,
    f: impl FnOnce(&mut io::BufWriter<fs::File>) -> Result,
) -> Result {
    fn inner(
        path: &Path,
        overwrite: bool,
        f: impl FnOnce(&mut io::BufWriter<fs::File>) -> Result,
    ) -> Result {
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
        f(&mut out)?;
        out.flush()?;
        Ok(())
    }
    inner(path, overwrite, f).with_context(|| format!("writing \"{}\"", path.display()))
}

/// One JSON object per line, one line per patient.
pub fn write_json_lines(summaries: &[BurdenSummary], mut out: impl Write) -> Result {
    for summary in summaries {
        serde_json::to_writer(&mut out, summary)?;
        writeln!(out)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct HorizonCountRow<'a> {
    patient_id: &'a str,
    horizon_years: u32,
    observed: bool,
    /// Empty when not observed.
    condition_count: Option<usize>,
}

/// A long table with a row per patient and horizon.
pub fn write_horizon_counts(
    summaries: &[BurdenSummary],
    horizons: &Horizons,
    out: impl Write,
) -> Result {
    let mut writer = csv::Writer::from_writer(out);
    for summary in summaries {
        for horizon in horizons.iter() {
            let condition_count = summary.count_at(horizon);
            writer.serialize(HorizonCountRow {
                patient_id: &summary.patient_id,
                horizon_years: horizon.years(),
                observed: condition_count.is_some(),
                condition_count,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_diagnostics(diagnostics: &Diagnostics, out: impl Write) -> Result {
    serde_json::to_writer_pretty(out, diagnostics)?;
    Ok(())
}

#[derive(Serialize)]
struct FailureRow<'a> {
    patient_id: &'a str,
    error: String,
}

pub fn write_failures(failures: &[PatientFailure], out: impl Write) -> Result {
    let mut writer = csv::Writer::from_writer(out);
    for failure in failures {
        writer.serialize(FailureRow {
            patient_id: &failure.patient_id,
            error: failure.error.to_string(),
        })?;
    }
    writer.flush()?;
    Ok(())
}
