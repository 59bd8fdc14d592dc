//! Comorbidity burden for every patient in a study.
use clap::Parser;
use comorbidity_burden::{
    header, output, Cohort, CohortReport, Normalizer, Pipeline, StudyConfig,
};
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Opt {
    /// The study configuration (toml).
    #[clap(long, short)]
    config: PathBuf,
    /// Replace the results of an earlier run.
    #[clap(long)]
    overwrite: bool,
    /// Show which code lists were loaded.
    #[clap(long, short)]
    show_code_lists: bool,
}

#[qu::ick]
fn main(opt: Opt) -> Result {
    // configuration problems stop us before any patient is looked at
    let config = StudyConfig::load(&opt.config)?;
    let horizons = config.horizons()?;
    let registry = config.build_registry()?;
    if opt.show_code_lists {
        header("Code lists");
        println!("{}", registry.term_table().for_terminal());
    }

    let cohort = Cohort::load_csv(config.cohort_path())?;
    event!(Level::INFO, "{} patients in cohort", cohort.len());
    let normalizer = Normalizer::new(&cohort, config.normalize_options()?);
    let (events, data_quality) = normalizer.normalize_csv(config.events_path())?;

    let pipeline = Pipeline::new(&registry, &horizons);
    let result = pipeline.run_cohort(&cohort, &events, data_quality);
    output::save_results(&result, &horizons, config.output_dir(), opt.overwrite)?;

    let report = CohortReport::new(&result.summaries, registry.conditions(), &horizons);
    header("Prevalence");
    println!("{}", report.term_table().for_terminal());
    header("Records");
    println!(
        "{}",
        result.diagnostics.data_quality.term_table().for_terminal()
    );
    header("Patients");
    println!("{}", result.diagnostics.term_table().for_terminal());
    for failure in &result.failures {
        println!("{}: {}", failure.patient_id, failure.error);
    }
    Ok(())
}
