//! How much of an events extract survives normalization, and why the rest doesn't.
use clap::Parser;
use comorbidity_burden::{header, Cohort, CodingSystem, EventType, Normalizer, StudyConfig};
use qu::ick_use::*;
use std::{collections::BTreeMap, path::PathBuf};
use term_data_table::{Cell, Row, Table};

#[derive(Debug, Parser)]
struct Opt {
    /// The study configuration (toml).
    #[clap(long, short)]
    config: PathBuf,
}

#[qu::ick]
fn main(opt: Opt) -> Result {
    let config = StudyConfig::load(&opt.config)?;
    let cohort = Cohort::load_csv(config.cohort_path())?;
    let normalizer = Normalizer::new(&cohort, config.normalize_options()?);
    let (events, counters) = normalizer.normalize_csv(config.events_path())?;

    header("Records");
    println!("{}", counters.term_table().for_terminal());

    let mut counts: BTreeMap<(CodingSystem, EventType), usize> = BTreeMap::new();
    for event in events.iter() {
        *counts
            .entry((event.code.system(), event.event_type))
            .or_insert(0) += 1;
    }
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from("Coding system"))
            .with_cell(Cell::from("Event type"))
            .with_cell(Cell::from("Count"))
            .with_cell(Cell::from("Percentage")),
    );
    for ((system, event_type), count) in counts {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(system.label()))
                .with_cell(Cell::from(event_type.to_string()))
                .with_cell(Cell::from(count.to_string()))
                .with_cell(Cell::from(format!(
                    "{:.1}%",
                    count as f64 / events.len() as f64 * 100.
                ))),
        );
    }
    header("Accepted events");
    println!("{}", table);
    println!(
        "{} of {} cohort members have at least one event",
        events.patient_count(),
        cohort.len()
    );
    Ok(())
}
