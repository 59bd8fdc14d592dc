//! Cohort level prevalence of each condition, at the index date and at every horizon.
use crate::{ArcStr, BurdenSummary, Horizon, Horizons};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CohortReport {
    horizons: Vec<Horizon>,
    /// Patients contributing to each column.
    totals: ReportRow,
    rows: BTreeMap<ArcStr, ReportRow>,
}

/// Patient counts for one condition (or the denominators for the totals row).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    /// Present on or before the index date.
    at_index: usize,
    /// Present by the end of each horizon, among patients observed that long.
    by_horizon: Vec<usize>,
}

impl ReportRow {
    fn new(horizons: usize) -> Self {
        Self {
            at_index: 0,
            by_horizon: vec![0; horizons],
        }
    }

    fn counts(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.at_index).chain(self.by_horizon.iter().copied())
    }

    fn term_row<'a>(&'a self, title: &'a str, totals: &ReportRow) -> term_data_table::Row<'a> {
        use term_data_table::{Cell, Row};
        let mut row = Row::new().with_cell(Cell::from(title));
        for (count, total) in self.counts().zip(totals.counts()) {
            row = row.with_cell(Cell::from(show_prevalence(count, total)));
        }
        row
    }
}

fn show_prevalence(count: usize, total: usize) -> String {
    if total == 0 {
        return "n/a".into();
    }
    format!("{} ({:.1}%)", count, count as f64 / total as f64 * 100.)
}

impl CohortReport {
    /// Tabulate `summaries`, with a row for each of `conditions` even if nobody has it.
    ///
    /// A patient only contributes to a horizon column if they were observed for the whole
    /// horizon.
    pub fn new<'a>(
        summaries: &[BurdenSummary],
        conditions: impl IntoIterator<Item = &'a ArcStr>,
        horizons: &Horizons,
    ) -> Self {
        let horizons: Vec<Horizon> = horizons.iter().collect();
        let mut rows: BTreeMap<ArcStr, ReportRow> = conditions
            .into_iter()
            .map(|name| (name.clone(), ReportRow::new(horizons.len())))
            .collect();
        let mut totals = ReportRow::new(horizons.len());

        for summary in summaries {
            totals.at_index += 1;
            // (condition, onset) for everything recorded before censoring
            let onsets = summary
                .pre_existing
                .iter()
                .map(|c| (&c.condition, c.onset_date))
                .chain(summary.incident.iter().map(|c| (&c.condition, c.onset_date)));
            for (condition, onset) in onsets.clone() {
                if onset <= summary.index_date {
                    row_for(&mut rows, condition, horizons.len()).at_index += 1;
                }
            }
            for (idx, horizon) in horizons.iter().enumerate() {
                let end = match horizon.end(summary.index_date) {
                    Some(end) if summary.is_observed_at(*horizon) => end,
                    _ => continue,
                };
                totals.by_horizon[idx] += 1;
                for (condition, onset) in onsets.clone() {
                    if onset <= end {
                        row_for(&mut rows, condition, horizons.len()).by_horizon[idx] += 1;
                    }
                }
            }
        }

        Self {
            horizons,
            totals,
            rows,
        }
    }

    /// Number of patients at the index date, or observed for the whole of `horizon`.
    pub fn total(&self, horizon: Option<Horizon>) -> usize {
        self.totals.get(&self.horizons, horizon).unwrap_or(0)
    }

    /// Number of patients with `condition` at the index date (`None`) or by the end of
    /// `horizon`.
    pub fn count(&self, condition: &str, horizon: Option<Horizon>) -> Option<usize> {
        self.rows.get(condition)?.get(&self.horizons, horizon)
    }

    /// Proportion of patients with `condition`, `None` if nobody contributes to the column.
    pub fn prevalence(&self, condition: &str, horizon: Option<Horizon>) -> Option<f64> {
        let total = self.total(horizon);
        if total == 0 {
            return None;
        }
        Some(self.count(condition, horizon)? as f64 / total as f64)
    }

    pub fn term_table(&self) -> term_data_table::Table<'_> {
        use term_data_table::{Cell, Row, Table};
        let mut header = Row::new()
            .with_cell(Cell::from("Condition"))
            .with_cell(Cell::from("At index"));
        for horizon in &self.horizons {
            header = header.with_cell(Cell::from(horizon.to_string()));
        }
        let mut totals = Row::new().with_cell(Cell::from("Totals"));
        for total in self.totals.counts() {
            totals = totals.with_cell(Cell::from(total.to_string()));
        }

        let mut table = Table::new().with_row(header).with_row(totals);
        for (name, row) in &self.rows {
            table.add_row(row.term_row(name, &self.totals));
        }
        table
    }
}

impl ReportRow {
    fn get(&self, horizons: &[Horizon], horizon: Option<Horizon>) -> Option<usize> {
        match horizon {
            None => Some(self.at_index),
            Some(horizon) => {
                let idx = horizons.iter().position(|h| *h == horizon)?;
                self.by_horizon.get(idx).copied()
            }
        }
    }
}

fn row_for<'r>(
    rows: &'r mut BTreeMap<ArcStr, ReportRow>,
    condition: &ArcStr,
    horizons: usize,
) -> &'r mut ReportRow {
    rows.entry(condition.clone())
        .or_insert_with(|| ReportRow::new(horizons))
}
