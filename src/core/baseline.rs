use std::collections::HashMap;
use std::io::Write;
use std::time::Instant;

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, info};

use super::config::EngineConfig;
use super::error::{SwrError, SwrResult};
use super::series::{MarketSeries, index_from};
use super::solver::{RateSearchConfig, max_sustainable_rate};
use super::types::BaselineEntry;

#[derive(Debug, Clone)]
struct BaselineColumn {
    rate_bp: u32,
    worst_start: usize,
    /// One entry per start index with a full window, in index order.
    entries: Vec<BaselineEntry>,
}

/// Worst-case-across-history safe withdrawal rates.
///
/// Every (duration, allocation) pair the history can cover is computed up
/// front; lookups never simulate.
#[derive(Debug, Clone)]
pub struct BaselineRateTable {
    origin: NaiveDate,
    months: usize,
    max_duration_years: u32,
    allocations: Vec<u32>,
    columns: HashMap<(u32, u32), BaselineColumn>,
}

impl BaselineRateTable {
    pub fn build(series: &MarketSeries, config: &EngineConfig) -> SwrResult<Self> {
        let max_duration_years = config.max_duration_years.min((series.len() / 12) as u32);
        if max_duration_years == 0 {
            return Err(SwrError::InsufficientHistory(format!(
                "need at least 12 months of data, have {}",
                series.len()
            )));
        }

        let started = Instant::now();
        let search = RateSearchConfig::from(config);
        let keys: Vec<(u32, u32)> = (1..=max_duration_years)
            .flat_map(|years| series.allocations().iter().map(move |&a| (years, a)))
            .collect();
        info!(
            keys = keys.len(),
            max_duration_years,
            allocations = ?series.allocations(),
            "building baseline rate table"
        );

        let built = keys
            .par_iter()
            .map(|&(years, allocation)| {
                build_column(series, years, allocation, search)
                    .map(|column| ((years, allocation), column))
            })
            .collect::<SwrResult<Vec<_>>>()?;
        let mut columns: HashMap<(u32, u32), BaselineColumn> = built.into_iter().collect();

        for &allocation in series.allocations() {
            let mut ceiling = u32::MAX;
            for years in 1..=max_duration_years {
                if let Some(column) = columns.get_mut(&(years, allocation)) {
                    column.rate_bp = column.rate_bp.min(ceiling);
                    ceiling = column.rate_bp;
                }
            }
        }

        info!(
            keys = columns.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "baseline rate table ready"
        );

        Ok(Self {
            origin: series.start_time(),
            months: series.len(),
            max_duration_years,
            allocations: series.allocations().to_vec(),
            columns,
        })
    }

    pub fn max_duration_years(&self) -> u32 {
        self.max_duration_years
    }

    pub fn allocations(&self) -> &[u32] {
        &self.allocations
    }

    /// Largest rate that kept the worst historical start solvent.
    pub fn rate(&self, duration_years: u32, allocation: u32) -> Option<u32> {
        self.columns
            .get(&(duration_years, allocation))
            .map(|column| column.rate_bp)
    }

    /// Per-start entry; `None` when the retirement runs past the history.
    pub fn get(
        &self,
        time: NaiveDate,
        duration_years: u32,
        allocation: u32,
    ) -> Option<BaselineEntry> {
        let index = index_from(self.origin, self.months, time)?;
        self.entry_at(index, duration_years, allocation)
    }

    pub fn entry_at(
        &self,
        index: usize,
        duration_years: u32,
        allocation: u32,
    ) -> Option<BaselineEntry> {
        self.columns
            .get(&(duration_years, allocation))?
            .entries
            .get(index)
            .copied()
    }

    pub fn entries(&self, duration_years: u32, allocation: u32) -> Option<&[BaselineEntry]> {
        self.columns
            .get(&(duration_years, allocation))
            .map(|column| column.entries.as_slice())
    }

    /// Start index that set the minimum before duration clamping.
    pub fn worst_start(&self, duration_years: u32, allocation: u32) -> Option<usize> {
        self.columns
            .get(&(duration_years, allocation))
            .map(|column| column.worst_start)
    }

    pub fn write_csv<W: Write>(&self, mut out: W) -> SwrResult<()> {
        writeln!(out, "# Baseline safe withdrawal rates")?;
        writeln!(
            out,
            "# Worst-case rate across every full historical window, in basis points."
        )?;
        writeln!(out, "duration,allocation,rate_bp")?;
        let mut keys: Vec<_> = self.columns.keys().copied().collect();
        keys.sort_unstable();
        for (years, allocation) in keys {
            let rate_bp = self.columns[&(years, allocation)].rate_bp;
            writeln!(out, "{years},{allocation},{rate_bp}")?;
        }
        Ok(())
    }
}

fn build_column(
    series: &MarketSeries,
    years: u32,
    allocation: u32,
    search: RateSearchConfig,
) -> SwrResult<BaselineColumn> {
    let months = years as usize * 12;
    let last = series.last_full_index(years).ok_or_else(|| {
        SwrError::InsufficientHistory(format!("no {years}-year window in the data"))
    })?;

    let mut entries = Vec::with_capacity(last + 1);
    let mut rate_bp = u32::MAX;
    let mut worst_start = 0;
    let mut evaluations = 0u64;
    for start in 0..=last {
        let solved = max_sustainable_rate(series, start, months, allocation, search)?;
        evaluations += u64::from(solved.evaluations);
        if solved.rate_bp < rate_bp {
            rate_bp = solved.rate_bp;
            worst_start = start;
        }
        entries.push(BaselineEntry {
            retire_time: series.time(start),
            duration_years: years,
            allocation,
            rate_bp: solved.rate_bp,
            final_balance: solved.final_balance,
        });
    }

    debug!(
        years,
        allocation,
        rate_bp,
        worst = %series.time(worst_start),
        starts = entries.len(),
        evaluations,
        "baseline column"
    );
    Ok(BaselineColumn {
        rate_bp,
        worst_start,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::simulate;
    use crate::core::fixtures;
    use crate::core::types::{Accounting, basis_points_to_percent};

    #[test]
    fn minimum_across_starts_is_the_baseline() {
        let series = fixtures::two_start_series();
        let table = BaselineRateTable::build(&series, &EngineConfig::default()).unwrap();

        assert_eq!(table.max_duration_years(), 1);
        assert_eq!(table.rate(1, 75), Some(400));
        assert_eq!(table.worst_start(1, 75), Some(1));
        assert_eq!(table.get(series.time(0), 1, 75).map(|e| e.rate_bp), Some(500));
        assert_eq!(table.get(series.time(1), 1, 75).map(|e| e.rate_bp), Some(400));
        assert_eq!(table.get(series.time(2), 1, 75), None);
        assert_eq!(table.rate(2, 75), None);
        assert_eq!(table.rate(1, 50), None);
    }

    #[test]
    fn longer_retirements_never_allow_more() {
        let series = fixtures::synthetic_series(40, Accounting::Real);
        let table = BaselineRateTable::build(&series, &fixtures::config(30)).unwrap();
        for &allocation in series.allocations() {
            for years in 2..=30 {
                let shorter = table.rate(years - 1, allocation).unwrap();
                let longer = table.rate(years, allocation).unwrap();
                assert!(longer <= shorter, "{years}y {allocation}%: {longer} > {shorter}");
            }
        }
    }

    #[test]
    fn worst_start_survives_the_baseline_rate() {
        let series = fixtures::synthetic_series(40, Accounting::Nominal);
        let table = BaselineRateTable::build(&series, &fixtures::config(25)).unwrap();
        for years in [1, 10, 25] {
            let rate = table.rate(years, 75).unwrap();
            let worst = table.worst_start(years, 75).unwrap();
            let months = years as usize * 12;
            let trajectory =
                simulate(&series, worst, worst + months, basis_points_to_percent(rate), 75, 1e6)
                    .unwrap();
            assert!(trajectory.ok);
            assert!(trajectory.records.iter().all(|r| r.end_balance > 0.0));

            // Every full window survives the table rate.
            let entries = table.entries(years, 75).unwrap();
            assert_eq!(entries.len(), series.len() - months + 1);
            assert!(entries.iter().all(|e| e.rate_bp >= rate));
        }
    }

    #[test]
    fn entries_line_up_with_calendar() {
        let series = fixtures::synthetic_series(5, Accounting::Real);
        let table = BaselineRateTable::build(&series, &fixtures::config(3)).unwrap();
        let entry = table.entry_at(7, 3, 50).unwrap();
        assert_eq!(entry.retire_time, series.time(7));
        assert_eq!(entry.duration_years, 3);
        assert_eq!(entry.allocation, 50);
        assert_eq!(table.get(series.time(7), 3, 50), Some(entry));
        assert!(entry.final_balance > 0.0);
        assert_eq!(table.entry_at(series.len() - 36 + 1, 3, 50), None);
    }

    #[test]
    fn short_history_is_rejected() {
        let series = fixtures::flat_series(11, 1.0, 1.0);
        assert!(matches!(
            BaselineRateTable::build(&series, &EngineConfig::default()),
            Err(SwrError::InsufficientHistory(_))
        ));
    }

    #[test]
    fn write_csv_lists_every_key_in_order() {
        let series = fixtures::synthetic_series(3, Accounting::Real);
        let table = BaselineRateTable::build(&series, &EngineConfig::default()).unwrap();
        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();

        assert_eq!(rows[0], "duration,allocation,rate_bp");
        assert_eq!(rows.len(), 1 + 3 * fixtures::ALLOCATIONS.len());
        assert_eq!(rows[1], format!("1,0,{}", table.rate(1, 0).unwrap()));
        assert!(rows.last().unwrap().starts_with("3,100,"));
    }
}
