use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{Datelike, Months, NaiveDate};
use tracing::info;

use super::error::{SwrError, SwrResult};
use super::types::Accounting;

#[derive(Debug, Clone)]
pub struct MarketSeries {
    start: NaiveDate,
    accounting: Accounting,
    allocations: Vec<u32>,
    /// `growth[k][i]` is the factor for `allocations[k]` during month `i`.
    growth: Vec<Vec<f64>>,
    inflation: Vec<f64>,
}

impl MarketSeries {
    pub fn new(
        start: NaiveDate,
        accounting: Accounting,
        allocations: Vec<u32>,
        nominal_growth: Vec<Vec<f64>>,
        inflation: Vec<f64>,
    ) -> SwrResult<Self> {
        if inflation.is_empty() {
            return Err(SwrError::Data("market series has no months".to_string()));
        }
        if allocations.is_empty() {
            return Err(SwrError::Data("market series has no allocations".to_string()));
        }
        if allocations.len() != nominal_growth.len() {
            return Err(SwrError::Data(format!(
                "expected {} growth columns, found {}",
                allocations.len(),
                nominal_growth.len()
            )));
        }
        for (pos, &allocation) in allocations.iter().enumerate() {
            if allocation > 100 {
                return Err(SwrError::Data(format!(
                    "allocation {allocation} is outside 0..=100"
                )));
            }
            if allocations[..pos].contains(&allocation) {
                return Err(SwrError::Data(format!("duplicate allocation {allocation}")));
            }
        }
        for (i, &k) in inflation.iter().enumerate() {
            if !k.is_finite() || k <= 0.0 {
                return Err(SwrError::Data(format!(
                    "inflation factor at month {i} must be positive and finite, got {k}"
                )));
            }
        }

        let start = first_of_month(start);
        let mut growth = Vec::with_capacity(nominal_growth.len());
        for (column, &allocation) in nominal_growth.into_iter().zip(&allocations) {
            if column.len() != inflation.len() {
                return Err(SwrError::Data(format!(
                    "allocation {allocation} has {} months, inflation has {}",
                    column.len(),
                    inflation.len()
                )));
            }
            let mut adjusted = Vec::with_capacity(column.len());
            for (i, (factor, k)) in column.into_iter().zip(&inflation).enumerate() {
                if !factor.is_finite() || factor <= 0.0 {
                    return Err(SwrError::Data(format!(
                        "growth factor for allocation {allocation} at month {i} must be positive and finite, got {factor}"
                    )));
                }
                adjusted.push(match accounting {
                    Accounting::Real => factor / k,
                    Accounting::Nominal => factor,
                });
            }
            growth.push(adjusted);
        }

        Ok(Self {
            start,
            accounting,
            allocations,
            growth,
            inflation,
        })
    }

    // Rebalanced every month.
    pub fn from_asset_returns(
        start: NaiveDate,
        accounting: Accounting,
        allocations: Vec<u32>,
        stock: &[f64],
        bond: &[f64],
        inflation: Vec<f64>,
    ) -> SwrResult<Self> {
        if stock.len() != inflation.len() || bond.len() != inflation.len() {
            return Err(SwrError::Data(format!(
                "asset series lengths differ: stock {}, bond {}, inflation {}",
                stock.len(),
                bond.len(),
                inflation.len()
            )));
        }
        let growth = allocations
            .iter()
            .map(|&allocation| {
                let w = allocation.min(100) as f64 / 100.0;
                stock
                    .iter()
                    .zip(bond)
                    .map(|(s, b)| w * s + (1.0 - w) * b)
                    .collect::<Vec<_>>()
            })
            .collect();
        Self::new(start, accounting, allocations, growth, inflation)
    }

    pub fn load_csv(path: impl AsRef<Path>, accounting: Accounting) -> SwrResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| SwrError::Io(format!("can't read {}: {e}", path.display())))?;
        let series = Self::parse_csv(&contents, accounting)?;
        info!(
            path = %path.display(),
            months = series.len(),
            allocations = ?series.allocations,
            first = %series.start,
            "loaded market series"
        );
        Ok(series)
    }

    // Header `date,<allocation>...,inflation`, then one `YYYY-MM` row per month
    // of nominal factors. Lines starting with '#' are skipped.
    pub fn parse_csv(contents: &str, accounting: Accounting) -> SwrResult<Self> {
        let mut allocations: Option<Vec<u32>> = None;
        let mut start: Option<NaiveDate> = None;
        let mut previous: Option<NaiveDate> = None;
        let mut growth: Vec<Vec<f64>> = Vec::new();
        let mut inflation = Vec::new();

        for (line_no, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();

            let Some(columns) = allocations.as_ref() else {
                if !fields[0].eq_ignore_ascii_case("date")
                    || fields.len() < 3
                    || !fields[fields.len() - 1].eq_ignore_ascii_case("inflation")
                {
                    return Err(SwrError::Data(format!(
                        "line {}: expected header `date,<allocation>...,inflation`",
                        line_no + 1
                    )));
                }
                let parsed = fields[1..fields.len() - 1]
                    .iter()
                    .map(|f| {
                        f.trim_end_matches('%').parse::<u32>().map_err(|_| {
                            SwrError::Data(format!(
                                "line {}: bad allocation column `{f}`",
                                line_no + 1
                            ))
                        })
                    })
                    .collect::<SwrResult<Vec<_>>>()?;
                growth = vec![Vec::new(); parsed.len()];
                allocations = Some(parsed);
                continue;
            };

            if fields.len() != columns.len() + 2 {
                return Err(SwrError::Data(format!(
                    "line {}: expected {} fields, found {}",
                    line_no + 1,
                    columns.len() + 2,
                    fields.len()
                )));
            }
            let date = parse_month(fields[0]).ok_or_else(|| {
                SwrError::Data(format!("line {}: bad date `{}`", line_no + 1, fields[0]))
            })?;
            if let Some(prev) = previous {
                if next_month(prev) != Some(date) {
                    return Err(SwrError::Data(format!(
                        "line {}: {date} does not follow {prev}",
                        line_no + 1
                    )));
                }
            }
            previous = Some(date);
            start.get_or_insert(date);

            for (column, field) in growth.iter_mut().zip(&fields[1..fields.len() - 1]) {
                column.push(parse_factor(field, line_no)?);
            }
            inflation.push(parse_factor(fields[fields.len() - 1], line_no)?);
        }

        let (Some(allocations), Some(start)) = (allocations, start) else {
            return Err(SwrError::Data("no market data rows found".to_string()));
        };
        Self::new(start, accounting, allocations, growth, inflation)
    }

    pub fn write_csv<W: Write>(&self, mut out: W) -> SwrResult<()> {
        writeln!(out, "# Monthly total returns (nominal)")?;
        writeln!(
            out,
            "# Each column gives the monthly growth factor (1.04 => 4%) for a stock/bond allocation."
        )?;
        write!(out, "date")?;
        for allocation in &self.allocations {
            write!(out, ",{allocation}")?;
        }
        writeln!(out, ",inflation")?;
        for i in 0..self.len() {
            write!(out, "{}", self.time(i).format("%Y-%m"))?;
            for column in &self.growth {
                let factor = match self.accounting {
                    Accounting::Real => column[i] * self.inflation[i],
                    Accounting::Nominal => column[i],
                };
                write!(out, ",{factor}")?;
            }
            writeln!(out, ",{}", self.inflation[i])?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inflation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflation.is_empty()
    }

    pub fn accounting(&self) -> Accounting {
        self.accounting
    }

    pub fn allocations(&self) -> &[u32] {
        &self.allocations
    }

    pub fn supports(&self, allocation: u32) -> bool {
        self.allocations.contains(&allocation)
    }

    pub fn start_time(&self) -> NaiveDate {
        self.start
    }

    /// Calendar month of `index`. Indices past the end extrapolate the calendar.
    pub fn time(&self, index: usize) -> NaiveDate {
        self.start
            .checked_add_months(Months::new(index as u32))
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn index_for_time(&self, date: NaiveDate) -> Option<usize> {
        index_from(self.start, self.len(), date)
    }

    /// Last start index whose `years`-long retirement lies fully within the data.
    pub fn last_full_index(&self, years: u32) -> Option<usize> {
        let months = years as usize * 12;
        self.len().checked_sub(months)
    }

    pub fn growth(&self, index: usize, allocation: u32) -> SwrResult<f64> {
        self.column(allocation)?.get(index).copied().ok_or_else(|| {
            SwrError::InvalidInput(format!(
                "month {index} is past the {} months of data",
                self.len()
            ))
        })
    }

    /// Cumulative growth over months `[from, to)`, clipped to the data.
    pub fn growth_between(&self, from: usize, to: usize, allocation: u32) -> SwrResult<f64> {
        if from > to {
            return Err(SwrError::InvalidInput(format!(
                "growth range {from}..{to} runs backwards"
            )));
        }
        let column = self.column(allocation)?;
        let (from, to) = clip(from, to, column.len());
        Ok(column[from..to].iter().product())
    }

    pub(crate) fn inflation(&self, index: usize) -> f64 {
        self.inflation[index]
    }

    // Clipped like `growth_between`; an empty range yields 1.
    pub(crate) fn inflation_between(&self, from: usize, to: usize) -> f64 {
        let (from, to) = clip(from, to, self.len());
        self.inflation[from..to].iter().product()
    }

    pub(crate) fn column(&self, allocation: u32) -> SwrResult<&[f64]> {
        self.allocations
            .iter()
            .position(|&a| a == allocation)
            .map(|k| self.growth[k].as_slice())
            .ok_or(SwrError::UnsupportedAllocation(allocation))
    }
}

/// Signed number of calendar months from `from` to `to`, ignoring days.
pub fn month_offset(from: NaiveDate, to: NaiveDate) -> i64 {
    (to.year() - from.year()) as i64 * 12 + to.month() as i64 - from.month() as i64
}

pub(crate) fn index_from(origin: NaiveDate, len: usize, date: NaiveDate) -> Option<usize> {
    let months = month_offset(origin, date);
    if months < 0 || months as usize >= len {
        return None;
    }
    Some(months as usize)
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn clip(from: usize, to: usize, len: usize) -> (usize, usize) {
    let to = to.min(len);
    (from.min(to), to)
}

fn next_month(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_add_months(Months::new(1))
}

/// Parse `YYYY-MM` or `YYYY-MM-DD` into the first day of that month.
pub fn parse_month(s: &str) -> Option<NaiveDate> {
    let mut parts = s.trim().split('-');
    let year = parts.next()?.parse::<i32>().ok()?;
    let month = parts.next()?.parse::<u32>().ok()?;
    if let Some(day) = parts.next() {
        day.parse::<u32>().ok()?;
    }
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn parse_factor(field: &str, line_no: usize) -> SwrResult<f64> {
    field
        .parse::<f64>()
        .map_err(|_| SwrError::Data(format!("line {}: bad factor `{field}`", line_no + 1)))
}
