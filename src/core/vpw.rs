use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use super::context::SwrContext;
use super::engine::simulate;
use super::error::{SwrError, SwrResult};
use super::reretire::reretire;
use super::series::MarketSeries;
use super::types::{Accounting, MonthlyRecord, basis_points_to_percent, salary_for_rate};

/// Variable percentage withdrawal rates for a 75/25 portfolio retiring at 65
/// with no pension, one per year through age 99.
pub const VPW_STOCK75_AGE65: [u32; 35] = [
    530, 540, 540, 550, 560, 570, 580, 590, 600, 620, 630, 640, 660, 680, 700, 720, 740, 770, 800,
    840, 880, 920, 970, 1_040, 1_110, 1_200, 1_300, 1_440, 1_610, 1_840, 2_170, 2_660, 3_470,
    5_100, 10_000,
];

/// The same retirement under a fixed baseline rate, re-retiring, and a VPW
/// schedule.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathComparison {
    pub retire_time: NaiveDate,
    pub duration_years: u32,
    pub baseline_bp: u32,
    pub baseline: Vec<MonthlyRecord>,
    pub dmswr: Vec<MonthlyRecord>,
    pub vpw: Vec<MonthlyRecord>,
}

/// One record per year: withdraw `schedule[year]` of the balance, then apply
/// the year's growth. Incomes are reported in retire-date money.
pub fn vpw_trajectory(
    series: &MarketSeries,
    retire_index: usize,
    schedule: &[u32],
    allocation: u32,
    opening_balance: f64,
) -> SwrResult<Vec<MonthlyRecord>> {
    if schedule.is_empty() {
        return Err(SwrError::InvalidInput("withdrawal schedule is empty".to_string()));
    }
    if let Some(rate_bp) = schedule.iter().find(|&&rate_bp| rate_bp > 10_000) {
        return Err(SwrError::InvalidInput(format!(
            "scheduled rate {rate_bp} bp withdraws more than the balance"
        )));
    }
    if !opening_balance.is_finite() || opening_balance <= 0.0 {
        return Err(SwrError::InvalidInput(format!(
            "opening balance must be positive and finite, got {opening_balance}"
        )));
    }
    if retire_index >= series.len() {
        return Err(SwrError::InvalidInput(format!(
            "retirement index {retire_index} is past the {} months of data",
            series.len()
        )));
    }
    let end_index = retire_index + schedule.len() * 12;
    if end_index > series.len() {
        return Err(SwrError::InsufficientHistory(format!(
            "a {}-year schedule from {} runs past the data",
            schedule.len(),
            series.time(retire_index)
        )));
    }

    let retire_time = series.time(retire_index);
    let mut balance = opening_balance;
    let mut records = Vec::with_capacity(schedule.len());
    for (year, &rate_bp) in schedule.iter().enumerate() {
        let current = retire_index + year * 12;
        let income = salary_for_rate(balance, rate_bp);
        let retire_date_income = match series.accounting() {
            Accounting::Real => income,
            Accounting::Nominal => income / series.inflation_between(retire_index, current),
        };
        let start_balance = balance;
        balance = (balance - income) * series.growth_between(current, current + 12, allocation)?;

        records.push(MonthlyRecord {
            retire_time,
            current_time: series.time(current),
            index: current,
            retirement_month: year as u32 * 12 + 1,
            monthly_income: retire_date_income / 12.0,
            start_balance,
            end_balance: balance,
            rate_bp,
            virtual_retirement_months: 0,
            baseline_salary: retire_date_income,
            dynamic_salary: retire_date_income,
            crystal_salary: None,
            final_balance: None,
        });
    }
    for record in &mut records {
        record.final_balance = Some(balance);
    }
    Ok(records)
}

/// Run all three strategies from `retire_time` for as many years as the
/// schedule has rates.
pub fn compare_paths(
    ctx: &SwrContext,
    retire_time: NaiveDate,
    lookback_years: u32,
    allocation: u32,
    opening_balance: f64,
    schedule: &[u32],
) -> SwrResult<PathComparison> {
    let series = ctx.series();
    let retire_index = series.index_for_time(retire_time).ok_or_else(|| {
        SwrError::InvalidInput(format!("{retire_time} is not covered by the market data"))
    })?;
    let duration_years = schedule.len() as u32;
    let baseline_bp = ctx.baseline_rate(duration_years, allocation)?;

    let vpw = vpw_trajectory(series, retire_index, schedule, allocation, opening_balance)?;
    let baseline = simulate(
        series,
        retire_index,
        retire_index + duration_years as usize * 12,
        basis_points_to_percent(baseline_bp),
        allocation,
        opening_balance,
    )?
    .records;
    let dmswr = reretire(
        ctx,
        retire_time,
        duration_years,
        lookback_years,
        allocation,
        opening_balance,
    )?;

    debug!(
        retire = %series.time(retire_index),
        duration_years,
        baseline_final = ?baseline.last().and_then(|r| r.final_balance),
        dmswr_final = ?dmswr.last().and_then(|r| r.final_balance),
        vpw_final = ?vpw.last().and_then(|r| r.final_balance),
        "compared withdrawal paths"
    );
    Ok(PathComparison {
        retire_time: series.time(retire_index),
        duration_years,
        baseline_bp,
        baseline,
        dmswr,
        vpw,
    })
}
