use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

use super::context::SwrContext;
use super::dynamic::{DynamicKey, DynamicSeries};
use super::engine::{rate_at_month, run_withdrawals};
use super::error::{SwrError, SwrResult, ensure_invariant};
use super::series::MarketSeries;
use super::types::{
    DynamicEntry, MonthlyRecord, NestEggPolicy, basis_points_to_percent, salary_for_rate,
    years_covering,
};

pub fn find_dynamic_rates(
    ctx: &SwrContext,
    start_index: usize,
    end_index: usize,
    duration_years: u32,
    lookback_years: u32,
    allocation: u32,
    nest_egg: NestEggPolicy,
) -> SwrResult<Vec<MonthlyRecord>> {
    let series = ctx.series();
    if !series.supports(allocation) {
        return Err(SwrError::UnsupportedAllocation(allocation));
    }
    if duration_years == 0 {
        return Err(SwrError::InvalidInput("duration must be at least one year".to_string()));
    }
    if start_index > end_index || end_index >= series.len() {
        return Err(SwrError::InvalidInput(format!(
            "retirement range {start_index}..={end_index} is not within the {} months of data",
            series.len()
        )));
    }
    let lookback_months = lookback_years as usize * 12;
    if start_index < lookback_months {
        return Err(SwrError::InsufficientHistory(format!(
            "a {lookback_years}-year lookback needs retirements from index {lookback_months}, got {start_index}"
        )));
    }
    validate_nest_egg(nest_egg)?;
    let baseline_bp = ctx.baseline_rate(duration_years, allocation)?;

    debug!(
        start = %series.time(start_index),
        end = %series.time(end_index),
        duration_years,
        lookback_years,
        allocation,
        baseline_bp,
        "finding dynamic rates"
    );

    (start_index..=end_index)
        .into_par_iter()
        .map(|retire_index| {
            dynamic_retirement(
                ctx,
                start_index,
                retire_index,
                duration_years,
                lookback_years,
                allocation,
                baseline_bp,
                nest_egg,
            )
        })
        .collect()
}

/// Rate a virtual retiree who started `offset_months` before `retire_index`
/// is withdrawing at `retire_index`, or `None` if they went broke first.
pub fn implied_rate_at_offset(
    ctx: &SwrContext,
    retire_index: usize,
    duration_years: u32,
    offset_months: usize,
    allocation: u32,
) -> SwrResult<Option<u32>> {
    let Some(virtual_start) = retire_index.checked_sub(offset_months) else {
        return Err(SwrError::InsufficientHistory(format!(
            "no data {offset_months} months before index {retire_index}"
        )));
    };
    let virtual_years = duration_years + years_covering(offset_months as u32);
    let virtual_bp = ctx.baseline_rate(virtual_years, allocation)?;
    rate_at_month(
        ctx.series(),
        virtual_start,
        retire_index,
        basis_points_to_percent(virtual_bp),
        allocation,
        ctx.config().normalized_balance,
    )
}

#[allow(clippy::too_many_arguments)]
fn dynamic_retirement(
    ctx: &SwrContext,
    first_index: usize,
    retire_index: usize,
    duration_years: u32,
    lookback_years: u32,
    allocation: u32,
    baseline_bp: u32,
    nest_egg: NestEggPolicy,
) -> SwrResult<MonthlyRecord> {
    let series = ctx.series();
    let (dynamic_bp, offset) = best_virtual_retirement(
        ctx,
        retire_index,
        duration_years,
        lookback_years,
        allocation,
        baseline_bp,
    )?;

    let balance = nest_egg_at(nest_egg, series, first_index, retire_index, allocation)?;
    let months = duration_years as usize * 12;
    let outcome = run_withdrawals(
        series,
        retire_index,
        retire_index + months,
        basis_points_to_percent(dynamic_bp),
        allocation,
        balance,
        None,
    )?;
    // Only virtual windows that fit in the data are covered by the baseline
    // table, so near the end the chosen rate can still run dry.
    let final_balance = if outcome.ok {
        ensure_invariant!(
            outcome.partial || outcome.months == months,
            "full {duration_years}-year run produced {} months",
            outcome.months
        );
        (!outcome.partial).then_some(outcome.balance)
    } else {
        warn!(
            retire = %series.time(retire_index),
            dynamic_bp,
            offset,
            months = outcome.months,
            "dynamic retiree ran out of money"
        );
        Some(0.0)
    };

    let dynamic_salary = salary_for_rate(balance, dynamic_bp);
    let monthly_income = dynamic_salary / 12.0;
    let crystal_salary = ctx
        .baseline()
        .entry_at(retire_index, duration_years, allocation)
        .map(|entry| salary_for_rate(balance, entry.rate_bp));
    let retire_time = series.time(retire_index);

    Ok(MonthlyRecord {
        retire_time,
        current_time: retire_time,
        index: retire_index,
        retirement_month: 1,
        monthly_income,
        start_balance: balance,
        end_balance: (balance - monthly_income) * series.growth(retire_index, allocation)?,
        rate_bp: dynamic_bp,
        virtual_retirement_months: offset as u32,
        baseline_salary: salary_for_rate(balance, baseline_bp),
        dynamic_salary,
        crystal_salary,
        final_balance,
    })
}

// Ties go to the smallest offset.
fn best_virtual_retirement(
    ctx: &SwrContext,
    retire_index: usize,
    duration_years: u32,
    lookback_years: u32,
    allocation: u32,
    baseline_bp: u32,
) -> SwrResult<(u32, usize)> {
    let mut best: Option<(u32, usize)> = None;
    for offset in 0..=lookback_years as usize * 12 {
        let implied =
            implied_rate_at_offset(ctx, retire_index, duration_years, offset, allocation)?;
        let Some(implied_bp) = implied else {
            trace!(retire_index, offset, "virtual retiree depleted before retirement date");
            continue;
        };
        if offset == 0 {
            ensure_invariant!(
                implied_bp == baseline_bp,
                "retiring now implies {implied_bp} bp, baseline is {baseline_bp} bp"
            );
        }
        if best.is_none_or(|(rate, _)| implied_bp > rate) {
            best = Some((implied_bp, offset));
        }
    }

    let Some((rate_bp, offset)) = best else {
        return Err(SwrError::InvariantViolation(format!(
            "no virtual retirement survived to index {retire_index}"
        )));
    };
    ensure_invariant!(
        rate_bp >= baseline_bp,
        "dynamic rate {rate_bp} bp is below baseline {baseline_bp} bp"
    );
    Ok((rate_bp, offset))
}

fn validate_nest_egg(policy: NestEggPolicy) -> SwrResult<()> {
    let amount = match policy {
        NestEggPolicy::Constant { amount } => amount,
        NestEggPolicy::MarketGrowth { initial } => initial,
    };
    if !amount.is_finite() || amount <= 0.0 {
        return Err(SwrError::InvalidInput(format!(
            "nest egg must be positive and finite, got {amount}"
        )));
    }
    Ok(())
}

fn nest_egg_at(
    policy: NestEggPolicy,
    series: &MarketSeries,
    first_index: usize,
    retire_index: usize,
    allocation: u32,
) -> SwrResult<f64> {
    match policy {
        NestEggPolicy::Constant { amount } => Ok(amount),
        NestEggPolicy::MarketGrowth { initial } => {
            Ok(initial * series.growth_between(first_index, retire_index, allocation)?)
        }
    }
}

/// Compute the cached series for `key`: every retirement from the first
/// month with a full lookback window to the end of the data.
pub(crate) fn populate_dynamic_series(
    ctx: &SwrContext,
    key: DynamicKey,
) -> SwrResult<DynamicSeries> {
    let len = ctx.series().len();
    let first_index = key.lookback_years as usize * 12;
    if first_index >= len {
        return Err(SwrError::InsufficientHistory(format!(
            "{}-year lookback leaves no retirement dates in {len} months",
            key.lookback_years
        )));
    }

    let started = Instant::now();
    let records = find_dynamic_rates(
        ctx,
        first_index,
        len - 1,
        key.duration_years,
        key.lookback_years,
        key.allocation,
        NestEggPolicy::Constant {
            amount: ctx.config().normalized_balance,
        },
    )?;
    let entries: Vec<DynamicEntry> = records
        .iter()
        .map(|record| DynamicEntry {
            retire_time: record.retire_time,
            duration_years: key.duration_years,
            lookback_years: key.lookback_years,
            allocation: key.allocation,
            rate_bp: record.rate_bp,
            virtual_retirement_months: record.virtual_retirement_months,
            final_balance: record.final_balance,
        })
        .collect();

    info!(
        duration_years = key.duration_years,
        lookback_years = key.lookback_years,
        allocation = key.allocation,
        entries = entries.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "dynamic rate series computed"
    );
    Ok(DynamicSeries::new(key, first_index, entries))
}
