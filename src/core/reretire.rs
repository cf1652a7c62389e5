use chrono::NaiveDate;
use tracing::{debug, warn};

use super::context::SwrContext;
use super::error::{SwrError, SwrResult};
use super::types::{Accounting, MonthlyRecord, fraction_to_basis_points, salary_for_rate};

/// Salary a fresh dynamic retirement would allow, capped at `cap` of the
/// balance.
pub fn capped_salary(balance: f64, rate_bp: u32, cap: f64) -> f64 {
    salary_for_rate(balance, rate_bp).min(balance * cap)
}

/// Simulate a retiree who, every month, checks whether retiring afresh with
/// the remaining years would pay more, and switches up if so.
///
/// The salary never drops in real terms. Record rates are relative to the
/// opening balance in retire-date money.
pub fn reretire(
    ctx: &SwrContext,
    retire_time: NaiveDate,
    duration_years: u32,
    lookback_years: u32,
    allocation: u32,
    opening_balance: f64,
) -> SwrResult<Vec<MonthlyRecord>> {
    let series = ctx.series();
    let retire_index = series.index_for_time(retire_time).ok_or_else(|| {
        SwrError::InvalidInput(format!("{retire_time} is not covered by the market data"))
    })?;
    if duration_years == 0 {
        return Err(SwrError::InvalidInput("duration must be at least one year".to_string()));
    }
    if !opening_balance.is_finite() || opening_balance <= 0.0 {
        return Err(SwrError::InvalidInput(format!(
            "opening balance must be positive and finite, got {opening_balance}"
        )));
    }
    let lookback_months = lookback_years as usize * 12;
    if retire_index < lookback_months {
        return Err(SwrError::InsufficientHistory(format!(
            "retiring at {retire_time} leaves less than {lookback_years} years of lookback"
        )));
    }

    let retire_time = series.time(retire_index);
    let total_months = duration_years as usize * 12;
    let end_index = (retire_index + total_months).min(series.len());
    let salary_cap = ctx.config().salary_cap;

    let mut baseline_salary =
        salary_for_rate(opening_balance, ctx.baseline_rate(duration_years, allocation)?);
    let mut crystal_salary = ctx
        .baseline()
        .entry_at(retire_index, duration_years, allocation)
        .map(|entry| salary_for_rate(opening_balance, entry.rate_bp));

    let mut balance = opening_balance;
    let mut salary = 0.0;
    let mut virtual_months = 0u32;
    let mut depleted = false;
    let mut records = Vec::with_capacity(end_index - retire_index);

    for index in retire_index..end_index {
        let now = series.time(index);
        let elapsed = index - retire_index;
        let years_left = (total_months - elapsed).div_ceil(12) as u32;

        let entry = ctx
            .dynamic_entry(now, years_left, lookback_years, allocation)?
            .ok_or_else(|| {
                SwrError::InvariantViolation(format!(
                    "no dynamic entry for {now} ({years_left} years left)"
                ))
            })?;
        let candidate = capped_salary(balance, entry.rate_bp, salary_cap);
        if candidate > salary {
            salary = candidate;
            virtual_months = entry.virtual_retirement_months;
        } else {
            virtual_months += 1;
        }
        let monthly_income = salary / 12.0;

        let retire_date_salary = match series.accounting() {
            Accounting::Real => salary,
            Accounting::Nominal => salary / series.inflation_between(retire_index, index),
        };

        let start_balance = balance;
        let remaining = balance - monthly_income;
        if remaining <= 0.0 {
            warn!(
                retire = %retire_time,
                at = %now,
                monthly_income,
                start_balance,
                "re-retiree ran out of money"
            );
            depleted = true;
        }
        balance = remaining.max(0.0) * series.growth(index, allocation)?;

        records.push(MonthlyRecord {
            retire_time,
            current_time: now,
            index,
            retirement_month: elapsed as u32 + 1,
            monthly_income,
            start_balance,
            end_balance: balance,
            rate_bp: fraction_to_basis_points(retire_date_salary / opening_balance),
            virtual_retirement_months: virtual_months,
            baseline_salary,
            dynamic_salary: salary,
            crystal_salary,
            final_balance: None,
        });

        if series.accounting() == Accounting::Nominal {
            let k = series.inflation(index);
            salary *= k;
            baseline_salary *= k;
            crystal_salary = crystal_salary.map(|c| c * k);
        }
        if depleted {
            break;
        }
    }

    if depleted {
        for record in &mut records {
            record.final_balance = Some(0.0);
        }
    } else if records.len() == total_months {
        let without_reretire = ctx
            .dynamic_entry(retire_time, duration_years, lookback_years, allocation)?
            .and_then(|entry| entry.final_balance);
        for (i, record) in records.iter_mut().enumerate() {
            record.final_balance = if i == 0 { without_reretire } else { Some(balance) };
        }
    }

    debug!(
        retire = %retire_time,
        duration_years,
        lookback_years,
        allocation,
        months = records.len(),
        final_balance = balance,
        "re-retire trajectory"
    );
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures;
    use std::sync::OnceLock;

    fn real_context() -> &'static SwrContext {
        static CONTEXT: OnceLock<SwrContext> = OnceLock::new();
        CONTEXT.get_or_init(|| {
            fixtures::context(fixtures::synthetic_series_for(20, Accounting::Real, &[75]), 20)
        })
    }

    #[test]
    fn salary_cap_applies_to_generous_rates() {
        assert_eq!(capped_salary(1_000_000.0, 2_500, 0.20), 200_000.0);
        assert_eq!(capped_salary(1_000_000.0, 450, 0.20), 45_000.0);
    }

    #[test]
    fn real_salary_never_decreases() {
        let ctx = real_context();
        for retire_index in [24, 61, 100] {
            let records = reretire(ctx, ctx.series().time(retire_index), 8, 2, 75, 1e6).unwrap();
            assert_eq!(records.len(), 96);
            for pair in records.windows(2) {
                assert!(pair[1].dynamic_salary >= pair[0].dynamic_salary);
                assert!(pair[1].rate_bp >= pair[0].rate_bp);
                assert_eq!(pair[1].baseline_salary, pair[0].baseline_salary);
            }
        }
    }

    #[test]
    fn adopted_salaries_respect_the_cap() {
        let ctx = real_context();
        let cap = ctx.config().salary_cap;
        let records = reretire(ctx, ctx.series().time(30), 10, 1, 75, 1e6).unwrap();
        let mut previous = 0.0;
        for record in &records {
            if record.dynamic_salary > previous {
                assert!(record.percent() <= cap * 100.0 + 1e-9);
            }
            previous = record.dynamic_salary;
            assert!(record.end_balance > 0.0);
        }
    }

    #[test]
    fn first_month_matches_a_fresh_dynamic_retirement() {
        let ctx = real_context();
        let time = ctx.series().time(48);
        let entry = ctx.dynamic_entry(time, 6, 2, 75).unwrap().unwrap();
        let records = reretire(ctx, time, 6, 2, 75, 1e6).unwrap();

        // The default cap of 20% is 2,000 bp.
        assert_eq!(records[0].rate_bp, entry.rate_bp.min(2_000));
        assert_eq!(records[0].virtual_retirement_months, entry.virtual_retirement_months);
        assert_eq!(records[0].final_balance, entry.final_balance);
        let last = records.last().unwrap();
        assert_eq!(records[1].final_balance, Some(last.end_balance));
        assert_eq!(last.final_balance, Some(last.end_balance));
    }

    #[test]
    fn nominal_rates_are_deflated_to_retire_date() {
        let ctx = fixtures::short_context();
        let records = reretire(ctx, ctx.series().time(36), 5, 2, 50, 1e6).unwrap();
        for pair in records.windows(2) {
            assert!(pair[1].rate_bp >= pair[0].rate_bp);
            let k = ctx.series().inflation(pair[0].index);
            assert!((pair[1].baseline_salary - pair[0].baseline_salary * k).abs() < 1e-6);
        }
    }

    #[test]
    fn truncated_retirement_has_no_final_balance() {
        let ctx = real_context();
        let retire_index = ctx.series().len() - 20;
        let records = reretire(ctx, ctx.series().time(retire_index), 5, 1, 75, 1e6).unwrap();
        assert_eq!(records.len(), 20);
        assert!(records.iter().all(|r| r.final_balance.is_none()));
        assert!(records.iter().all(|r| r.crystal_salary.is_none()));
    }

    #[test]
    fn late_crash_ends_with_a_recorded_balance() {
        let ctx = fixtures::late_crash_context();
        for retire_index in [290, 298, 310] {
            let records = reretire(ctx, ctx.series().time(retire_index), 5, 3, 75, 1e6).unwrap();
            let last = records.last().unwrap();
            assert!(records.iter().all(|r| r.end_balance >= 0.0));
            if last.end_balance == 0.0 {
                assert!(records.iter().all(|r| r.final_balance == Some(0.0)));
            } else if retire_index + 60 <= ctx.series().len() {
                assert_eq!(records.len(), 60);
                assert_eq!(last.final_balance, Some(last.end_balance));
            } else {
                assert_eq!(records.len(), ctx.series().len() - retire_index);
                assert_eq!(last.final_balance, None);
            }
        }
    }

    #[test]
    fn rejects_unknown_dates_and_short_lookback() {
        let ctx = real_context();
        let before = fixtures::start_date().pred_opt().unwrap();
        assert!(matches!(
            reretire(ctx, before, 5, 1, 75, 1e6),
            Err(SwrError::InvalidInput(_))
        ));
        assert!(matches!(
            reretire(ctx, ctx.series().time(11), 5, 1, 75, 1e6),
            Err(SwrError::InsufficientHistory(_))
        ));
        assert!(matches!(
            reretire(ctx, ctx.series().time(12), 5, 1, 75, -1.0),
            Err(SwrError::InvalidInput(_))
        ));
    }
}
