use super::error::{SwrError, SwrResult};
use super::series::MarketSeries;
use super::types::{Accounting, MonthlyRecord, Trajectory, fraction_to_basis_points};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RunOutcome {
    pub ok: bool,
    pub partial: bool,
    pub months: usize,
    pub balance: f64,
}

#[derive(Debug, Clone, Copy)]
struct MonthStep {
    index: usize,
    salary: f64,
    monthly_income: f64,
    start_balance: f64,
    end_balance: f64,
    solvent: bool,
}

impl MonthStep {
    fn rate_bp(&self) -> u32 {
        fraction_to_basis_points(self.monthly_income * 12.0 / self.start_balance)
    }
}

struct Withdrawals<'a> {
    series: &'a MarketSeries,
    column: &'a [f64],
    base_salary: f64,
    balance: f64,
    price_index: f64,
    index: usize,
}

impl<'a> Withdrawals<'a> {
    fn begin(
        series: &'a MarketSeries,
        start_index: usize,
        annual_rate_pct: f64,
        allocation: u32,
        opening_balance: f64,
    ) -> SwrResult<Self> {
        let column = series.column(allocation)?;
        if start_index >= series.len() {
            return Err(SwrError::InvalidInput(format!(
                "start index {start_index} is past the end of the series ({} months)",
                series.len()
            )));
        }
        if !annual_rate_pct.is_finite() || annual_rate_pct < 0.0 {
            return Err(SwrError::InvalidInput(format!(
                "annual rate must be finite and >= 0, got {annual_rate_pct}"
            )));
        }
        if !opening_balance.is_finite() || opening_balance <= 0.0 {
            return Err(SwrError::InvalidInput(format!(
                "opening balance must be finite and > 0, got {opening_balance}"
            )));
        }
        Ok(Self {
            series,
            column,
            base_salary: opening_balance * annual_rate_pct / 100.0,
            balance: opening_balance,
            price_index: 1.0,
            index: start_index,
        })
    }

    // Withdraw at the start of the month, then apply the month's growth.
    fn step(&mut self) -> SwrResult<MonthStep> {
        let salary = match self.series.accounting() {
            Accounting::Real => self.base_salary,
            Accounting::Nominal => self.base_salary * self.price_index,
        };
        let monthly_income = salary / 12.0;
        let start_balance = self.balance;
        let remaining = start_balance - monthly_income;
        let solvent = remaining > 0.0;
        let end_balance = if solvent {
            remaining * self.column[self.index]
        } else {
            0.0
        };
        if !end_balance.is_finite() {
            return Err(SwrError::NumericDomain(format!(
                "balance became {end_balance} at index {}",
                self.index
            )));
        }

        let step = MonthStep {
            index: self.index,
            salary,
            monthly_income,
            start_balance,
            end_balance,
            solvent,
        };
        self.balance = end_balance;
        self.price_index *= self.series.inflation(self.index);
        self.index += 1;
        Ok(step)
    }
}

// Stops at the first withdrawal that does not leave a positive balance.
pub fn simulate(
    series: &MarketSeries,
    start_index: usize,
    end_index: usize,
    annual_rate_pct: f64,
    allocation: u32,
    opening_balance: f64,
) -> SwrResult<Trajectory> {
    let capacity = end_index.min(series.len()).saturating_sub(start_index);
    let mut records = Vec::with_capacity(capacity);
    let outcome = run_withdrawals(
        series,
        start_index,
        end_index,
        annual_rate_pct,
        allocation,
        opening_balance,
        Some(&mut records),
    )?;

    let final_balance = if !outcome.ok {
        Some(0.0)
    } else if outcome.partial {
        None
    } else {
        Some(outcome.balance)
    };
    for record in &mut records {
        record.final_balance = final_balance;
    }

    Ok(Trajectory {
        records,
        ok: outcome.ok,
        partial: outcome.partial,
        final_balance,
    })
}

pub(crate) fn run_withdrawals(
    series: &MarketSeries,
    start_index: usize,
    end_index: usize,
    annual_rate_pct: f64,
    allocation: u32,
    opening_balance: f64,
    mut trace: Option<&mut Vec<MonthlyRecord>>,
) -> SwrResult<RunOutcome> {
    if end_index <= start_index {
        return Err(SwrError::InvalidInput(format!(
            "end index {end_index} must be after start index {start_index}"
        )));
    }
    let mut walk = Withdrawals::begin(
        series,
        start_index,
        annual_rate_pct,
        allocation,
        opening_balance,
    )?;
    let stop = end_index.min(series.len());
    let partial = end_index > series.len();
    let retire_time = series.time(start_index);

    for _ in start_index..stop {
        let step = walk.step()?;
        if let Some(rows) = trace.as_deref_mut() {
            rows.push(MonthlyRecord {
                retire_time,
                current_time: series.time(step.index),
                index: step.index,
                retirement_month: (step.index - start_index + 1) as u32,
                monthly_income: step.monthly_income,
                start_balance: step.start_balance,
                end_balance: step.end_balance,
                rate_bp: step.rate_bp(),
                virtual_retirement_months: 0,
                baseline_salary: step.salary,
                dynamic_salary: step.salary,
                crystal_salary: None,
                final_balance: None,
            });
        }
        if !step.solvent {
            return Ok(RunOutcome {
                ok: false,
                partial,
                months: step.index - start_index + 1,
                balance: 0.0,
            });
        }
    }

    Ok(RunOutcome {
        ok: true,
        partial,
        months: stop - start_index,
        balance: walk.balance,
    })
}

// None when the retiree ran out of money before `at_index`.
pub(crate) fn rate_at_month(
    series: &MarketSeries,
    start_index: usize,
    at_index: usize,
    annual_rate_pct: f64,
    allocation: u32,
    opening_balance: f64,
) -> SwrResult<Option<u32>> {
    if at_index < start_index || at_index >= series.len() {
        return Err(SwrError::InvalidInput(format!(
            "month {at_index} is not within [{start_index}, {})",
            series.len()
        )));
    }
    let mut walk = Withdrawals::begin(
        series,
        start_index,
        annual_rate_pct,
        allocation,
        opening_balance,
    )?;
    loop {
        let step = walk.step()?;
        if !step.solvent {
            return Ok(None);
        }
        if step.index == at_index {
            return Ok(Some(step.rate_bp()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn flat_market_draws_down_linearly() {
        let series = fixtures::flat_series(24, 1.0, 1.0);
        let trajectory = simulate(&series, 0, 12, 12.0, 50, 1_000.0).expect("valid run");

        assert!(trajectory.ok);
        assert!(!trajectory.partial);
        assert_eq!(trajectory.records.len(), 12);
        for (i, record) in trajectory.records.iter().enumerate() {
            assert_eq!(record.retirement_month, i as u32 + 1);
            assert_eq!(record.index, i);
            assert_approx(record.monthly_income, 10.0);
            assert_approx(record.start_balance, 1_000.0 - 10.0 * i as f64);
        }
        assert_approx(trajectory.final_balance.expect("full run"), 880.0);
        assert_eq!(trajectory.records[0].rate_bp, 1_200);
        assert!(
            trajectory
                .records
                .iter()
                .all(|r| r.final_balance == trajectory.final_balance)
        );
    }

    #[test]
    fn growth_applies_after_withdrawal() {
        let series = fixtures::flat_series(3, 1.10, 1.0);
        let trajectory = simulate(&series, 0, 2, 12.0, 50, 100.0).unwrap();
        assert_approx(trajectory.records[0].end_balance, 99.0 * 1.10);
        assert_approx(trajectory.records[1].end_balance, (99.0 * 1.10 - 1.0) * 1.10);
    }

    #[test]
    fn exhausting_withdrawal_fails_and_stops() {
        let series = fixtures::flat_series(24, 1.0, 1.0);
        let trajectory = simulate(&series, 0, 24, 600.0, 50, 1_000.0).unwrap();

        // 50% of the opening balance per month: month 2 leaves exactly zero.
        assert!(!trajectory.ok);
        assert_eq!(trajectory.records.len(), 2);
        assert_approx(trajectory.records[1].end_balance, 0.0);
        assert_eq!(trajectory.final_balance, Some(0.0));
    }

    #[test]
    fn run_past_the_data_is_partial() {
        let series = fixtures::flat_series(10, 1.0, 1.0);
        let trajectory = simulate(&series, 4, 40, 4.0, 50, 1_000.0).unwrap();
        assert!(trajectory.ok);
        assert!(trajectory.partial);
        assert_eq!(trajectory.records.len(), 6);
        assert_eq!(trajectory.final_balance, None);
        assert!(trajectory.records.iter().all(|r| r.final_balance.is_none()));
    }

    #[test]
    fn nominal_accounting_grows_income_with_inflation() {
        let series = fixtures::flat_series_with(6, 1.0, 1.01, Accounting::Nominal);
        let trajectory = simulate(&series, 0, 3, 12.0, 50, 1_000.0).unwrap();
        assert_approx(trajectory.records[0].monthly_income, 10.0);
        assert_approx(trajectory.records[1].monthly_income, 10.0 * 1.01);
        assert_approx(trajectory.records[2].monthly_income, 10.0 * 1.01 * 1.01);

        let real = fixtures::flat_series_with(6, 1.0, 1.01, Accounting::Real);
        let trajectory = simulate(&real, 0, 3, 12.0, 50, 1_000.0).unwrap();
        assert_approx(trajectory.records[2].monthly_income, 10.0);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let series = fixtures::flat_series(12, 1.0, 1.0);
        assert!(matches!(
            simulate(&series, 5, 5, 4.0, 50, 1.0),
            Err(SwrError::InvalidInput(_))
        ));
        assert!(matches!(
            simulate(&series, 12, 20, 4.0, 50, 1.0),
            Err(SwrError::InvalidInput(_))
        ));
        assert!(matches!(
            simulate(&series, 0, 5, f64::NAN, 50, 1.0),
            Err(SwrError::InvalidInput(_))
        ));
        assert!(matches!(
            simulate(&series, 0, 5, 4.0, 50, 0.0),
            Err(SwrError::InvalidInput(_))
        ));
        assert_eq!(
            simulate(&series, 0, 5, 4.0, 60, 1.0),
            Err(SwrError::UnsupportedAllocation(60))
        );
    }

    #[test]
    fn rate_at_month_matches_recorded_trajectory() {
        let series = fixtures::synthetic_series(12, Accounting::Nominal);
        let trajectory = simulate(&series, 7, 80, 5.25, 75, 1e6).unwrap();
        assert!(trajectory.ok);
        for at in [7, 8, 30, 79] {
            let rate = rate_at_month(&series, 7, at, 5.25, 75, 1e6).unwrap();
            assert_eq!(rate, Some(trajectory.records[at - 7].rate_bp));
        }
    }

    #[test]
    fn rate_at_month_reports_depletion() {
        let series = fixtures::flat_series(24, 1.0, 1.0);
        assert_eq!(rate_at_month(&series, 0, 5, 600.0, 50, 1.0).unwrap(), None);
        assert_eq!(rate_at_month(&series, 0, 0, 600.0, 50, 1.0).unwrap(), Some(60_000));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_records_chain_balances(
            start in 0usize..100,
            months in 1usize..120,
            rate_bp in 0u32..3_000,
            nominal in proptest::bool::ANY,
        ) {
            let accounting = if nominal { Accounting::Nominal } else { Accounting::Real };
            let series = fixtures::synthetic_series(10, accounting);
            let trajectory = simulate(
                &series,
                start,
                start + months,
                rate_bp as f64 / 100.0,
                75,
                1e6,
            ).unwrap();

            prop_assert!(!trajectory.records.is_empty());
            prop_assert!(trajectory.records.len() <= months);
            for pair in trajectory.records.windows(2) {
                prop_assert_eq!(pair[1].start_balance, pair[0].end_balance);
                prop_assert_eq!(pair[1].index, pair[0].index + 1);
            }
            for record in &trajectory.records {
                prop_assert!(record.start_balance > 0.0);
                prop_assert!(record.end_balance >= 0.0);
                let growth = series.growth(record.index, 75).unwrap();
                let expected = (record.start_balance - record.monthly_income) * growth;
                if trajectory.ok {
                    prop_assert!((record.end_balance - expected).abs() <= 1e-6 * record.start_balance);
                }
            }
            prop_assert_eq!(trajectory.records[0].rate_bp, rate_bp);
        }
    }
}
