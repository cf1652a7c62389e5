use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Added before flooring a withdrawal fraction to basis points so that an
/// exact rate like 530 bp that picked up float noise (529.99999...) keeps its
/// integer value.
const BASIS_POINT_SLACK: f64 = 1e-6;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accounting {
    /// Withdrawals stay flat in inflation-adjusted terms.
    Real,
    /// Withdrawals grow with cumulative inflation since the start.
    Nominal,
}

/// One simulated month of a retirement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyRecord {
    pub retire_time: NaiveDate,
    pub current_time: NaiveDate,
    pub index: usize,
    /// 1-based month of retirement.
    pub retirement_month: u32,
    pub monthly_income: f64,
    pub start_balance: f64,
    pub end_balance: f64,
    pub rate_bp: u32,
    pub virtual_retirement_months: u32,
    pub baseline_salary: f64,
    pub dynamic_salary: f64,
    pub crystal_salary: Option<f64>,
    pub final_balance: Option<f64>,
}

impl MonthlyRecord {
    /// Annualized withdrawal as a percentage of the month's starting balance.
    pub fn percent(&self) -> f64 {
        self.monthly_income * 12.0 / self.start_balance * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineEntry {
    pub retire_time: NaiveDate,
    pub duration_years: u32,
    pub allocation: u32,
    /// Highest solvent rate for this exact start (the crystal-ball rate).
    pub rate_bp: u32,
    pub final_balance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicEntry {
    pub retire_time: NaiveDate,
    pub duration_years: u32,
    pub lookback_years: u32,
    pub allocation: u32,
    pub rate_bp: u32,
    pub virtual_retirement_months: u32,
    pub final_balance: Option<f64>,
}

/// How much the real retiree holds on each retirement date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum NestEggPolicy {
    Constant { amount: f64 },
    /// Starts at `initial` on the first simulated date and follows the
    /// portfolio's market growth from there.
    MarketGrowth { initial: f64 },
}

/// A simulated trajectory plus its solvency status.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub records: Vec<MonthlyRecord>,
    pub ok: bool,
    pub partial: bool,
    pub final_balance: Option<f64>,
}

impl Trajectory {
    pub fn last(&self) -> Option<&MonthlyRecord> {
        self.records.last()
    }
}

pub fn fraction_to_basis_points(fraction: f64) -> u32 {
    (fraction * 10_000.0 + BASIS_POINT_SLACK).floor().max(0.0) as u32
}

pub fn basis_points_to_percent(rate_bp: u32) -> f64 {
    rate_bp as f64 / 100.0
}

pub fn salary_for_rate(balance: f64, rate_bp: u32) -> f64 {
    balance * rate_bp as f64 / 10_000.0
}

/// Number of whole years needed to cover `months`.
pub fn years_covering(months: u32) -> u32 {
    months.div_ceil(12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_to_basis_points_absorbs_float_noise() {
        assert_eq!(fraction_to_basis_points(0.053), 530);
        assert_eq!(fraction_to_basis_points(0.052_999_999_999_9), 530);
        assert_eq!(fraction_to_basis_points(0.052_99), 529);
        assert_eq!(fraction_to_basis_points(0.0), 0);
        assert_eq!(fraction_to_basis_points(-0.01), 0);
    }

    #[test]
    fn exact_rates_survive_a_round_trip_through_income() {
        for rate_bp in [1_u32, 333, 400, 530, 1_234, 9_999, 25_000] {
            let balance = 987_654.321;
            let monthly = salary_for_rate(balance, rate_bp) / 12.0;
            assert_eq!(fraction_to_basis_points(monthly * 12.0 / balance), rate_bp);
        }
    }

    #[test]
    fn years_covering_rounds_partial_years_up() {
        assert_eq!(years_covering(0), 0);
        assert_eq!(years_covering(1), 1);
        assert_eq!(years_covering(12), 1);
        assert_eq!(years_covering(13), 2);
        assert_eq!(years_covering(240), 20);
        assert_eq!(years_covering(241), 21);
    }
}
