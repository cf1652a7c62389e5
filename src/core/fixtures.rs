//! Deterministic market histories for unit tests.

use std::sync::OnceLock;

use chrono::NaiveDate;

use super::config::EngineConfig;
use super::context::SwrContext;
use super::series::MarketSeries;
use super::types::Accounting;

pub(crate) const ALLOCATIONS: [u32; 4] = [0, 50, 75, 100];

pub(crate) fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1926, 1, 1).expect("valid date")
}

/// Every month grows by `growth` with `inflation`, single 50% allocation.
pub(crate) fn flat_series(months: usize, growth: f64, inflation: f64) -> MarketSeries {
    flat_series_with(months, growth, inflation, Accounting::Real)
}

pub(crate) fn flat_series_with(
    months: usize,
    growth: f64,
    inflation: f64,
    accounting: Accounting,
) -> MarketSeries {
    MarketSeries::new(
        start_date(),
        accounting,
        vec![50],
        vec![vec![growth; months]],
        vec![inflation; months],
    )
    .expect("valid flat series")
}

/// Single-allocation series from explicit growth factors and no inflation.
pub(crate) fn series_from_growth(growth: &[f64], allocation: u32) -> MarketSeries {
    MarketSeries::new(
        start_date(),
        Accounting::Real,
        vec![allocation],
        vec![growth.to_vec()],
        vec![1.0; growth.len()],
    )
    .expect("valid series")
}

/// Thirteen months where a start in month 0 supports exactly 500 bp for one
/// year and a start in month 1 exactly 400 bp.
pub(crate) fn two_start_series() -> MarketSeries {
    let mut growth = vec![1.0; 13];
    growth[0] = 1.141;
    growth[1] = 0.03684;
    series_from_growth(&growth, 75)
}

/// Long synthetic history with booms, slumps and a few sharp crashes.
pub(crate) fn synthetic_series(years: usize, accounting: Accounting) -> MarketSeries {
    synthetic_series_for(years, accounting, &ALLOCATIONS)
}

pub(crate) fn synthetic_series_for(
    years: usize,
    accounting: Accounting,
    allocations: &[u32],
) -> MarketSeries {
    synthetic_series_with_stock_shock(years, accounting, allocations, None)
}

/// Synthetic history with month `index` of stock growth scaled by `factor`.
pub(crate) fn synthetic_series_with_stock_shock(
    years: usize,
    accounting: Accounting,
    allocations: &[u32],
    shock: Option<(usize, f64)>,
) -> MarketSeries {
    let months = years * 12;
    let mut stock = Vec::with_capacity(months);
    let mut bond = Vec::with_capacity(months);
    let mut inflation = Vec::with_capacity(months);
    for i in 0..months {
        let t = i as f64;
        let crash = if i % 97 == 50 { 0.15 } else { 0.0 };
        stock.push(1.0075 + 0.035 * (0.21 * t).sin() + 0.02 * (0.037 * t).sin() - crash);
        bond.push(1.0028 + 0.006 * (0.09 * t).cos());
        inflation.push(1.0025 + 0.002 * (0.05 * t).sin());
    }
    if let Some((index, factor)) = shock {
        stock[index] *= factor;
    }
    MarketSeries::from_asset_returns(
        start_date(),
        accounting,
        allocations.to_vec(),
        &stock,
        &bond,
        inflation,
    )
    .expect("valid synthetic series")
}

pub(crate) fn config(max_duration_years: u32) -> EngineConfig {
    EngineConfig {
        max_duration_years,
        ..EngineConfig::default()
    }
}

pub(crate) fn context(series: MarketSeries, max_duration_years: u32) -> SwrContext {
    SwrContext::build(series.into(), config(max_duration_years)).expect("context builds")
}

/// 55 real years at 75% stock with tables for up to 50-year retirements.
pub(crate) fn long_context() -> &'static SwrContext {
    static CONTEXT: OnceLock<SwrContext> = OnceLock::new();
    CONTEXT.get_or_init(|| context(synthetic_series_for(55, Accounting::Real, &[75]), 50))
}

/// 20 years of every fixture allocation under nominal accounting.
pub(crate) fn short_context() -> &'static SwrContext {
    static CONTEXT: OnceLock<SwrContext> = OnceLock::new();
    CONTEXT.get_or_init(|| context(synthetic_series(20, Accounting::Nominal), 20))
}

/// 30 real years at 75% stock where stocks halve two years before the end.
pub(crate) fn late_crash_context() -> &'static SwrContext {
    static CONTEXT: OnceLock<SwrContext> = OnceLock::new();
    CONTEXT.get_or_init(|| {
        let series =
            synthetic_series_with_stock_shock(30, Accounting::Real, &[75], Some((336, 0.5)));
        context(series, 30)
    })
}
