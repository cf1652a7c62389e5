use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::context::SwrContext;
use super::engine::run_withdrawals;
use super::error::{SwrError, SwrResult, ensure_invariant};
use super::types::basis_points_to_percent;

/// Running minima start here (100% a year) before any window is observed.
const UNOBSERVED_RATE_BP: u32 = 10_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalkForwardMethod {
    Baseline,
    Dmswr,
}

#[derive(Debug, Clone, Copy)]
pub struct WalkForwardOptions {
    pub method: WalkForwardMethod,
    pub duration_years: u32,
    pub lookback_years: u32,
    pub allocation: u32,
    /// Also report crystal-ball rates for ongoing retirements that have at
    /// least this many years of data.
    pub partial_min_years: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatePoint {
    pub time: NaiveDate,
    pub rate_bp: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardReport {
    pub method: WalkForwardMethod,
    pub duration_years: u32,
    pub lookback_years: u32,
    pub allocation: u32,
    /// Rate known at each month using only windows that had already ended.
    pub estimated: Vec<RatePoint>,
    pub realized: Vec<RatePoint>,
    pub crystal_ball: Vec<RatePoint>,
    pub partial_crystal_ball: Vec<RatePoint>,
    /// First month whose estimate rests on at least one full window.
    pub evaluated_from: Option<NaiveDate>,
    pub failures: usize,
    pub successes: usize,
    pub max_gap_bp: u32,
}

/// Replay history as if the rate table were rebuilt every month from the
/// windows that had finished by then, and count how often following that
/// point-in-time rate would have failed.
pub fn walk_forward(ctx: &SwrContext, options: WalkForwardOptions) -> SwrResult<WalkForwardReport> {
    let series = ctx.series();
    let years = options.duration_years;
    if years == 0 {
        return Err(SwrError::InvalidInput("duration must be at least one year".to_string()));
    }
    ctx.baseline_rate(years, options.allocation)?;

    let min_start = match options.method {
        WalkForwardMethod::Baseline => 0,
        WalkForwardMethod::Dmswr => options.lookback_years as usize * 12,
    };
    let dynamic = match options.method {
        WalkForwardMethod::Baseline => Vec::new(),
        WalkForwardMethod::Dmswr => (1..=years)
            .map(|y| ctx.dynamic_series(y, options.lookback_years, options.allocation))
            .collect::<SwrResult<Vec<_>>>()?,
    };
    let window_rate = |start: usize, y: u32| -> Option<u32> {
        match options.method {
            WalkForwardMethod::Baseline => ctx
                .baseline()
                .entry_at(start, y, options.allocation)
                .map(|entry| entry.rate_bp),
            WalkForwardMethod::Dmswr => dynamic[y as usize - 1]
                .entry_at(start)
                .map(|entry| entry.rate_bp),
        }
    };

    let mut minima = vec![UNOBSERVED_RATE_BP; years as usize + 1];
    let evaluate_from = min_start + years as usize * 12;
    let mut report = WalkForwardReport {
        method: options.method,
        duration_years: years,
        lookback_years: options.lookback_years,
        allocation: options.allocation,
        estimated: Vec::with_capacity(series.len()),
        realized: Vec::new(),
        crystal_ball: Vec::new(),
        partial_crystal_ball: Vec::new(),
        evaluated_from: (evaluate_from < series.len()).then(|| series.time(evaluate_from)),
        failures: 0,
        successes: 0,
        max_gap_bp: 0,
    };

    for end in 0..series.len() {
        let end_time = series.time(end);

        // Shorter durations first so a failure that only shows up over a
        // short window still caps every longer one.
        for y in 1..=years {
            let Some(start) = end.checked_sub(y as usize * 12) else {
                continue;
            };
            if start < min_start {
                continue;
            }
            let mut rate = window_rate(start, y).ok_or_else(|| {
                SwrError::InvariantViolation(format!(
                    "no {y}-year rate for completed window starting {}",
                    series.time(start)
                ))
            })?;
            if y > 1 {
                rate = rate.min(minima[y as usize - 1]);
            }
            if rate < minima[y as usize] {
                for longer in minima[y as usize..].iter_mut() {
                    *longer = (*longer).min(rate);
                }
            }
        }

        let estimate = minima[years as usize];
        report.estimated.push(RatePoint {
            time: end_time,
            rate_bp: estimate,
        });
        if let Some(start) = end.checked_sub(years as usize * 12) {
            report.realized.push(RatePoint {
                time: series.time(start),
                rate_bp: estimate,
            });
        }

        match ctx.baseline().entry_at(end, years, options.allocation) {
            Some(entry) => {
                report.crystal_ball.push(RatePoint {
                    time: end_time,
                    rate_bp: entry.rate_bp,
                });
                if end >= evaluate_from {
                    if entry.rate_bp < estimate {
                        report.failures += 1;
                        report.max_gap_bp = report.max_gap_bp.max(estimate - entry.rate_bp);
                    } else {
                        report.successes += 1;
                    }
                }
            }
            None => {
                let available = ((series.len() - end) / 12) as u32;
                if let Some(min_years) = options.partial_min_years {
                    if available >= min_years.max(1) {
                        if let Some(entry) =
                            ctx.baseline().entry_at(end, available, options.allocation)
                        {
                            report.partial_crystal_ball.push(RatePoint {
                                time: end_time,
                                rate_bp: entry.rate_bp,
                            });
                        }
                    }
                }
            }
        }
    }

    info!(
        method = ?options.method,
        duration_years = years,
        allocation = options.allocation,
        failures = report.failures,
        successes = report.successes,
        max_gap_bp = report.max_gap_bp,
        "walk-forward analysis"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSummary {
    pub duration_years: u32,
    pub lookback_years: u32,
    pub allocation: u32,
    pub baseline_bp: u32,
    pub count: usize,
    pub mean_bp: f64,
    pub highest: Option<RatePoint>,
    pub winners: usize,
    pub ties: usize,
    pub win_by_50: usize,
    pub win_by_100: usize,
    pub win_2x: usize,
}

/// How the dynamic rate compares with the baseline across all of history.
pub fn dynamic_summary(
    ctx: &SwrContext,
    duration_years: u32,
    lookback_years: u32,
    allocation: u32,
) -> SwrResult<DynamicSummary> {
    let baseline_bp = ctx.baseline_rate(duration_years, allocation)?;
    let series = ctx.dynamic_series(duration_years, lookback_years, allocation)?;

    let mut summary = DynamicSummary {
        duration_years,
        lookback_years,
        allocation,
        baseline_bp,
        count: series.len(),
        mean_bp: 0.0,
        highest: None,
        winners: 0,
        ties: 0,
        win_by_50: 0,
        win_by_100: 0,
        win_2x: 0,
    };
    let mut total = 0u64;
    for entry in series.entries() {
        ensure_invariant!(
            entry.rate_bp >= baseline_bp,
            "dynamic rate {} bp at {} is below baseline {baseline_bp} bp",
            entry.rate_bp,
            entry.retire_time
        );
        total += entry.rate_bp as u64;
        if summary.highest.is_none_or(|best| entry.rate_bp > best.rate_bp) {
            summary.highest = Some(RatePoint {
                time: entry.retire_time,
                rate_bp: entry.rate_bp,
            });
        }
        let diff = entry.rate_bp - baseline_bp;
        if diff == 0 {
            summary.ties += 1;
            continue;
        }
        summary.winners += 1;
        if diff >= 50 {
            summary.win_by_50 += 1;
        }
        if diff >= 100 {
            summary.win_by_100 += 1;
        }
        if entry.rate_bp >= baseline_bp * 2 {
            summary.win_2x += 1;
        }
    }
    if summary.count > 0 {
        summary.mean_bp = total as f64 / summary.count as f64;
    }
    Ok(summary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessCounts {
    pub rate_bp: u32,
    pub duration_years: u32,
    pub allocation: u32,
    pub successes: usize,
    pub failures: usize,
}

/// Count the full historical windows that survive a fixed withdrawal rate.
pub fn success_counts(
    ctx: &SwrContext,
    rate_bp: u32,
    duration_years: u32,
    allocation: u32,
) -> SwrResult<SuccessCounts> {
    let series = ctx.series();
    if !series.supports(allocation) {
        return Err(SwrError::UnsupportedAllocation(allocation));
    }
    if duration_years == 0 {
        return Err(SwrError::InvalidInput("duration must be at least one year".to_string()));
    }
    let last = series.last_full_index(duration_years).ok_or_else(|| {
        SwrError::InsufficientHistory(format!(
            "no {duration_years}-year window in {} months",
            series.len()
        ))
    })?;
    let months = duration_years as usize * 12;
    let balance = ctx.config().normalized_balance;

    let outcomes = (0..=last)
        .into_par_iter()
        .map(|start| {
            run_withdrawals(
                series,
                start,
                start + months,
                basis_points_to_percent(rate_bp),
                allocation,
                balance,
                None,
            )
            .map(|outcome| outcome.ok)
        })
        .collect::<SwrResult<Vec<bool>>>()?;
    let successes = outcomes.iter().filter(|&&ok| ok).count();
    Ok(SuccessCounts {
        rate_bp,
        duration_years,
        allocation,
        successes,
        failures: outcomes.len() - successes,
    })
}
