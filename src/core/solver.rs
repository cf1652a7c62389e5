use super::config::EngineConfig;
use super::engine::{RunOutcome, run_withdrawals};
use super::error::{SwrError, SwrResult};
use super::series::MarketSeries;
use super::types::basis_points_to_percent;

// 100% of the balance per year.
const INITIAL_UPPER_BP: u32 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct RateSearchConfig {
    pub opening_balance: f64,
    pub ceiling_bp: u32,
}

impl From<&EngineConfig> for RateSearchConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            opening_balance: config.normalized_balance,
            ceiling_bp: config.rate_ceiling_bp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSolveResult {
    pub rate_bp: u32,
    pub final_balance: f64,
    pub evaluations: u32,
}

pub fn max_sustainable_rate(
    series: &MarketSeries,
    start_index: usize,
    months: usize,
    allocation: u32,
    config: RateSearchConfig,
) -> SwrResult<RateSolveResult> {
    validate_search(series, start_index, months, allocation, config)?;

    let mut evaluations = 0;
    let mut eval = |rate_bp: u32| -> SwrResult<RunOutcome> {
        evaluations += 1;
        run_withdrawals(
            series,
            start_index,
            start_index + months,
            basis_points_to_percent(rate_bp),
            allocation,
            config.opening_balance,
            None,
        )
    };

    let floor = eval(1)?;
    if !floor.ok {
        let untouched = eval(0)?;
        return Ok(RateSolveResult {
            rate_bp: 0,
            final_balance: untouched.balance,
            evaluations,
        });
    }

    let mut lo = 1;
    let mut lo_balance = floor.balance;
    let mut hi = INITIAL_UPPER_BP.min(config.ceiling_bp);
    loop {
        let outcome = eval(hi)?;
        if !outcome.ok {
            break;
        }
        if hi >= config.ceiling_bp {
            return Err(SwrError::NumericDomain(format!(
                "window starting at index {start_index} survives {hi} bp; no failing rate below the ceiling"
            )));
        }
        lo = hi;
        lo_balance = outcome.balance;
        hi = hi.saturating_mul(2).min(config.ceiling_bp);
    }

    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let outcome = eval(mid)?;
        if outcome.ok {
            lo = mid;
            lo_balance = outcome.balance;
        } else {
            hi = mid;
        }
    }

    Ok(RateSolveResult {
        rate_bp: lo,
        final_balance: lo_balance,
        evaluations,
    })
}

fn validate_search(
    series: &MarketSeries,
    start_index: usize,
    months: usize,
    allocation: u32,
    config: RateSearchConfig,
) -> SwrResult<()> {
    if !series.supports(allocation) {
        return Err(SwrError::UnsupportedAllocation(allocation));
    }
    if months == 0 {
        return Err(SwrError::InvalidInput("search window must be at least one month".to_string()));
    }
    if start_index + months > series.len() {
        return Err(SwrError::InsufficientHistory(format!(
            "{months} months from index {start_index} runs past the {} months of data",
            series.len()
        )));
    }
    if !config.opening_balance.is_finite() || config.opening_balance <= 0.0 {
        return Err(SwrError::InvalidInput("opening balance must be > 0".to_string()));
    }
    if config.ceiling_bp < 2 {
        return Err(SwrError::InvalidInput("rate ceiling must be at least 2 bp".to_string()));
    }
    Ok(())
}
