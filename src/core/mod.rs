mod analysis;
mod baseline;
mod config;
mod context;
mod dynamic;
mod engine;
pub(crate) mod error;
mod lookback;
mod reretire;
mod series;
mod solver;
mod types;
mod vpw;

#[cfg(test)]
pub(crate) mod fixtures;

pub use analysis::{
    DynamicSummary, RatePoint, SuccessCounts, WalkForwardMethod, WalkForwardOptions,
    WalkForwardReport, dynamic_summary, success_counts, walk_forward,
};
pub use baseline::BaselineRateTable;
pub use config::EngineConfig;
pub use context::SwrContext;
pub use dynamic::{DynamicKey, DynamicRateTable, DynamicSeries};
pub use engine::simulate;
pub use error::{SwrError, SwrResult};
pub use lookback::{find_dynamic_rates, implied_rate_at_offset};
pub use reretire::{capped_salary, reretire};
pub use series::{MarketSeries, first_of_month, month_offset, parse_month};
pub use solver::{RateSearchConfig, RateSolveResult, max_sustainable_rate};
pub use types::{
    Accounting, BaselineEntry, DynamicEntry, MonthlyRecord, NestEggPolicy, Trajectory,
    basis_points_to_percent, fraction_to_basis_points, salary_for_rate, years_covering,
};
pub use vpw::{PathComparison, VPW_STOCK75_AGE65, compare_paths, vpw_trajectory};
