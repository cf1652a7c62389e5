use std::sync::Arc;

use chrono::NaiveDate;

use super::baseline::BaselineRateTable;
use super::config::EngineConfig;
use super::dynamic::{DynamicKey, DynamicRateTable, DynamicSeries};
use super::error::{SwrError, SwrResult};
use super::lookback::populate_dynamic_series;
use super::series::{MarketSeries, month_offset};
use super::types::DynamicEntry;

/// Everything the rate engines share: the market history, the tunables, the
/// precomputed baseline table and the lazily filled dynamic table.
#[derive(Debug)]
pub struct SwrContext {
    series: Arc<MarketSeries>,
    config: EngineConfig,
    baseline: BaselineRateTable,
    dynamic: DynamicRateTable,
}

impl SwrContext {
    pub fn build(series: Arc<MarketSeries>, config: EngineConfig) -> SwrResult<Self> {
        config.validate()?;
        let baseline = BaselineRateTable::build(&series, &config)?;
        Ok(Self {
            series,
            config,
            baseline,
            dynamic: DynamicRateTable::new(),
        })
    }

    pub fn series(&self) -> &MarketSeries {
        &self.series
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn baseline(&self) -> &BaselineRateTable {
        &self.baseline
    }

    pub fn dynamic(&self) -> &DynamicRateTable {
        &self.dynamic
    }

    /// Baseline rate for a computation that cannot proceed without one.
    pub fn baseline_rate(&self, duration_years: u32, allocation: u32) -> SwrResult<u32> {
        if !self.series.supports(allocation) {
            return Err(SwrError::UnsupportedAllocation(allocation));
        }
        self.baseline.rate(duration_years, allocation).ok_or_else(|| {
            SwrError::InsufficientHistory(format!(
                "no baseline rate for {duration_years} years (history covers {} years)",
                self.baseline.max_duration_years()
            ))
        })
    }

    pub fn dynamic_series(
        &self,
        duration_years: u32,
        lookback_years: u32,
        allocation: u32,
    ) -> SwrResult<Arc<DynamicSeries>> {
        let key = DynamicKey {
            duration_years,
            lookback_years,
            allocation,
        };
        self.dynamic
            .get_or_populate(key, || populate_dynamic_series(self, key))
    }

    /// Dynamic entry for a retirement starting at `time`.
    ///
    /// `None` when `time` is outside the series or too early for a full
    /// lookback window.
    pub fn dynamic_entry(
        &self,
        time: NaiveDate,
        duration_years: u32,
        lookback_years: u32,
        allocation: u32,
    ) -> SwrResult<Option<DynamicEntry>> {
        let Some(index) = self.series.index_for_time(time) else {
            return Ok(None);
        };
        let series = self.dynamic_series(duration_years, lookback_years, allocation)?;
        Ok(series.entry_at(index).copied())
    }

    /// Dynamic entries for retirements from `from` through `to` inclusive.
    pub fn dynamic_range(
        &self,
        duration_years: u32,
        lookback_years: u32,
        allocation: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SwrResult<Vec<DynamicEntry>> {
        if to < from {
            return Err(SwrError::InvalidInput(format!("range end {to} precedes start {from}")));
        }
        let last = self.series.len() - 1;
        let clamp = |date: NaiveDate| -> usize {
            let offset = month_offset(self.series.start_time(), date);
            offset.clamp(0, last as i64) as usize
        };
        let series = self.dynamic_series(duration_years, lookback_years, allocation)?;
        if to < self.series.start_time() || from > self.series.time(last) {
            return Ok(Vec::new());
        }
        Ok(series.range(clamp(from), clamp(to)).to_vec())
    }
}
