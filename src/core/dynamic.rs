use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::error::{SwrResult, ensure_invariant};
use super::types::DynamicEntry;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicKey {
    pub duration_years: u32,
    pub lookback_years: u32,
    pub allocation: u32,
}

/// Dynamic entries for one key, one per retirement index from `first_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicSeries {
    key: DynamicKey,
    first_index: usize,
    entries: Vec<DynamicEntry>,
}

impl DynamicSeries {
    pub fn new(key: DynamicKey, first_index: usize, entries: Vec<DynamicEntry>) -> Self {
        Self {
            key,
            first_index,
            entries,
        }
    }

    pub fn key(&self) -> DynamicKey {
        self.key
    }

    pub fn first_index(&self) -> usize {
        self.first_index
    }

    pub fn entries(&self) -> &[DynamicEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_at(&self, index: usize) -> Option<&DynamicEntry> {
        self.entries.get(index.checked_sub(self.first_index)?)
    }

    /// Entries for indices `from..=to`, clipped to what was computed.
    pub fn range(&self, from: usize, to: usize) -> &[DynamicEntry] {
        let lo = from.saturating_sub(self.first_index).min(self.entries.len());
        let hi = match to.checked_sub(self.first_index) {
            Some(offset) => (offset + 1).min(self.entries.len()),
            None => 0,
        };
        if lo >= hi { &[] } else { &self.entries[lo..hi] }
    }
}

/// Lazily filled cache of dynamic rate series.
///
/// A key's series is computed outside the lock and published whole; when two
/// callers race on the same key the first insert is kept and both see it.
#[derive(Debug, Default)]
pub struct DynamicRateTable {
    series: RwLock<HashMap<DynamicKey, Arc<DynamicSeries>>>,
}

impl DynamicRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, key: &DynamicKey) -> Option<Arc<DynamicSeries>> {
        self.series.read().get(key).cloned()
    }

    pub fn get_or_populate<F>(&self, key: DynamicKey, populate: F) -> SwrResult<Arc<DynamicSeries>>
    where
        F: FnOnce() -> SwrResult<DynamicSeries>,
    {
        if let Some(found) = self.cached(&key) {
            return Ok(found);
        }

        let built = populate()?;
        ensure_invariant!(
            built.key == key,
            "populated {:?} while filling {:?}",
            built.key,
            key
        );
        let built = Arc::new(built);
        let mut map = self.series.write();
        let published = map.entry(key).or_insert_with(|| {
            debug!(?key, entries = built.len(), "dynamic series cached");
            Arc::clone(&built)
        });
        Ok(Arc::clone(published))
    }

    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }

    pub fn keys(&self) -> Vec<DynamicKey> {
        let mut keys: Vec<_> = self.series.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SwrError;
    use crate::core::fixtures;
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> DynamicKey {
        DynamicKey {
            duration_years: 30,
            lookback_years: 2,
            allocation: 75,
        }
    }

    fn sample(first_index: usize, rates: &[u32]) -> DynamicSeries {
        let entries = rates
            .iter()
            .enumerate()
            .map(|(i, &rate_bp)| DynamicEntry {
                retire_time: fixtures::start_date()
                    .checked_add_months(chrono::Months::new((first_index + i) as u32))
                    .unwrap(),
                duration_years: 30,
                lookback_years: 2,
                allocation: 75,
                rate_bp,
                virtual_retirement_months: 0,
                final_balance: None,
            })
            .collect();
        DynamicSeries::new(key(), first_index, entries)
    }

    #[test]
    fn populates_each_key_once() {
        let table = DynamicRateTable::new();
        let calls = AtomicUsize::new(0);
        let first = table
            .get_or_populate(key(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(sample(24, &[400, 410]))
            })
            .unwrap();
        let second = table
            .get_or_populate(key(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(sample(24, &[999]))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
        assert_eq!(table.keys(), vec![key()]);
    }

    #[test]
    fn failed_population_is_not_cached() {
        let table = DynamicRateTable::new();
        let err = table.get_or_populate(key(), || {
            Err(SwrError::InsufficientHistory("nothing".to_string()))
        });
        assert!(err.is_err());
        assert!(table.is_empty());
        assert!(table.cached(&key()).is_none());
    }

    #[test]
    fn mismatched_key_is_an_invariant_violation() {
        let table = DynamicRateTable::new();
        let other = DynamicKey {
            allocation: 50,
            ..key()
        };
        assert!(matches!(
            table.get_or_populate(other, || Ok(sample(24, &[400]))),
            Err(SwrError::InvariantViolation(_))
        ));
    }

    #[test]
    fn racing_populators_share_the_first_insert() {
        let table = DynamicRateTable::new();
        let results: Vec<_> = (0..16u32)
            .into_par_iter()
            .map(|n| {
                table
                    .get_or_populate(key(), || Ok(sample(24, &[400 + n])))
                    .unwrap()
            })
            .collect();
        let first = &results[0];
        assert!(results.iter().all(|r| Arc::ptr_eq(r, first)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn point_and_range_lookups_use_series_indices() {
        let series = sample(24, &[400, 410, 420, 430]);
        assert_eq!(series.entry_at(23), None);
        assert_eq!(series.entry_at(25).map(|e| e.rate_bp), Some(410));
        assert_eq!(series.entry_at(28), None);

        let rates = |slice: &[DynamicEntry]| slice.iter().map(|e| e.rate_bp).collect::<Vec<_>>();
        assert_eq!(rates(series.range(25, 26)), vec![410, 420]);
        assert_eq!(rates(series.range(0, 24)), vec![400]);
        assert_eq!(rates(series.range(26, 100)), vec![420, 430]);
        assert!(series.range(0, 10).is_empty());
        assert!(series.range(27, 26).is_empty());
    }
}
