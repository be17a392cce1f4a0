use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use trading_core::{Bar, QualityReport, SeriesKey, TimeRange};

use crate::LoadMode;

type CacheKey = (SeriesKey, TimeRange, LoadMode);

/// In-process LRU over recently served frames, keyed by the full request
/// identity. Any bar write to a series evicts all of its entries.
pub struct FrameCache {
    inner: Mutex<LruCache<CacheKey, (Vec<Bar>, QualityReport)>>,
}

impl FrameCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(
        &self,
        key: &SeriesKey,
        range: TimeRange,
        mode: LoadMode,
    ) -> Option<(Vec<Bar>, QualityReport)> {
        let mut cache = self.inner.lock().unwrap();
        cache.get(&(key.clone(), range, mode)).cloned()
    }

    pub fn put(
        &self,
        key: &SeriesKey,
        range: TimeRange,
        mode: LoadMode,
        frame: Vec<Bar>,
        report: QualityReport,
    ) {
        let mut cache = self.inner.lock().unwrap();
        cache.put((key.clone(), range, mode), (frame, report));
    }

    /// Drop every cached frame for one series.
    pub fn invalidate_series(&self, key: &SeriesKey) {
        let mut cache = self.inner.lock().unwrap();
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|((k, _, _), _)| k == key)
            .map(|(k, _)| k.clone())
            .collect();
        for entry in stale {
            cache.pop(&entry);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::{Symbol, Timeframe};

    fn key(symbol: &str) -> SeriesKey {
        SeriesKey::new(Symbol::new(symbol).unwrap(), Timeframe::Day1)
    }

    fn range() -> TimeRange {
        TimeRange::new(
            "2024-01-01T00:00:00Z".parse().unwrap(),
            "2024-01-31T00:00:00Z".parse().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn hit_requires_exact_request_identity() {
        let cache = FrameCache::new(8);
        cache.put(&key("AAPL"), range(), LoadMode::Full, vec![], QualityReport::default());

        assert!(cache.get(&key("AAPL"), range(), LoadMode::Full).is_some());
        assert!(cache.get(&key("AAPL"), range(), LoadMode::Local).is_none());
        assert!(cache.get(&key("MSFT"), range(), LoadMode::Full).is_none());
    }

    #[test]
    fn series_invalidation_is_scoped() {
        let cache = FrameCache::new(8);
        cache.put(&key("AAPL"), range(), LoadMode::Full, vec![], QualityReport::default());
        cache.put(&key("AAPL"), range(), LoadMode::Local, vec![], QualityReport::default());
        cache.put(&key("MSFT"), range(), LoadMode::Full, vec![], QualityReport::default());

        cache.invalidate_series(&key("AAPL"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("MSFT"), range(), LoadMode::Full).is_some());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = FrameCache::new(2);
        cache.put(&key("A"), range(), LoadMode::Full, vec![], QualityReport::default());
        cache.put(&key("B"), range(), LoadMode::Full, vec![], QualityReport::default());
        cache.put(&key("C"), range(), LoadMode::Full, vec![], QualityReport::default());
        assert!(cache.get(&key("A"), range(), LoadMode::Full).is_none());
        assert!(cache.get(&key("C"), range(), LoadMode::Full).is_some());
    }
}
