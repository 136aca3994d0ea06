/// RAM tier: bounded LRU of recently served, unranged windows
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::types::{Bar, SeriesKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub series: SeriesKey,
    pub limit: usize,
}

pub struct WindowCache {
    windows: LruCache<WindowKey, Vec<Bar>>,
}

impl WindowCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        WindowCache {
            windows: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, key: &WindowKey) -> Option<Vec<Bar>> {
        self.windows.get(key).cloned()
    }

    pub fn put(&mut self, key: WindowKey, bars: Vec<Bar>) {
        self.windows.put(key, bars);
    }

    /// Drop every cached window of a series; returns how many were dropped
    pub fn invalidate(&mut self, series: &SeriesKey) -> usize {
        let stale: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(key, _)| &key.series == series)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.windows.pop(key);
        }
        if !stale.is_empty() {
            debug!("Invalidated {} RAM window(s) for {}", stale.len(), series);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    #[test]
    fn test_invalidate_only_touches_series() {
        let mut cache = WindowCache::new(4);
        let m5 = SeriesKey::new("X", Timeframe::M5);
        let h1 = SeriesKey::new("X", Timeframe::H1);
        cache.put(WindowKey { series: m5.clone(), limit: 10 }, Vec::new());
        cache.put(WindowKey { series: m5.clone(), limit: 50 }, Vec::new());
        cache.put(WindowKey { series: h1.clone(), limit: 10 }, Vec::new());

        assert_eq!(cache.invalidate(&m5), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&WindowKey { series: h1, limit: 10 }).is_some());
    }
}
