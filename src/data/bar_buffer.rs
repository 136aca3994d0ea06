/// Bounded buffer of completed lower-timeframe bars feeding the cascade
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::types::{Bar, BarKey, Timeframe};

/// LRU-evicted store of completed bars keyed by (instrument, timeframe, open)
pub struct BarBuffer {
    bars: LruCache<BarKey, Bar>,
}

impl BarBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        BarBuffer {
            bars: LruCache::new(capacity),
        }
    }

    /// Add a completed bar; incomplete (forming) bars are not buffered
    pub fn push(&mut self, bar: Bar) -> bool {
        if !bar.is_complete() {
            debug!(
                "Not buffering forming bar {} {} @ {}",
                bar.instrument(),
                bar.timeframe(),
                bar.open_time_ms()
            );
            return false;
        }
        let key = bar.key();
        if let Some((evicted, _)) = self.bars.push(key.clone(), bar) {
            if evicted == key {
                return true;
            }
            debug!(
                "Evicted {} {} @ {} from bar buffer",
                evicted.instrument, evicted.timeframe, evicted.open_time_ms
            );
        }
        true
    }

    /// Look up a slot, refreshing its recency
    pub fn get(&mut self, instrument: &str, timeframe: Timeframe, open_time_ms: i64) -> Option<&Bar> {
        let key = BarKey {
            instrument: instrument.to_string(),
            timeframe,
            open_time_ms,
        };
        self.bars.get(&key)
    }

    pub fn contains(&self, instrument: &str, timeframe: Timeframe, open_time_ms: i64) -> bool {
        let key = BarKey {
            instrument: instrument.to_string(),
            timeframe,
            open_time_ms,
        };
        self.bars.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}
