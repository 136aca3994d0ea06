/// Snapshot tier: latest bar + bounded tail per series, TTL-bound
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{Bar, Provenance, SeriesKey, StoreConfig};

/// "Latest bar" record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub bar: Bar,
    pub seq: u64,
    pub provenance: Provenance,
    pub complete: bool,
    pub payload_ts_ms: i64,
}

impl SnapshotRecord {
    pub fn new(bar: Bar, seq: u64) -> Self {
        SnapshotRecord {
            provenance: bar.provenance(),
            complete: bar.is_complete(),
            payload_ts_ms: Utc::now().timestamp_millis(),
            bar,
            seq,
        }
    }
}

/// "Tail" record: the last N completed bars, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TailRecord {
    pub bars: Vec<Bar>,
    /// Sequence number of the update that last touched the tail
    pub seq: u64,
    pub payload_ts_ms: i64,
}

/// Snapshot tier client. Every call may fail with `TierUnavailable`;
/// callers degrade, they never escalate.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// Replace the latest record and, for a completed bar, upsert it into the tail
    async fn store(&self, record: SnapshotRecord) -> Result<()>;

    async fn latest(&self, series: &SeriesKey) -> Result<Option<SnapshotRecord>>;

    async fn tail(&self, series: &SeriesKey) -> Result<Option<TailRecord>>;
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn live(&self) -> bool {
        Instant::now() <= self.expires_at
    }
}

/// In-process snapshot tier: two LRU maps with per-entry expiry
pub struct InMemorySnapshotCache {
    latest: Mutex<LruCache<SeriesKey, Entry<SnapshotRecord>>>,
    tails: Mutex<LruCache<SeriesKey, Entry<TailRecord>>>,
    ttl: Duration,
    tail_len: usize,
}

impl InMemorySnapshotCache {
    pub fn new(capacity: usize, ttl: Duration, tail_len: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        InMemorySnapshotCache {
            latest: Mutex::new(LruCache::new(cap)),
            tails: Mutex::new(LruCache::new(cap)),
            ttl,
            tail_len: tail_len.max(1),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        InMemorySnapshotCache::new(
            config.snapshot_capacity,
            Duration::from_secs(config.snapshot_ttl_sec),
            config.snapshot_tail_len,
        )
    }
}

#[async_trait]
impl SnapshotCache for InMemorySnapshotCache {
    async fn store(&self, record: SnapshotRecord) -> Result<()> {
        let series = record.bar.series();
        let expires_at = Instant::now() + self.ttl;

        if record.complete {
            let mut tails = self.tails.lock().await;
            // An expired tail may have holes; restart it from this bar
            let mut tail = match tails.pop(&series) {
                Some(entry) if entry.live() => entry.value,
                _ => TailRecord::default(),
            };

            let open = record.bar.open_time_ms();
            match tail.bars.binary_search_by_key(&open, Bar::open_time_ms) {
                Ok(idx) => tail.bars[idx] = record.bar.clone(),
                Err(idx) => tail.bars.insert(idx, record.bar.clone()),
            }
            if tail.bars.len() > self.tail_len {
                let excess = tail.bars.len() - self.tail_len;
                tail.bars.drain(..excess);
            }
            tail.seq = record.seq;
            tail.payload_ts_ms = record.payload_ts_ms;

            tails.put(series.clone(), Entry { value: tail, expires_at });
        }

        let mut latest = self.latest.lock().await;
        let newer = match latest.get(&series) {
            Some(entry) if entry.live() => {
                entry.value.bar.open_time_ms() <= record.bar.open_time_ms()
            }
            _ => true,
        };
        if newer {
            latest.put(series, Entry { value: record, expires_at });
        }
        Ok(())
    }

    async fn latest(&self, series: &SeriesKey) -> Result<Option<SnapshotRecord>> {
        let mut guard = self.latest.lock().await;
        if let Some(entry) = guard.get(series) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        guard.pop(series);
        Ok(None)
    }

    async fn tail(&self, series: &SeriesKey) -> Result<Option<TailRecord>> {
        let mut guard = self.tails.lock().await;
        if let Some(entry) = guard.get(series) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        guard.pop(series);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarParts, Extensions, Timeframe};

    fn m5(open_min: i64, close: f64, complete: bool) -> Bar {
        let open = open_min * 60_000;
        Bar::try_from(BarParts {
            instrument: "EURUSD".to_string(),
            timeframe: Timeframe::M5,
            open_time_ms: open,
            close_time_ms: open + 300_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 1.0,
            complete,
            provenance: Provenance::Derived,
            written_at_ms: 0,
            extensions: Extensions::new(),
        })
        .unwrap()
    }

    fn series() -> SeriesKey {
        SeriesKey::new("EURUSD", Timeframe::M5)
    }

    #[tokio::test]
    async fn test_tail_bounded_and_ordered() {
        let cache = InMemorySnapshotCache::new(8, Duration::from_secs(60), 3);
        for (seq, open) in [(1, 10), (2, 0), (3, 5), (4, 15), (5, 20)] {
            cache.store(SnapshotRecord::new(m5(open, 1.0, true), seq)).await.unwrap();
        }

        let tail = cache.tail(&series()).await.unwrap().unwrap();
        let opens: Vec<i64> = tail.bars.iter().map(|b| b.open_time_ms() / 60_000).collect();
        assert_eq!(opens, vec![10, 15, 20]);
        assert_eq!(tail.seq, 5);

        let latest = cache.latest(&series()).await.unwrap().unwrap();
        assert_eq!(latest.bar.open_time_ms(), 20 * 60_000);
    }

    #[tokio::test]
    async fn test_forming_bar_updates_latest_only() {
        let cache = InMemorySnapshotCache::new(8, Duration::from_secs(60), 3);
        cache.store(SnapshotRecord::new(m5(0, 1.0, true), 1)).await.unwrap();
        cache.store(SnapshotRecord::new(m5(5, 1.4, false), 2)).await.unwrap();

        let latest = cache.latest(&series()).await.unwrap().unwrap();
        assert!(!latest.complete);
        assert_eq!(latest.seq, 2);
        assert_eq!(cache.tail(&series()).await.unwrap().unwrap().bars.len(), 1);
    }

    #[tokio::test]
    async fn test_revision_replaces_tail_slot() {
        let cache = InMemorySnapshotCache::new(8, Duration::from_secs(60), 3);
        cache.store(SnapshotRecord::new(m5(0, 1.0, true), 1)).await.unwrap();
        cache.store(SnapshotRecord::new(m5(0, 1.3, true), 2)).await.unwrap();

        let tail = cache.tail(&series()).await.unwrap().unwrap();
        assert_eq!(tail.bars.len(), 1);
        assert_eq!(tail.bars[0].close(), 1.3);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemorySnapshotCache::new(8, Duration::from_millis(0), 3);
        cache.store(SnapshotRecord::new(m5(0, 1.0, true), 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.latest(&series()).await.unwrap().is_none());
        assert!(cache.tail(&series()).await.unwrap().is_none());
    }
}
