/// Change Feed - digest-gated, sequence-numbered bar revisions per series
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{ChangeEvent, ChangeKind};
use crate::types::{Bar, BarKey, SeriesKey, StoreConfig};
use crate::utils::digest::bar_digest;
use crate::utils::sync::lock;

/// The caller's cursor predates the retained window for a series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedGap {
    pub since_seq: u64,
    /// Highest sequence number already dropped from retention
    pub evicted_through: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FeedRead {
    pub events: Vec<ChangeEvent>,
    /// Last returned event's seq, or the caller's `since_seq` when none
    pub cursor_seq: u64,
    pub gap: Option<FeedGap>,
}

struct SeriesLog {
    /// Last emitted digest per open time. A key evicted from here re-emits
    /// once on its next publish, even if unchanged.
    digests: LruCache<i64, String>,
    events: VecDeque<ChangeEvent>,
    evicted_through: u64,
}

impl SeriesLog {
    fn new(digest_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(digest_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        SeriesLog {
            digests: LruCache::new(cap),
            events: VecDeque::new(),
            evicted_through: 0,
        }
    }
}

pub struct ChangeFeed {
    last_seq: AtomicU64,
    series: Mutex<HashMap<SeriesKey, SeriesLog>>,
    retention: usize,
    digest_capacity: usize,
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(retention: usize, digest_capacity: usize, channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity.max(1));
        ChangeFeed {
            last_seq: AtomicU64::new(0),
            series: Mutex::new(HashMap::new()),
            retention: retention.max(1),
            digest_capacity: digest_capacity.max(retention).max(1),
            tx,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        ChangeFeed::new(
            config.feed_retention,
            config.feed_digest_capacity,
            config.feed_channel_capacity,
        )
    }

    /// Live stream of every emitted event across all series
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn latest_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub fn last_digest(&self, key: &BarKey) -> Option<String> {
        lock(&self.series)
            .get(&key.series())
            .and_then(|log| log.digests.peek(&key.open_time_ms).cloned())
    }

    /// Emit an event for `bar` unless its content matches the last emission
    /// for the same key. Returns the new sequence number, if any.
    pub fn record(&self, bar: &Bar, kind: ChangeKind) -> Option<u64> {
        let digest = bar_digest(bar);
        let event = {
            let mut all = lock(&self.series);
            let log = all
                .entry(bar.series())
                .or_insert_with(|| SeriesLog::new(self.digest_capacity));

            if log.digests.peek(&bar.open_time_ms()) == Some(&digest) {
                debug!(
                    "Unchanged {} {} @ {}, no feed event",
                    bar.instrument(),
                    bar.timeframe(),
                    bar.open_time_ms()
                );
                return None;
            }

            // Assigned under the series lock so each series' log stays ordered
            let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
            log.digests.put(bar.open_time_ms(), digest.clone());
            let event = ChangeEvent::new(seq, kind, digest, bar.clone());
            log.events.push_back(event.clone());
            while log.events.len() > self.retention {
                if let Some(old) = log.events.pop_front() {
                    log.evicted_through = old.seq;
                }
            }
            event
        };

        let seq = event.seq;
        debug!(
            "Feed event #{} {} {} {} @ {}",
            seq,
            event.kind.as_str(),
            event.bar.instrument(),
            event.bar.timeframe(),
            event.bar.open_time_ms()
        );
        // No live subscribers is not an error
        let _ = self.tx.send(event);
        Some(seq)
    }

    /// Events for a series with `seq > since_seq`, oldest first
    pub fn read(&self, series: &SeriesKey, since_seq: u64, limit: usize) -> FeedRead {
        let all = lock(&self.series);
        let Some(log) = all.get(series) else {
            return FeedRead {
                cursor_seq: since_seq,
                ..FeedRead::default()
            };
        };

        let events: Vec<ChangeEvent> = log
            .events
            .iter()
            .filter(|e| e.seq > since_seq)
            .take(limit)
            .cloned()
            .collect();
        let gap = (log.evicted_through > since_seq).then_some(FeedGap {
            since_seq,
            evicted_through: log.evicted_through,
        });
        let cursor_seq = events.last().map_or(since_seq, |e| e.seq);

        FeedRead {
            events,
            cursor_seq,
            gap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarParts, Extensions, Provenance, Timeframe};

    fn m1(minute: i64, close: f64) -> Bar {
        let open = minute * 60_000;
        Bar::try_from(BarParts {
            instrument: "X".to_string(),
            timeframe: Timeframe::M1,
            open_time_ms: open,
            close_time_ms: open + 60_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 1.0,
            complete: true,
            provenance: Provenance::RawHistory,
            written_at_ms: 0,
            extensions: Extensions::new(),
        })
        .unwrap()
    }

    fn series() -> SeriesKey {
        SeriesKey::new("X", Timeframe::M1)
    }

    #[test]
    fn test_unchanged_bar_is_noop() {
        let feed = ChangeFeed::new(10, 100, 16);
        let first = feed.record(&m1(0, 1.5), ChangeKind::Committed);
        assert_eq!(first, Some(1));
        assert_eq!(feed.record(&m1(0, 1.5), ChangeKind::Committed), None);

        let read = feed.read(&series(), 0, 100);
        assert_eq!(read.events.len(), 1);
        assert_eq!(read.cursor_seq, 1);

        let again = feed.read(&series(), read.cursor_seq, 100);
        assert!(again.events.is_empty());
        assert_eq!(again.cursor_seq, 1);
    }

    #[test]
    fn test_revision_gets_greater_seq() {
        let feed = ChangeFeed::new(10, 100, 16);
        feed.record(&m1(0, 1.5), ChangeKind::Forming);
        let cursor = feed.read(&series(), 0, 100).cursor_seq;

        feed.record(&m1(0, 1.6), ChangeKind::Committed);
        let read = feed.read(&series(), cursor, 100);
        assert_eq!(read.events.len(), 1);
        assert!(read.events[0].seq > cursor);
        assert_eq!(read.events[0].kind, ChangeKind::Committed);
        assert_eq!(feed.last_digest(&m1(0, 1.6).key()), Some(bar_digest(&m1(0, 1.6))));
    }

    #[test]
    fn test_retention_reports_gap() {
        let feed = ChangeFeed::new(3, 100, 16);
        for minute in 0..5 {
            feed.record(&m1(minute, 1.0), ChangeKind::Committed);
        }
        let read = feed.read(&series(), 0, 100);
        assert_eq!(read.events.len(), 3);
        assert_eq!(read.events[0].seq, 3);
        assert_eq!(
            read.gap,
            Some(FeedGap {
                since_seq: 0,
                evicted_through: 2
            })
        );
        assert!(feed.read(&series(), 2, 100).gap.is_none());
    }

    #[test]
    fn test_unchanged_bar_after_retention_eviction_is_noop() {
        let feed = ChangeFeed::new(2, 100, 16);
        for minute in 0..5 {
            feed.record(&m1(minute, 1.0), ChangeKind::Forming);
        }
        // minute 0's event is long gone, its digest is not
        assert_eq!(feed.record(&m1(0, 1.0), ChangeKind::Forming), None);
        assert_eq!(feed.latest_seq(), 5);
        assert_eq!(feed.record(&m1(0, 1.1), ChangeKind::Forming), Some(6));
    }

    #[test]
    fn test_limit_and_unknown_series() {
        let feed = ChangeFeed::new(10, 100, 16);
        for minute in 0..4 {
            feed.record(&m1(minute, 1.0), ChangeKind::Committed);
        }
        let read = feed.read(&series(), 0, 2);
        assert_eq!(read.cursor_seq, 2);

        let other = feed.read(&SeriesKey::new("Y", Timeframe::M1), 7, 10);
        assert!(other.events.is_empty());
        assert_eq!(other.cursor_seq, 7);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let feed = ChangeFeed::new(10, 100, 16);
        let mut rx = feed.subscribe();
        feed.record(&m1(0, 1.0), ChangeKind::Committed);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.bar.close(), 1.0);
    }
}
