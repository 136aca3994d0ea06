/// Tiered Bar Store - RAM windows + snapshot cache + append-only disk log
/// Disk is the source of truth; the other tiers are best-effort accelerators
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::data::day_index::DayIndex;
use crate::data::disk_log::{utc_day, DiskLog};
use crate::data::geometry::{reconcile, GeometryReport};
use crate::data::snapshot_cache::{InMemorySnapshotCache, SnapshotCache, SnapshotRecord};
use crate::data::window_cache::{WindowCache, WindowKey};
use crate::error::{CandleError, Result};
use crate::events::change_feed::ChangeFeed;
use crate::events::types::{ChangeEvent, ChangeKind};
use crate::types::{Bar, BarKey, SeriesKey, StoreConfig, Timeframe};
use crate::utils::digest::bar_digest;

/// Which tier answered a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Ram,
    Snapshot,
    Disk,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Ram => "ram",
            Tier::Snapshot => "snapshot",
            Tier::Disk => "disk",
        })
    }
}

/// Caller-visible degraded-mode or self-healing notice
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreWarning {
    /// Snapshot tier failed during a read; the next tier answered
    SnapshotUnavailable { reason: String },
    /// Cold load asked for, but no minimum-bars threshold is configured
    SnapshotGateMissing { timeframe: Timeframe },
    /// A non-authoritative tier failed after the disk append succeeded
    DegradedCommit { tier: String, reason: String },
    Geometry(GeometryReport),
    MalformedRecords { count: usize },
    FeedGap { since_seq: u64, evicted_through: u64 },
}

impl fmt::Display for StoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreWarning::SnapshotUnavailable { reason } => {
                write!(f, "snapshot tier unavailable: {}", reason)
            }
            StoreWarning::SnapshotGateMissing { timeframe } => write!(
                f,
                "no snapshot min-bars threshold for {}, snapshot skipped",
                timeframe
            ),
            StoreWarning::DegradedCommit { tier, reason } => {
                write!(f, "committed to disk but {} update failed: {}", tier, reason)
            }
            StoreWarning::Geometry(report) => write!(f, "{}", report),
            StoreWarning::MalformedRecords { count } => {
                write!(f, "{} malformed disk record(s) skipped", count)
            }
            StoreWarning::FeedGap {
                since_seq,
                evicted_through,
            } => write!(
                f,
                "cursor {} predates retained feed (events through {} dropped)",
                since_seq, evicted_through
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DegradedCounters {
    pub snapshot_write_failures: u64,
    pub snapshot_read_failures: u64,
    pub geometry_corrections: u64,
    pub malformed_records: u64,
}

#[derive(Default)]
struct DegradedStats {
    snapshot_write_failures: AtomicU64,
    snapshot_read_failures: AtomicU64,
    geometry_corrections: AtomicU64,
    malformed_records: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    /// Appended to the disk log
    Appended,
    /// Identical content already on disk; nothing written
    AlreadyCommitted,
    /// Forming bar relayed to the feed and snapshot tier only
    Relayed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    pub status: CommitStatus,
    /// Feed sequence number, when the content changed
    pub seq: Option<u64>,
    pub watermark: Option<i64>,
    pub warnings: Vec<StoreWarning>,
}

impl CommitReceipt {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// `read_window` parameters. Range bounds are inclusive on open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub limit: usize,
    pub since_ms: Option<i64>,
    pub to_ms: Option<i64>,
    /// Bypass RAM and snapshot tiers
    pub disk_only: bool,
    /// First read after start: the snapshot tail may answer
    pub cold_load: bool,
}

impl ReadRequest {
    pub fn new(instrument: &str, timeframe: Timeframe, limit: usize) -> Self {
        ReadRequest {
            instrument: instrument.to_string(),
            timeframe,
            limit,
            since_ms: None,
            to_ms: None,
            disk_only: false,
            cold_load: false,
        }
    }

    pub fn since(mut self, since_ms: i64) -> Self {
        self.since_ms = Some(since_ms);
        self
    }

    pub fn to(mut self, to_ms: i64) -> Self {
        self.to_ms = Some(to_ms);
        self
    }

    pub fn disk_only(mut self) -> Self {
        self.disk_only = true;
        self
    }

    pub fn cold_load(mut self) -> Self {
        self.cold_load = true;
        self
    }

    pub fn is_ranged(&self) -> bool {
        self.since_ms.is_some() || self.to_ms.is_some()
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(&self.instrument, self.timeframe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadMeta {
    pub tier: Tier,
    /// Explicit no-data marker
    pub no_data: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    /// Ascending by open time, one bar per key
    pub bars: Vec<Bar>,
    pub warnings: Vec<StoreWarning>,
    pub meta: ReadMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatesResult {
    pub events: Vec<ChangeEvent>,
    pub cursor_seq: u64,
    pub warnings: Vec<StoreWarning>,
    pub meta: ReadMeta,
}

pub struct TieredStore {
    config: StoreConfig,
    disk: DiskLog,
    snapshot: Arc<dyn SnapshotCache>,
    windows: Mutex<WindowCache>,
    day_index: Mutex<DayIndex>,
    watermarks: RwLock<HashMap<SeriesKey, i64>>,
    feed: ChangeFeed,
    degraded: DegradedStats,
}

impl TieredStore {
    pub fn new(config: StoreConfig, snapshot: Arc<dyn SnapshotCache>) -> Self {
        TieredStore {
            disk: DiskLog::new(&config.data_root),
            windows: Mutex::new(WindowCache::new(config.ram_window_capacity)),
            day_index: Mutex::new(DayIndex::new()),
            watermarks: RwLock::new(HashMap::new()),
            feed: ChangeFeed::from_config(&config),
            degraded: DegradedStats::default(),
            snapshot,
            config,
        }
    }

    /// Store with the in-process snapshot tier
    pub fn from_config(config: StoreConfig) -> Self {
        let snapshot = Arc::new(InMemorySnapshotCache::from_config(&config));
        TieredStore::new(config, snapshot)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn disk(&self) -> &DiskLog {
        &self.disk
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    pub fn degraded(&self) -> DegradedCounters {
        DegradedCounters {
            snapshot_write_failures: self.degraded.snapshot_write_failures.load(Ordering::Relaxed),
            snapshot_read_failures: self.degraded.snapshot_read_failures.load(Ordering::Relaxed),
            geometry_corrections: self.degraded.geometry_corrections.load(Ordering::Relaxed),
            malformed_records: self.degraded.malformed_records.load(Ordering::Relaxed),
        }
    }

    async fn ensure_day_loaded(&self, instrument: &str, timeframe: Timeframe, open_time_ms: i64) -> Result<()> {
        let day = utc_day(open_time_ms);
        if self.day_index.lock().await.is_loaded(instrument, timeframe, day) {
            return Ok(());
        }

        let read = self.disk.read_day(instrument, timeframe, day).await?;
        let count = read.bars.len();
        self.day_index
            .lock()
            .await
            .load(instrument, timeframe, day, read.bars.iter().map(Bar::open_time_ms));
        debug!("Loaded day index {} {} {}: {} bar(s)", instrument, timeframe, day, count);
        Ok(())
    }

    /// Is this bucket already in the disk log?
    pub async fn has_on_disk(&self, key: &BarKey) -> Result<bool> {
        self.ensure_day_loaded(&key.instrument, key.timeframe, key.open_time_ms)
            .await?;
        let day = utc_day(key.open_time_ms);
        Ok(self
            .day_index
            .lock()
            .await
            .contains(&key.instrument, key.timeframe, day, key.open_time_ms)
            .unwrap_or(false))
    }

    pub async fn mark_on_disk(&self, key: &BarKey) -> Result<()> {
        self.ensure_day_loaded(&key.instrument, key.timeframe, key.open_time_ms)
            .await?;
        let day = utc_day(key.open_time_ms);
        self.day_index
            .lock()
            .await
            .insert(&key.instrument, key.timeframe, day, key.open_time_ms);
        Ok(())
    }

    /// Digest of the newest on-disk record at a key
    async fn disk_digest(&self, key: &BarKey) -> Result<Option<String>> {
        let read = self
            .disk
            .read_day(&key.instrument, key.timeframe, utc_day(key.open_time_ms))
            .await?;
        Ok(read
            .bars
            .iter()
            .rev()
            .find(|b| b.open_time_ms() == key.open_time_ms)
            .map(bar_digest))
    }

    pub async fn watermark(&self, instrument: &str, timeframe: Timeframe) -> Option<i64> {
        self.watermarks
            .read()
            .await
            .get(&SeriesKey::new(instrument, timeframe))
            .copied()
    }

    async fn advance_watermark(&self, series: &SeriesKey, open_time_ms: i64) -> i64 {
        let mut watermarks = self.watermarks.write().await;
        let mark = watermarks.entry(series.clone()).or_insert(open_time_ms);
        if open_time_ms > *mark {
            *mark = open_time_ms;
        }
        *mark
    }

    /// Rebuild the watermark for a series from the newest day file
    pub async fn recover_watermark(&self, instrument: &str, timeframe: Timeframe) -> Result<Option<i64>> {
        match self.disk.last_open_time(instrument, timeframe).await? {
            Some(last) => {
                let mark = self
                    .advance_watermark(&SeriesKey::new(instrument, timeframe), last)
                    .await;
                info!("Recovered watermark for {} {}: {}", instrument, timeframe, mark);
                Ok(Some(mark))
            }
            None => {
                debug!("No disk history for {} {}, watermark unset", instrument, timeframe);
                Ok(self.watermark(instrument, timeframe).await)
            }
        }
    }

    /// Persist a completed bar. The disk append alone decides success.
    pub async fn commit_final_bar(&self, bar: Bar) -> Result<CommitReceipt> {
        if !bar.is_complete() {
            return Err(CandleError::InvalidParameter(format!(
                "{} {} @ {} is still forming",
                bar.instrument(),
                bar.timeframe(),
                bar.open_time_ms()
            )));
        }

        let key = bar.key();
        let series = key.series();

        if self.has_on_disk(&key).await? {
            let digest = bar_digest(&bar);
            let previous = match self.feed.last_digest(&key) {
                Some(previous) => Some(previous),
                None => self.disk_digest(&key).await?,
            };
            if previous.map_or(true, |previous| previous == digest) {
                debug!("{} @ {} already committed, skipping append", series, key.open_time_ms);
                return Ok(CommitReceipt {
                    status: CommitStatus::AlreadyCommitted,
                    seq: None,
                    watermark: self.watermark(&key.instrument, key.timeframe).await,
                    warnings: Vec::new(),
                });
            }
            info!("Correction for {} @ {}, appending revision", series, key.open_time_ms);
        }

        if let Err(e) = self.disk.append(&bar).await {
            error!(
                "❌ Commit failed for {} @ {}: {} ({})",
                series,
                key.open_time_ms,
                e,
                e.error_code()
            );
            return Err(e);
        }

        // Day already loaded by has_on_disk above
        self.day_index.lock().await.insert(
            &key.instrument,
            key.timeframe,
            utc_day(key.open_time_ms),
            key.open_time_ms,
        );
        let watermark = self.advance_watermark(&series, key.open_time_ms).await;
        self.windows.lock().await.invalidate(&series);
        let seq = self.feed.record(&bar, ChangeKind::Committed);

        let mut warnings = Vec::new();
        let record = SnapshotRecord::new(bar, seq.unwrap_or_else(|| self.feed.latest_seq()));
        if let Err(e) = self.snapshot.store(record).await {
            self.degraded
                .snapshot_write_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "⚠️  Snapshot update failed for {} @ {} (commit stands): {}",
                series, key.open_time_ms, e
            );
            warnings.push(StoreWarning::DegradedCommit {
                tier: Tier::Snapshot.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(CommitReceipt {
            status: CommitStatus::Appended,
            seq,
            watermark: Some(watermark),
            warnings,
        })
    }

    /// Relay a forming bar to the change feed and snapshot "latest" record
    pub async fn publish_forming(&self, bar: Bar) -> Result<CommitReceipt> {
        if bar.is_complete() {
            return Err(CandleError::InvalidParameter(format!(
                "{} {} @ {} is complete, commit it instead",
                bar.instrument(),
                bar.timeframe(),
                bar.open_time_ms()
            )));
        }

        let watermark = self.watermark(bar.instrument(), bar.timeframe()).await;
        let seq = self.feed.record(&bar, ChangeKind::Forming);
        let mut warnings = Vec::new();

        if let Some(seq) = seq {
            let series = bar.series();
            if let Err(e) = self.snapshot.store(SnapshotRecord::new(bar, seq)).await {
                self.degraded
                    .snapshot_write_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!("⚠️  Snapshot update failed for forming {}: {}", series, e);
                warnings.push(StoreWarning::DegradedCommit {
                    tier: Tier::Snapshot.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(CommitReceipt {
            status: CommitStatus::Relayed,
            seq,
            watermark,
            warnings,
        })
    }

    fn finish(&self, bars: Vec<Bar>, limit: usize, tier: Tier, mut warnings: Vec<StoreWarning>) -> ReadResult {
        let (mut bars, report) = reconcile(bars);
        if let Some(report) = report {
            self.degraded
                .geometry_corrections
                .fetch_add(1, Ordering::Relaxed);
            warnings.push(StoreWarning::Geometry(report));
        }
        if bars.len() > limit {
            let excess = bars.len() - limit;
            bars.drain(..excess);
        }
        ReadResult {
            meta: ReadMeta {
                tier,
                no_data: bars.is_empty(),
            },
            bars,
            warnings,
        }
    }

    /// Newest `limit` bars of a series, optionally within `[since, to]`
    pub async fn read_window(&self, request: &ReadRequest) -> Result<ReadResult> {
        let series = request.series();
        let mut warnings = Vec::new();

        if !request.disk_only {
            if request.cold_load && !request.is_ranged() {
                match self.config.min_bars_for(request.timeframe) {
                    None => {
                        debug!("No snapshot threshold for {}, skipping snapshot tier", request.timeframe);
                        warnings.push(StoreWarning::SnapshotGateMissing {
                            timeframe: request.timeframe,
                        });
                    }
                    Some(min_bars) => match self.snapshot.tail(&series).await {
                        Ok(Some(tail)) if tail.bars.len() >= min_bars.max(1) => {
                            debug!("Cold load of {} served from snapshot ({} bars)", series, tail.bars.len());
                            return Ok(self.finish(tail.bars, request.limit, Tier::Snapshot, warnings));
                        }
                        Ok(tail) => debug!(
                            "Snapshot tail for {} below threshold ({} < {})",
                            series,
                            tail.map_or(0, |t| t.bars.len()),
                            min_bars
                        ),
                        Err(e) => {
                            self.degraded
                                .snapshot_read_failures
                                .fetch_add(1, Ordering::Relaxed);
                            warn!("⚠️  Snapshot read failed for {}, falling through: {}", series, e);
                            warnings.push(StoreWarning::SnapshotUnavailable {
                                reason: e.to_string(),
                            });
                        }
                    },
                }
            }

            if !request.is_ranged() {
                let key = WindowKey {
                    series: series.clone(),
                    limit: request.limit,
                };
                if let Some(bars) = self.windows.lock().await.get(&key) {
                    return Ok(self.finish(bars, request.limit, Tier::Ram, warnings));
                }
            }
        }

        let read = self
            .disk
            .read_range(
                &request.instrument,
                request.timeframe,
                request.since_ms,
                request.to_ms,
                request.limit,
            )
            .await?;
        if read.malformed > 0 {
            self.degraded
                .malformed_records
                .fetch_add(read.malformed as u64, Ordering::Relaxed);
            warnings.push(StoreWarning::MalformedRecords {
                count: read.malformed,
            });
        }

        let result = self.finish(read.bars, request.limit, Tier::Disk, warnings);
        if !request.is_ranged() && !request.disk_only {
            self.windows.lock().await.put(
                WindowKey {
                    series,
                    limit: request.limit,
                },
                result.bars.clone(),
            );
        }
        Ok(result)
    }

    /// Feed events for a series after `since_seq`
    pub async fn read_updates(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        since_seq: u64,
        limit: usize,
    ) -> Result<UpdatesResult> {
        let read = self
            .feed
            .read(&SeriesKey::new(instrument, timeframe), since_seq, limit);

        let mut warnings = Vec::new();
        if let Some(gap) = read.gap {
            warn!(
                "⚠️  {} {} cursor {} older than retained feed (dropped through {})",
                instrument, timeframe, gap.since_seq, gap.evicted_through
            );
            warnings.push(StoreWarning::FeedGap {
                since_seq: gap.since_seq,
                evicted_through: gap.evicted_through,
            });
        }

        Ok(UpdatesResult {
            meta: ReadMeta {
                tier: Tier::Ram,
                no_data: read.events.is_empty(),
            },
            events: read.events,
            cursor_seq: read.cursor_seq,
            warnings,
        })
    }
}
