/// Broker history ingestion: fetch M1 -> reconcile -> commit -> cascade -> commit
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::data::cascade::Cascade;
use crate::data::geometry::{reconcile, GeometryReport};
use crate::data::store::{CommitReceipt, CommitStatus, TieredStore};
use crate::error::{CandleError, Result};
use crate::types::{Bar, Timeframe};

/// Broker-history collaborator
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `count` completed bars ending at or before `end_ms`, oldest first
    async fn fetch(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        count: usize,
        end_ms: i64,
    ) -> Result<Vec<Bar>>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub instrument: String,
    pub fetched: usize,
    /// Wrong series or still forming
    pub rejected: usize,
    pub committed: usize,
    pub already_committed: usize,
    pub derived: usize,
    pub derived_committed: usize,
    pub degraded_commits: usize,
    pub geometry: Option<GeometryReport>,
}

impl SyncReport {
    fn new(instrument: &str) -> Self {
        SyncReport {
            instrument: instrument.to_string(),
            ..SyncReport::default()
        }
    }

    fn count(&mut self, receipt: &CommitReceipt, derived: bool) {
        match (receipt.status, derived) {
            (CommitStatus::Appended, false) => self.committed += 1,
            (CommitStatus::Appended, true) => self.derived_committed += 1,
            (CommitStatus::AlreadyCommitted, _) => self.already_committed += 1,
            (CommitStatus::Relayed, _) => {}
        }
        if receipt.is_degraded() {
            self.degraded_commits += 1;
        }
    }
}

async fn cascade_and_commit(
    cascade: &Cascade,
    store: &TieredStore,
    bar: Bar,
    report: &mut SyncReport,
) -> Result<()> {
    for derived in cascade.ingest(bar)? {
        report.derived += 1;
        let receipt = store.commit_final_bar(derived).await?;
        report.count(&receipt, true);
    }
    Ok(())
}

/// Pull an M1 batch from the broker, persist it and everything it derives
pub async fn sync_history(
    source: &dyn HistorySource,
    cascade: &Cascade,
    store: &TieredStore,
    instrument: &str,
    count: usize,
    end_ms: i64,
) -> Result<SyncReport> {
    info!("📥 Syncing {} M1 bar(s) for {} ending {}", count, instrument, end_ms);

    let batch = source
        .fetch(instrument, Timeframe::M1, count, end_ms)
        .await
        .map_err(|e| match e {
            CandleError::HistorySource(_) => e,
            other => CandleError::HistorySource(other.to_string()),
        })?;

    let mut report = SyncReport::new(instrument);
    report.fetched = batch.len();

    let mut accepted = Vec::with_capacity(batch.len());
    for bar in batch {
        if bar.instrument() != instrument || bar.timeframe() != Timeframe::M1 || !bar.is_complete() {
            warn!(
                "⚠️  Rejecting {} {} @ {} from {} M1 history (complete={})",
                bar.instrument(),
                bar.timeframe(),
                bar.open_time_ms(),
                instrument,
                bar.is_complete()
            );
            report.rejected += 1;
            continue;
        }
        accepted.push(bar);
    }

    let (accepted, geometry) = reconcile(accepted);
    report.geometry = geometry;

    for bar in accepted {
        let receipt = match store.commit_final_bar(bar.clone()).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!("❌ History sync for {} stopped: {}", instrument, e);
                return Err(e);
            }
        };
        report.count(&receipt, false);
        cascade_and_commit(cascade, store, bar, &mut report).await?;
    }

    info!(
        "✅ Synced {}: fetched={}, committed={}, already={}, derived={}, derived_committed={}",
        instrument,
        report.fetched,
        report.committed,
        report.already_committed,
        report.derived,
        report.derived_committed
    );
    if report.degraded_commits > 0 {
        warn!("⚠️  {} commit(s) for {} ran degraded", report.degraded_commits, instrument);
    }

    Ok(report)
}

/// Re-run the cascade over one stored M1 day and commit what it derives
pub async fn rebuild_day(
    cascade: &Cascade,
    store: &TieredStore,
    instrument: &str,
    day: NaiveDate,
) -> Result<SyncReport> {
    info!("🔁 Rebuilding derived timeframes for {} on {}", instrument, day);

    let read = store.disk().read_day(instrument, Timeframe::M1, day).await?;
    let mut report = SyncReport::new(instrument);
    report.fetched = read.bars.len();
    report.rejected = read.malformed;

    let (bars, geometry) = reconcile(read.bars);
    report.geometry = geometry;

    for bar in bars {
        cascade_and_commit(cascade, store, bar, &mut report).await?;
    }

    info!(
        "✅ Rebuilt {} {}: {} input(s), {} derived, {} appended",
        instrument, day, report.fetched, report.derived, report.derived_committed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarParts, Extensions, Provenance, StoreConfig};

    const WED_0900: i64 = 1_704_272_400_000;

    struct FixedSource(Vec<Bar>);

    #[async_trait]
    impl HistorySource for FixedSource {
        async fn fetch(&self, _: &str, _: Timeframe, _: usize, _: i64) -> Result<Vec<Bar>> {
            Ok(self.0.clone())
        }
    }

    struct DownSource;

    #[async_trait]
    impl HistorySource for DownSource {
        async fn fetch(&self, _: &str, _: Timeframe, _: usize, _: i64) -> Result<Vec<Bar>> {
            Err(CandleError::InternalError("session expired".to_string()))
        }
    }

    fn m1(minute: i64) -> Bar {
        let open = WED_0900 + minute * 60_000;
        Bar::new(
            BarParts {
                instrument: "X".to_string(),
                timeframe: Timeframe::M1,
                open_time_ms: open,
                close_time_ms: open + 60_000,
                open: 1.0,
                high: 1.5,
                low: 0.5,
                close: 1.2,
                volume: 2.0,
                complete: true,
                provenance: Provenance::RawHistory,
                written_at_ms: 0,
                extensions: Extensions::new(),
            },
            0,
        )
        .unwrap()
    }

    fn setup(dir: &tempfile::TempDir) -> (Cascade, TieredStore) {
        let config = StoreConfig {
            data_root: dir.path().to_string_lossy().to_string(),
            ..StoreConfig::default()
        };
        (Cascade::from_config(&config), TieredStore::from_config(config))
    }

    #[tokio::test]
    async fn test_sync_commits_raw_and_derived() {
        let dir = tempfile::tempdir().unwrap();
        let (cascade, store) = setup(&dir);
        // duplicated minute 2 is collapsed before commit
        let mut batch: Vec<Bar> = (0..5).map(m1).collect();
        batch.push(m1(2));
        let source = FixedSource(batch);

        let report = sync_history(&source, &cascade, &store, "X", 5, WED_0900 + 300_000)
            .await
            .unwrap();
        assert_eq!(report.fetched, 6);
        assert_eq!(report.committed, 5);
        assert!(report.geometry.is_some());
        // M3 @ 09:00 and M5 @ 09:00
        assert_eq!(report.derived, 2);
        assert_eq!(report.derived_committed, 2);
        assert_eq!(store.watermark("X", Timeframe::M5).await, Some(WED_0900));

        let again = sync_history(&source, &cascade, &store, "X", 5, WED_0900 + 300_000)
            .await
            .unwrap();
        assert_eq!(again.committed, 0);
        assert_eq!(again.already_committed, 7);
    }

    #[tokio::test]
    async fn test_source_failure_is_history_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cascade, store) = setup(&dir);
        let err = sync_history(&DownSource, &cascade, &store, "X", 5, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CandleError::HistorySource(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_rebuild_day_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = setup(&dir);
        for minute in 0..5 {
            store.commit_final_bar(m1(minute)).await.unwrap();
        }

        let (cascade, _) = setup(&dir);
        let day = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let report = rebuild_day(&cascade, &store, "X", day).await.unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(report.derived_committed, 2);
    }
}
