pub mod bar_buffer;
pub mod outage;
pub mod cascade;
pub mod geometry;
pub mod day_index;
pub mod disk_log;
pub mod snapshot_cache;
pub mod window_cache;
pub mod store;
pub mod history;

pub use bar_buffer::BarBuffer;
pub use cascade::{pause_artifact, Cascade, DeriveOutcome, PauseReason, SkipReason, SlotClass};
pub use disk_log::{DayRead, DiskLog};
pub use geometry::{better, reconcile, GeometryReport};
pub use history::{rebuild_day, sync_history, HistorySource, SyncReport};
pub use outage::{OutageCatalog, OutageConfig, OutageWindow};
pub use snapshot_cache::{InMemorySnapshotCache, SnapshotCache, SnapshotRecord, TailRecord};
pub use store::{
    CommitReceipt, CommitStatus, DegradedCounters, ReadMeta, ReadRequest, ReadResult,
    StoreWarning, Tier, TieredStore, UpdatesResult,
};
