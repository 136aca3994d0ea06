/// Change-feed event definitions
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{Bar, BarKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A completed bar was appended to the disk log
    Committed,
    /// A forming bar ticked; nothing was written to disk
    Forming,
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::Committed => "committed",
            ChangeKind::Forming => "forming",
        }
    }
}

/// One relayed revision of a bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub kind: ChangeKind,
    pub timestamp_ms: i64,
    /// Content digest of `bar`; a new event is emitted only when this changes
    pub digest: String,
    pub bar: Bar,
}

impl ChangeEvent {
    pub fn new(seq: u64, kind: ChangeKind, digest: String, bar: Bar) -> Self {
        ChangeEvent {
            seq,
            kind,
            timestamp_ms: Utc::now().timestamp_millis(),
            digest,
            bar,
        }
    }

    pub fn key(&self) -> BarKey {
        self.bar.key()
    }
}
