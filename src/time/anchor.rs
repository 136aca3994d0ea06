/// Bucket flooring and anchor-offset selection
use serde::Deserialize;
use tracing::debug;

use crate::types::{AnchorClass, Timeframe};

/// Start of the bucket containing `ts_ms` for `timeframe`, shifted by `anchor_s`.
/// Euclidean division keeps pre-epoch timestamps flooring downwards.
pub fn bucket_start(ts_ms: i64, timeframe: Timeframe, anchor_s: i64) -> i64 {
    let tf_ms = timeframe.millis();
    let anchor_ms = anchor_s * 1000;
    (ts_ms - anchor_ms).div_euclid(tf_ms) * tf_ms + anchor_ms
}

/// Acceptance predicate: under `anchor_s`, the `base` bar opening at
/// `reference_open_ms` is the last slot of its `timeframe` bucket.
pub fn closes_bucket(
    reference_open_ms: i64,
    timeframe: Timeframe,
    base: Timeframe,
    anchor_s: i64,
) -> bool {
    bucket_start(reference_open_ms, timeframe, anchor_s) + timeframe.millis() - base.millis()
        == reference_open_ms
}

/// Primary anchor plus broker DST alternates for one timeframe class
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AnchorOffsets {
    pub primary_s: i64,
    pub alternates_s: Vec<i64>,
}

impl AnchorOffsets {
    pub fn new(primary_s: i64, alternates_s: Vec<i64>) -> Self {
        AnchorOffsets {
            primary_s,
            alternates_s,
        }
    }

    /// Candidates in trial order: primary first, then alternates
    pub fn candidates(&self) -> impl Iterator<Item = i64> + '_ {
        std::iter::once(self.primary_s).chain(self.alternates_s.iter().copied())
    }
}

/// Anchor offsets per timeframe class
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AnchorTable {
    pub sub_4h: AnchorOffsets,
    pub four_hour: AnchorOffsets,
    pub daily: AnchorOffsets,
}

impl AnchorTable {
    pub fn for_class(&self, class: AnchorClass) -> &AnchorOffsets {
        match class {
            AnchorClass::SubFourHour => &self.sub_4h,
            AnchorClass::FourHour => &self.four_hour,
            AnchorClass::Daily => &self.daily,
        }
    }

    pub fn for_timeframe(&self, timeframe: Timeframe) -> &AnchorOffsets {
        self.for_class(timeframe.anchor_class())
    }
}

/// Which candidate an anchor resolution settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorMatch {
    Primary,
    /// Index into `alternates_s`
    Alternate(usize),
    /// Nothing matched; primary used best-effort
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorResolution {
    pub anchor_s: i64,
    pub matched: AnchorMatch,
}

impl AnchorResolution {
    pub fn is_match(&self) -> bool {
        self.matched != AnchorMatch::Fallback
    }
}

/// Try primary then each alternate, accepting the first under which the
/// reference bar closes its bucket; fall back to primary otherwise.
pub fn resolve_anchor(
    offsets: &AnchorOffsets,
    reference_open_ms: i64,
    timeframe: Timeframe,
    base: Timeframe,
) -> AnchorResolution {
    for (idx, anchor_s) in offsets.candidates().enumerate() {
        if closes_bucket(reference_open_ms, timeframe, base, anchor_s) {
            let matched = match idx {
                0 => AnchorMatch::Primary,
                n => AnchorMatch::Alternate(n - 1),
            };
            return AnchorResolution { anchor_s, matched };
        }
    }

    debug!(
        "No anchor candidate closes {} bucket at reference {}, falling back to primary {}s",
        timeframe, reference_open_ms, offsets.primary_s
    );
    AnchorResolution {
        anchor_s: offsets.primary_s,
        matched: AnchorMatch::Fallback,
    }
}
