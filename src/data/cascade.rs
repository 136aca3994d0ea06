/// Derivation cascade: completed lower-timeframe bars -> higher-timeframe bars
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lru::LruCache;
use tracing::{debug, error, info};

use crate::data::bar_buffer::BarBuffer;
use crate::data::outage::OutageCatalog;
use crate::error::{CandleError, Result};
use crate::time::anchor::{bucket_start, resolve_anchor, AnchorTable};
use crate::time::calendar::{CalendarRegistry, TradingCalendar};
use crate::types::{ext, AnchorClass, Bar, BarParts, Extensions, Provenance, StoreConfig, Timeframe};
use crate::utils::sync::lock;

/// How an expected lower-timeframe slot was accounted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
    Present,
    /// Every minute of the slot is outside trading hours
    ExpectedClosed,
    /// Covered by the outage catalog
    KnownOutage,
    /// Missing while the market was open and no outage explains it
    Unexpected,
}

/// Why a present slot was treated as session-pause noise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    FlatZeroVolume,
    FlatLowVolume,
}

/// open == high == low == close with negligible volume
pub fn pause_artifact(bar: &Bar, volume_threshold: f64) -> Option<PauseReason> {
    let flat = bar.open() == bar.high() && bar.high() == bar.low() && bar.low() == bar.close();
    if !flat {
        return None;
    }
    if bar.volume() == 0.0 {
        Some(PauseReason::FlatZeroVolume)
    } else if bar.volume() <= volume_threshold {
        Some(PauseReason::FlatLowVolume)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No lower-timeframe slot was present (bucket entirely closed)
    NoInputs,
    /// Every present slot was a pause artifact
    AllPauseArtifacts,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeriveOutcome {
    Emitted(Bar),
    Deferred { unexpected_slots: Vec<i64> },
    Skipped(SkipReason),
}

impl DeriveOutcome {
    pub fn bar(&self) -> Option<&Bar> {
        match self {
            DeriveOutcome::Emitted(bar) => Some(bar),
            _ => None,
        }
    }
}

type BucketId = (String, Timeframe, i64);

/// Builds higher-timeframe bars from a bounded buffer of completed lower ones
pub struct Cascade {
    calendars: Arc<CalendarRegistry>,
    outages: OutageCatalog,
    anchors: AnchorTable,
    flat_volume_threshold: f64,
    buffer: Mutex<BarBuffer>,
    /// Anchor currently in force per (instrument, class), learned from session closes
    session_anchors: Mutex<HashMap<(String, AnchorClass), i64>>,
    /// Buckets that had unexpected gaps; re-tried when a late slot arrives.
    /// Bounded like the buffer: a bucket whose slots were evicted can never fill.
    deferred: Mutex<LruCache<BucketId, ()>>,
}

impl Cascade {
    pub fn new(
        calendars: Arc<CalendarRegistry>,
        outages: OutageCatalog,
        anchors: AnchorTable,
        buffer_capacity: usize,
        flat_volume_threshold: f64,
    ) -> Self {
        let deferred_capacity = NonZeroUsize::new(buffer_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Cascade {
            calendars,
            outages,
            anchors,
            flat_volume_threshold,
            buffer: Mutex::new(BarBuffer::new(buffer_capacity)),
            session_anchors: Mutex::new(HashMap::new()),
            deferred: Mutex::new(LruCache::new(deferred_capacity)),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let calendars = CalendarRegistry::from_config(&config.calendars);
        Cascade::new(
            Arc::new(calendars),
            OutageCatalog::from_config(&config.outages),
            config.anchors.clone(),
            config.buffer_capacity,
            config.flat_volume_threshold,
        )
    }

    /// Anchor offset in force for an instrument's timeframe
    pub fn anchor_for(&self, instrument: &str, timeframe: Timeframe) -> i64 {
        let class = timeframe.anchor_class();
        lock(&self.session_anchors)
            .get(&(instrument.to_string(), class))
            .copied()
            .unwrap_or_else(|| self.anchors.for_class(class).primary_s)
    }

    /// Bucket containing `ts_ms` under the instrument's current anchor
    pub fn bucket_start(&self, instrument: &str, timeframe: Timeframe, ts_ms: i64) -> i64 {
        bucket_start(ts_ms, timeframe, self.anchor_for(instrument, timeframe))
    }

    /// Account for a missing slot `[start_ms, start_ms + len_ms)`
    pub fn classify_absent(
        &self,
        calendar: &TradingCalendar,
        instrument: &str,
        start_ms: i64,
        len_ms: i64,
    ) -> SlotClass {
        if calendar.is_closed_throughout(start_ms, start_ms + len_ms) {
            SlotClass::ExpectedClosed
        } else if self.outages.covers(instrument, start_ms, start_ms + len_ms) {
            SlotClass::KnownOutage
        } else {
            SlotClass::Unexpected
        }
    }

    /// Produce zero or one `target` bar for the bucket opening at `bucket_open_ms`
    pub fn derive(
        &self,
        instrument: &str,
        target: Timeframe,
        bucket_open_ms: i64,
    ) -> Result<DeriveOutcome> {
        let anchor_s = self.anchor_for(instrument, target);
        self.derive_with_anchor(instrument, target, bucket_open_ms, anchor_s)
    }

    fn derive_with_anchor(
        &self,
        instrument: &str,
        target: Timeframe,
        bucket_open_ms: i64,
        anchor_s: i64,
    ) -> Result<DeriveOutcome> {
        let source = target.source().ok_or_else(|| {
            CandleError::InvalidParameter(format!("{} has no source timeframe", target))
        })?;

        let tf_ms = target.millis();
        if (bucket_open_ms - anchor_s * 1000).rem_euclid(tf_ms) != 0 {
            return Err(CandleError::InvariantViolation(format!(
                "{} {} bucket {} is not aligned to anchor {}s",
                instrument, target, bucket_open_ms, anchor_s
            )));
        }

        let calendar = self.calendars.calendar_for(instrument);
        let src_ms = source.millis();
        let mut inputs: Vec<Bar> = Vec::new();
        let mut missing_closed = 0_i64;
        let mut missing_outage = 0_i64;
        let mut unexpected_slots = Vec::new();

        {
            let mut buffer = lock(&self.buffer);
            let mut slot = bucket_open_ms;
            while slot < bucket_open_ms + tf_ms {
                if let Some(bar) = buffer.get(instrument, source, slot) {
                    inputs.push(bar.clone());
                } else {
                    match self.classify_absent(&calendar, instrument, slot, src_ms) {
                        SlotClass::ExpectedClosed => missing_closed += 1,
                        SlotClass::KnownOutage => missing_outage += 1,
                        _ => unexpected_slots.push(slot),
                    }
                }
                slot += src_ms;
            }
        }

        if !unexpected_slots.is_empty() {
            debug!(
                "{} {} @ {}: {} unexpected gap(s), deferring",
                instrument,
                target,
                bucket_open_ms,
                unexpected_slots.len()
            );
            return Ok(DeriveOutcome::Deferred { unexpected_slots });
        }

        if inputs.is_empty() {
            return Ok(DeriveOutcome::Skipped(SkipReason::NoInputs));
        }

        let (kept, flat): (Vec<Bar>, Vec<Bar>) = inputs
            .into_iter()
            .partition(|bar| pause_artifact(bar, self.flat_volume_threshold).is_none());

        let (first, last) = match (kept.first(), kept.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                debug!(
                    "{} {} @ {}: all {} input(s) are pause artifacts, skipping",
                    instrument,
                    target,
                    bucket_open_ms,
                    flat.len()
                );
                return Ok(DeriveOutcome::Skipped(SkipReason::AllPauseArtifacts));
            }
        };

        let mut extensions = Extensions::new();
        extensions.insert(ext::SOURCE_BARS.to_string(), (kept.len() as i64).into());
        if !flat.is_empty() {
            extensions.insert(ext::FLAT_EXCLUDED.to_string(), (flat.len() as i64).into());
        }
        if missing_closed + missing_outage > 0 {
            extensions.insert(ext::PARTIAL.to_string(), true.into());
            extensions.insert(ext::MISSING_CLOSED.to_string(), missing_closed.into());
            extensions.insert(ext::MISSING_OUTAGE.to_string(), missing_outage.into());
        }

        let parts = BarParts {
            instrument: instrument.to_string(),
            timeframe: target,
            open_time_ms: bucket_open_ms,
            close_time_ms: bucket_open_ms + tf_ms,
            open: first.open(),
            high: kept.iter().map(Bar::high).fold(f64::MIN, f64::max),
            low: kept.iter().map(Bar::low).fold(f64::MAX, f64::min),
            close: last.close(),
            volume: kept.iter().map(Bar::volume).sum(),
            complete: true,
            provenance: Provenance::Derived,
            written_at_ms: Utc::now().timestamp_millis(),
            extensions,
        };

        let bar = Bar::new(parts, anchor_s).map_err(|e| {
            error!(
                "Derived {} {} @ {} violates bar invariants: {}",
                instrument, target, bucket_open_ms, e
            );
            CandleError::InvariantViolation(format!(
                "derived {} {} @ {}: {}",
                instrument, target, bucket_open_ms, e
            ))
        })?;

        Ok(DeriveOutcome::Emitted(bar))
    }

    /// Buffer a completed bar and cascade upward, returning every bar derived
    pub fn ingest(&self, bar: Bar) -> Result<Vec<Bar>> {
        let mut emitted = Vec::new();
        let mut pending = VecDeque::from([bar]);

        while let Some(bar) = pending.pop_front() {
            if !lock(&self.buffer).push(bar.clone()) {
                continue;
            }

            let calendar = self.calendars.calendar_for(bar.instrument());
            self.observe_session_close(&bar, &calendar);

            for target in bar.timeframe().derived_targets() {
                let anchor_s = self.anchor_for(bar.instrument(), target);
                let bucket_open = bucket_start(bar.open_time_ms(), target, anchor_s);
                let bucket: BucketId = (bar.instrument().to_string(), target, bucket_open);

                let retry = lock(&self.deferred).contains(&bucket);
                if !retry && !self.is_effective_tail(&bar, target, anchor_s, &calendar) {
                    continue;
                }

                match self.derive_with_anchor(bar.instrument(), target, bucket_open, anchor_s)? {
                    DeriveOutcome::Emitted(derived) => {
                        lock(&self.deferred).pop(&bucket);
                        debug!(
                            "📊 Derived {} {} @ {} - O:{} H:{} L:{} C:{} V:{} partial={}",
                            derived.instrument(),
                            derived.timeframe(),
                            derived.open_time_ms(),
                            derived.open(),
                            derived.high(),
                            derived.low(),
                            derived.close(),
                            derived.volume(),
                            derived.is_partial()
                        );
                        emitted.push(derived.clone());
                        pending.push_back(derived);
                    }
                    DeriveOutcome::Deferred { unexpected_slots } => {
                        // Only a tail arrival marks the bucket; an early slot
                        // re-trying a deferred bucket keeps it marked.
                        if let Some((dropped, _)) = lock(&self.deferred).push(bucket.clone(), ()) {
                            if dropped != bucket {
                                debug!(
                                    "Giving up on deferred {} {} @ {}",
                                    dropped.0, dropped.1, dropped.2
                                );
                            }
                        }
                        info!(
                            "Deferring {} {} @ {}: missing slots {:?}",
                            bar.instrument(),
                            target,
                            bucket_open,
                            unexpected_slots
                        );
                    }
                    DeriveOutcome::Skipped(reason) => {
                        lock(&self.deferred).pop(&bucket);
                        debug!(
                            "Skipped {} {} @ {}: {:?}",
                            bar.instrument(),
                            target,
                            bucket_open,
                            reason
                        );
                    }
                }
            }
        }

        Ok(emitted)
    }

    /// Feed a time-ordered broker batch through the cascade
    pub fn ingest_history(&self, batch: Vec<Bar>) -> Result<Vec<Bar>> {
        let mut emitted = Vec::new();
        for bar in batch {
            emitted.extend(self.ingest(bar)?);
        }
        Ok(emitted)
    }

    /// A bar closes its target bucket when it is the last slot, or when
    /// every later slot of the bucket is closed or inside a known outage.
    fn is_effective_tail(
        &self,
        bar: &Bar,
        target: Timeframe,
        anchor_s: i64,
        calendar: &TradingCalendar,
    ) -> bool {
        let bucket_close = bucket_start(bar.open_time_ms(), target, anchor_s) + target.millis();
        let next = bar.close_time_ms();
        if next > bucket_close {
            return false;
        }
        let step = bar.timeframe().millis();
        let mut slot = next;
        while slot < bucket_close {
            if self.classify_absent(calendar, bar.instrument(), slot, step) == SlotClass::Unexpected {
                return false;
            }
            slot += step;
        }
        true
    }

    /// When the slot after `bar` is closed, `bar` ends a session: use it as
    /// the reference to pick between primary and DST alternate anchors.
    fn observe_session_close(&self, bar: &Bar, calendar: &TradingCalendar) {
        let next = bar.close_time_ms();
        if !calendar.is_closed_throughout(next, next + bar.timeframe().millis()) {
            return;
        }

        let representatives = [
            (AnchorClass::SubFourHour, Timeframe::H1),
            (AnchorClass::FourHour, Timeframe::H4),
            (AnchorClass::Daily, Timeframe::D1),
        ];
        for (class, timeframe) in representatives {
            let offsets = self.anchors.for_class(class);
            if offsets.alternates_s.is_empty() || bar.timeframe() >= timeframe {
                continue;
            }

            let resolution = resolve_anchor(offsets, bar.open_time_ms(), timeframe, bar.timeframe());
            if !resolution.is_match() {
                continue;
            }

            let key = (bar.instrument().to_string(), class);
            let mut anchors = lock(&self.session_anchors);
            let previous = anchors.insert(key, resolution.anchor_s);
            if previous.unwrap_or(offsets.primary_s) != resolution.anchor_s {
                info!(
                    "Session anchor for {} {:?} moved to {}s ({:?}) at {}",
                    bar.instrument(),
                    class,
                    resolution.anchor_s,
                    resolution.matched,
                    bar.open_time_ms()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::outage::OutageWindow;
    use crate::time::anchor::AnchorOffsets;
    use chrono::{NaiveTime, TimeZone};

    const WED_0900: i64 = 1_704_272_400_000; // 2024-01-03 09:00 UTC
    const MIN: i64 = 60_000;

    fn bar(tf: Timeframe, open_ms: i64, ohlcv: (f64, f64, f64, f64, f64)) -> Bar {
        let provenance = if tf == Timeframe::M1 {
            Provenance::RawHistory
        } else {
            Provenance::AggregatedHistory
        };
        Bar::new(
            BarParts {
                instrument: "X".to_string(),
                timeframe: tf,
                open_time_ms: open_ms,
                close_time_ms: open_ms + tf.millis(),
                open: ohlcv.0,
                high: ohlcv.1,
                low: ohlcv.2,
                close: ohlcv.3,
                volume: ohlcv.4,
                complete: true,
                provenance,
                written_at_ms: 0,
                extensions: Extensions::new(),
            },
            0,
        )
        .unwrap()
    }

    fn cascade_with(calendars: CalendarRegistry, outages: OutageCatalog) -> Cascade {
        Cascade::new(Arc::new(calendars), outages, AnchorTable::default(), 1_000, 0.0)
    }

    fn open_cascade() -> Cascade {
        cascade_with(CalendarRegistry::default(), OutageCatalog::new())
    }

    fn break_calendar(start: (u32, u32), end: (u32, u32)) -> CalendarRegistry {
        let calendar = TradingCalendar::new("grp", chrono_tz::UTC).with_break(
            NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        );
        CalendarRegistry::default().with_calendar(calendar).assign("X", "grp")
    }

    #[test]
    fn test_m1_to_m5_scenario() {
        let cascade = open_cascade();
        let m1 = [
            (1.10, 1.12, 1.09, 1.11, 10.0),
            (1.11, 1.15, 1.10, 1.14, 20.0),
            (1.14, 1.14, 1.05, 1.06, 30.0),
            (1.06, 1.08, 1.06, 1.07, 40.0),
            (1.07, 1.09, 1.07, 1.08, 50.0),
        ];

        let mut m5s = Vec::new();
        for (i, ohlcv) in m1.iter().enumerate() {
            let emitted = cascade.ingest(bar(Timeframe::M1, WED_0900 + i as i64 * MIN, *ohlcv)).unwrap();
            m5s = emitted
                .into_iter()
                .filter(|b| b.timeframe() == Timeframe::M5)
                .collect::<Vec<_>>();
            if i < 4 {
                assert!(m5s.is_empty());
            }
        }

        assert_eq!(m5s.len(), 1);
        let m5 = &m5s[0];
        assert_eq!(m5.timeframe(), Timeframe::M5);
        assert_eq!(m5.open_time_ms(), WED_0900);
        assert_eq!(m5.open(), 1.10);
        assert_eq!(m5.close(), 1.08);
        assert_eq!(m5.high(), 1.15);
        assert_eq!(m5.low(), 1.05);
        assert_eq!(m5.volume(), 150.0);
        assert_eq!(m5.provenance(), Provenance::Derived);
        assert!(!m5.is_partial());
        assert!(m5.extension(ext::PARTIAL).is_none());

        let direct = cascade.derive("X", Timeframe::M5, WED_0900).unwrap();
        assert_eq!(direct.bar().map(Bar::close), Some(1.08));
    }

    #[test]
    fn test_gap_inside_break_yields_partial() {
        // 10:10-10:15 M5 slot falls inside the break
        let cascade = cascade_with(break_calendar((10, 10), (10, 15)), OutageCatalog::new());
        let t = WED_0900 + 60 * MIN;
        assert!(cascade.ingest(bar(Timeframe::M5, t, (1.0, 2.0, 0.5, 1.5, 5.0))).unwrap().is_empty());
        let emitted = cascade
            .ingest(bar(Timeframe::M5, t + 5 * MIN, (1.5, 3.0, 1.0, 2.5, 7.0)))
            .unwrap();

        assert_eq!(emitted.len(), 1);
        let m15 = &emitted[0];
        assert_eq!(m15.timeframe(), Timeframe::M15);
        assert!(m15.is_partial());
        assert_eq!(m15.extension(ext::MISSING_CLOSED).and_then(|v| v.as_i64()), Some(1));
        assert_eq!(m15.extension(ext::MISSING_OUTAGE).and_then(|v| v.as_i64()), Some(0));
        assert_eq!(m15.high(), 3.0);
        assert_eq!(m15.volume(), 12.0);
    }

    #[test]
    fn test_gap_in_trading_hours_defers() {
        let cascade = open_cascade();
        let t = WED_0900 + 60 * MIN;
        cascade.ingest(bar(Timeframe::M5, t, (1.0, 2.0, 0.5, 1.5, 5.0))).unwrap();
        cascade.ingest(bar(Timeframe::M5, t + 5 * MIN, (1.5, 3.0, 1.0, 2.5, 7.0))).unwrap();

        let outcome = cascade.derive("X", Timeframe::M15, t).unwrap();
        assert_eq!(
            outcome,
            DeriveOutcome::Deferred {
                unexpected_slots: vec![t + 10 * MIN]
            }
        );
    }

    #[test]
    fn test_gap_in_known_outage_yields_partial() {
        let t = WED_0900 + 60 * MIN;
        let mut outages = OutageCatalog::new();
        outages.add(OutageWindow {
            instrument: Some("X".to_string()),
            start_ms: t + 5 * MIN,
            end_ms: t + 10 * MIN,
            reason: "feed outage".to_string(),
        });
        let cascade = cascade_with(CalendarRegistry::default(), outages);
        cascade.ingest(bar(Timeframe::M5, t, (1.0, 2.0, 0.5, 1.5, 5.0))).unwrap();
        let emitted = cascade
            .ingest(bar(Timeframe::M5, t + 10 * MIN, (1.5, 3.0, 1.0, 2.5, 7.0)))
            .unwrap();

        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].is_partial());
        assert_eq!(emitted[0].extension(ext::MISSING_OUTAGE).and_then(|v| v.as_i64()), Some(1));
    }

    #[test]
    fn test_outage_on_tail_slot_still_closes_bucket() {
        let mut outages = OutageCatalog::new();
        outages.add(OutageWindow {
            instrument: None,
            start_ms: WED_0900 + 4 * MIN,
            end_ms: WED_0900 + 5 * MIN,
            reason: "broker restart".to_string(),
        });
        let cascade = cascade_with(CalendarRegistry::default(), outages);

        let mut m5s = Vec::new();
        for i in (0..4).chain(5..10) {
            let emitted = cascade
                .ingest(bar(Timeframe::M1, WED_0900 + i * MIN, (1.0, 1.1, 0.9, 1.0, 1.0)))
                .unwrap();
            m5s.extend(emitted.into_iter().filter(|b| b.timeframe() == Timeframe::M5));
        }

        let first: Vec<_> = m5s.iter().filter(|b| b.open_time_ms() == WED_0900).collect();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_partial());
        assert_eq!(first[0].extension(ext::MISSING_OUTAGE).and_then(|v| v.as_i64()), Some(1));
        assert_eq!(first[0].extension(ext::SOURCE_BARS).and_then(|v| v.as_i64()), Some(4));
        assert!(m5s.iter().any(|b| b.open_time_ms() == WED_0900 + 5 * MIN && !b.is_partial()));
    }

    #[test]
    fn test_unfilled_deferrals_are_bounded() {
        let cascade = Cascade::new(
            Arc::new(CalendarRegistry::default()),
            OutageCatalog::new(),
            AnchorTable::default(),
            8,
            0.0,
        );
        // every M5 bucket loses its fourth minute for good
        for bucket in 0..20 {
            let start = WED_0900 + bucket * 5 * MIN;
            for i in [0, 1, 2, 4] {
                cascade
                    .ingest(bar(Timeframe::M1, start + i * MIN, (1.0, 1.1, 0.9, 1.0, 1.0)))
                    .unwrap();
            }
        }

        let deferred = lock(&cascade.deferred);
        assert!(deferred.len() <= 8);
        let newest = ("X".to_string(), Timeframe::M5, WED_0900 + 19 * 5 * MIN);
        assert!(deferred.contains(&newest));
    }

    #[test]
    fn test_pause_artifacts_excluded() {
        let cascade = open_cascade();
        for i in 0..4 {
            cascade
                .ingest(bar(Timeframe::M1, WED_0900 + i * MIN, (1.0, 1.2, 0.9, 1.1, 3.0)))
                .unwrap();
        }
        let emitted = cascade
            .ingest(bar(Timeframe::M1, WED_0900 + 4 * MIN, (1.3, 1.3, 1.3, 1.3, 0.0)))
            .unwrap();

        let m5 = &emitted[0];
        assert_eq!(m5.close(), 1.1);
        assert_eq!(m5.volume(), 12.0);
        assert_eq!(m5.extension(ext::FLAT_EXCLUDED).and_then(|v| v.as_i64()), Some(1));
        assert!(!m5.is_partial());
    }

    #[test]
    fn test_all_flat_bucket_skipped() {
        let cascade = open_cascade();
        let mut last = Vec::new();
        for i in 0..5 {
            last = cascade
                .ingest(bar(Timeframe::M1, WED_0900 + i * MIN, (1.3, 1.3, 1.3, 1.3, 0.0)))
                .unwrap();
        }
        assert!(last.is_empty());
        assert_eq!(
            cascade.derive("X", Timeframe::M5, WED_0900).unwrap(),
            DeriveOutcome::Skipped(SkipReason::AllPauseArtifacts)
        );
    }

    #[test]
    fn test_pause_artifact_predicate() {
        let flat = bar(Timeframe::M1, WED_0900, (1.0, 1.0, 1.0, 1.0, 0.0));
        assert_eq!(pause_artifact(&flat, 0.0), Some(PauseReason::FlatZeroVolume));
        let thin = bar(Timeframe::M1, WED_0900, (1.0, 1.0, 1.0, 1.0, 2.0));
        assert_eq!(pause_artifact(&thin, 5.0), Some(PauseReason::FlatLowVolume));
        assert_eq!(pause_artifact(&thin, 1.0), None);
        let moving = bar(Timeframe::M1, WED_0900, (1.0, 1.1, 1.0, 1.0, 0.0));
        assert_eq!(pause_artifact(&moving, 5.0), None);
    }

    #[test]
    fn test_cascades_through_timeframes() {
        let cascade = open_cascade();
        let mut derived = Vec::new();
        for i in 0..15 {
            let px = 1.0 + i as f64 * 0.01;
            derived.extend(
                cascade
                    .ingest(bar(Timeframe::M1, WED_0900 + i * MIN, (px, px + 0.02, px - 0.01, px + 0.01, 1.0)))
                    .unwrap(),
            );
        }
        let m5: Vec<_> = derived.iter().filter(|b| b.timeframe() == Timeframe::M5).collect();
        let m15: Vec<_> = derived.iter().filter(|b| b.timeframe() == Timeframe::M15).collect();
        assert_eq!(m5.len(), 3);
        assert_eq!(m15.len(), 1);
        assert_eq!(m15[0].volume(), 15.0);
        assert_eq!(m15[0].open(), 1.0);
        // M3 buckets 09:00, 09:03, ..., 09:12 also close inside the first 15 minutes
        assert_eq!(derived.iter().filter(|b| b.timeframe() == Timeframe::M3).count(), 5);
    }

    #[test]
    fn test_late_slot_completes_deferred_bucket() {
        let cascade = open_cascade();
        for i in [0, 1, 3, 4] {
            let emitted = cascade
                .ingest(bar(Timeframe::M1, WED_0900 + i * MIN, (1.0, 1.1, 0.9, 1.0, 1.0)))
                .unwrap();
            assert!(emitted.iter().all(|b| b.timeframe() != Timeframe::M5));
        }
        let emitted = cascade
            .ingest(bar(Timeframe::M1, WED_0900 + 2 * MIN, (1.0, 1.5, 0.9, 1.0, 1.0)))
            .unwrap();
        let m5: Vec<_> = emitted.iter().filter(|b| b.timeframe() == Timeframe::M5).collect();
        assert_eq!(m5.len(), 1);
        assert_eq!(m5[0].high(), 1.5);
        assert_eq!(m5[0].volume(), 5.0);
    }

    #[test]
    fn test_misaligned_bucket_is_fatal() {
        let cascade = open_cascade();
        let err = cascade.derive("X", Timeframe::M5, WED_0900 + MIN).unwrap_err();
        assert!(err.is_fatal());
        assert!(cascade.derive("X", Timeframe::M1, WED_0900).is_err());
    }

    #[test]
    fn test_session_close_selects_dst_alternate() {
        let anchors = AnchorTable {
            daily: AnchorOffsets::new(79_200, vec![75_600]),
            ..AnchorTable::default()
        };
        let cascade = Cascade::new(
            Arc::new(break_calendar((21, 0), (21, 5))),
            OutageCatalog::new(),
            anchors,
            1_000,
            0.0,
        );
        assert_eq!(cascade.anchor_for("X", Timeframe::D1), 79_200);

        let close = Utc.with_ymd_and_hms(2024, 7, 3, 20, 59, 0).unwrap().timestamp_millis();
        cascade.ingest(bar(Timeframe::M1, close, (1.0, 1.0, 1.0, 1.0, 1.0))).unwrap();

        assert_eq!(cascade.anchor_for("X", Timeframe::D1), 75_600);
        let next_day = close + 2 * 3_600_000;
        assert_eq!(
            cascade.bucket_start("X", Timeframe::D1, next_day),
            close + MIN
        );
        // Sub-4h anchors are untouched
        assert_eq!(cascade.anchor_for("X", Timeframe::H1), 0);
    }
}
