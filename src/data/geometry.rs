/// Read-side self-healing: ordering, exact duplicates and anchor-jitter near-duplicates
use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::types::{Bar, BarKey};

/// Ranking used when two bars claim the same period:
/// complete > incomplete, then final provenance > derived, then newer write.
fn rank(bar: &Bar) -> (bool, bool, i64) {
    (bar.is_complete(), bar.provenance().is_final(), bar.written_at_ms())
}

/// Is `a` strictly better than `b`?
pub fn better(a: &Bar, b: &Bar) -> bool {
    rank(a) > rank(b)
}

/// Keep the better of two colliding bars; on a full tie the later arrival wins
fn pick(incumbent: Bar, challenger: Bar) -> (Bar, Bar) {
    if better(&incumbent, &challenger) {
        (incumbent, challenger)
    } else {
        (challenger, incumbent)
    }
}

/// What `reconcile` had to fix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeometryReport {
    pub input_len: usize,
    pub output_len: usize,
    pub out_of_order: bool,
    pub exact_duplicates: usize,
    pub near_duplicates_merged: usize,
    /// Keys whose bar lost a collision
    pub dropped_keys: Vec<BarKey>,
}

impl GeometryReport {
    pub fn is_clean(&self) -> bool {
        !self.out_of_order && self.exact_duplicates == 0 && self.near_duplicates_merged == 0
    }
}

impl fmt::Display for GeometryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "geometry corrected: {} -> {} bars (out_of_order={}, exact_dups={}, near_dups={})",
            self.input_len,
            self.output_len,
            self.out_of_order,
            self.exact_duplicates,
            self.near_duplicates_merged
        )
    }
}

fn same_series(a: &Bar, b: &Bar) -> bool {
    a.instrument() == b.instrument() && a.timeframe() == b.timeframe()
}

fn key_order(a: &Bar, b: &Bar) -> Ordering {
    (a.instrument(), a.timeframe(), a.open_time_ms()).cmp(&(b.instrument(), b.timeframe(), b.open_time_ms()))
}

/// Sort and deduplicate a batch pulled from any tier.
///
/// Exact duplicates (same key) are collapsed first, then near-duplicates of
/// jitter-prone timeframes (opens less than one timeframe apart) are merged.
/// Both use [`better`]. A clean batch is returned untouched with no report.
pub fn reconcile(bars: Vec<Bar>) -> (Vec<Bar>, Option<GeometryReport>) {
    let input_len = bars.len();
    let out_of_order = bars
        .windows(2)
        .any(|w| key_order(&w[0], &w[1]) == Ordering::Greater);
    let has_exact = bars
        .windows(2)
        .any(|w| key_order(&w[0], &w[1]) == Ordering::Equal);
    let has_near = bars.windows(2).any(|w| {
        same_series(&w[0], &w[1])
            && w[0].timeframe().is_jitter_prone()
            && (w[1].open_time_ms() - w[0].open_time_ms()).abs() < w[0].timeframe().millis()
    });

    if !out_of_order && !has_exact && !has_near {
        return (bars, None);
    }

    let mut report = GeometryReport {
        input_len,
        out_of_order,
        ..GeometryReport::default()
    };

    let mut sorted = bars;
    sorted.sort_by(key_order);

    let mut exact: Vec<Bar> = Vec::with_capacity(sorted.len());
    for bar in sorted {
        match exact.pop() {
            Some(prev) if key_order(&prev, &bar) == Ordering::Equal => {
                let (kept, dropped) = pick(prev, bar);
                report.exact_duplicates += 1;
                report.dropped_keys.push(dropped.key());
                exact.push(kept);
            }
            Some(prev) => {
                exact.push(prev);
                exact.push(bar);
            }
            None => exact.push(bar),
        }
    }

    let mut merged: Vec<Bar> = Vec::with_capacity(exact.len());
    for bar in exact {
        match merged.pop() {
            Some(prev)
                if same_series(&prev, &bar)
                    && bar.timeframe().is_jitter_prone()
                    && bar.open_time_ms() - prev.open_time_ms() < bar.timeframe().millis() =>
            {
                let (kept, dropped) = pick(prev, bar);
                report.near_duplicates_merged += 1;
                report.dropped_keys.push(dropped.key());
                merged.push(kept);
            }
            Some(prev) => {
                merged.push(prev);
                merged.push(bar);
            }
            None => merged.push(bar),
        }
    }

    report.output_len = merged.len();
    warn!("{}", report);
    (merged, Some(report))
}
