/// Per-(instrument, timeframe, UTC day) set of persisted open times
use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::types::Timeframe;

type DayKey = (String, Timeframe, NaiveDate);

/// Lazily populated membership index over the disk log.
/// A day is unknown until `load` is called for it; after that every
/// `insert` keeps it in step with appends.
#[derive(Debug, Default)]
pub struct DayIndex {
    days: HashMap<DayKey, HashSet<i64>>,
}

impl DayIndex {
    pub fn new() -> Self {
        DayIndex::default()
    }

    pub fn is_loaded(&self, instrument: &str, timeframe: Timeframe, day: NaiveDate) -> bool {
        self.days
            .contains_key(&(instrument.to_string(), timeframe, day))
    }

    /// Record the open times found on disk for a day. Merges with anything
    /// inserted while the load was in flight.
    pub fn load(
        &mut self,
        instrument: &str,
        timeframe: Timeframe,
        day: NaiveDate,
        open_times: impl IntoIterator<Item = i64>,
    ) {
        self.days
            .entry((instrument.to_string(), timeframe, day))
            .or_default()
            .extend(open_times);
    }

    /// `None` when the day has not been loaded yet
    pub fn contains(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        day: NaiveDate,
        open_time_ms: i64,
    ) -> Option<bool> {
        self.days
            .get(&(instrument.to_string(), timeframe, day))
            .map(|opens| opens.contains(&open_time_ms))
    }

    pub fn insert(&mut self, instrument: &str, timeframe: Timeframe, day: NaiveDate, open_time_ms: i64) {
        self.days
            .entry((instrument.to_string(), timeframe, day))
            .or_default()
            .insert(open_time_ms);
    }

    pub fn loaded_days(&self) -> usize {
        self.days.len()
    }
}
