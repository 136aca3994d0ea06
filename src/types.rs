/// Core type definitions for the candle store
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::data::outage::OutageConfig;
use crate::error::{CandleError, Result};
use crate::time::anchor::AnchorTable;
use crate::time::calendar::CalendarConfig;

/// Supported bar timeframes, ordered from finest to coarsest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

/// Anchor offset class a timeframe belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorClass {
    SubFourHour,
    FourHour,
    Daily,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M3 => "M3",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 180,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    pub fn millis(&self) -> i64 {
        self.seconds() * 1000
    }

    pub fn from_seconds(seconds: i64) -> Option<Self> {
        Timeframe::ALL.into_iter().find(|tf| tf.seconds() == seconds)
    }

    pub fn anchor_class(&self) -> AnchorClass {
        match self {
            Timeframe::H4 => AnchorClass::FourHour,
            Timeframe::D1 => AnchorClass::Daily,
            _ => AnchorClass::SubFourHour,
        }
    }

    /// Lower timeframe this one is derived from; `None` for raw-only M1
    pub fn source(&self) -> Option<Timeframe> {
        match self {
            Timeframe::M1 => None,
            Timeframe::M3 | Timeframe::M5 => Some(Timeframe::M1),
            Timeframe::M15 => Some(Timeframe::M5),
            Timeframe::M30 => Some(Timeframe::M15),
            Timeframe::H1 => Some(Timeframe::M30),
            Timeframe::H4 | Timeframe::D1 => Some(Timeframe::H1),
        }
    }

    /// Timeframes whose cascade source is this one
    pub fn derived_targets(&self) -> Vec<Timeframe> {
        Timeframe::ALL
            .into_iter()
            .filter(|tf| tf.source() == Some(*self))
            .collect()
    }

    /// Broker session anchors move for these, producing near-duplicate keys
    pub fn is_jitter_prone(&self) -> bool {
        matches!(self.anchor_class(), AnchorClass::FourHour | AnchorClass::Daily)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = CandleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m1" | "1m" => Ok(Timeframe::M1),
            "m3" | "3m" => Ok(Timeframe::M3),
            "m5" | "5m" => Ok(Timeframe::M5),
            "m15" | "15m" => Ok(Timeframe::M15),
            "m30" | "30m" => Ok(Timeframe::M30),
            "h1" | "1h" | "60m" => Ok(Timeframe::H1),
            "h4" | "4h" | "240m" => Ok(Timeframe::H4),
            "d1" | "1d" => Ok(Timeframe::D1),
            _ => Err(CandleError::UnknownTimeframe(s.to_string())),
        }
    }
}

impl TryFrom<i64> for Timeframe {
    type Error = CandleError;

    fn try_from(seconds: i64) -> Result<Self> {
        Timeframe::from_seconds(seconds)
            .ok_or_else(|| CandleError::UnknownTimeframe(format!("{}s", seconds)))
    }
}

impl From<Timeframe> for i64 {
    fn from(tf: Timeframe) -> i64 {
        tf.seconds()
    }
}

/// Where a bar came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Bar as delivered by the broker at its native timeframe
    RawHistory,
    /// Computed locally by the derivation cascade
    Derived,
    /// Pre-aggregated higher timeframe bar delivered by the broker
    AggregatedHistory,
}

impl Provenance {
    pub fn as_str(&self) -> &str {
        match self {
            Provenance::RawHistory => "raw_history",
            Provenance::Derived => "derived",
            Provenance::AggregatedHistory => "aggregated_history",
        }
    }

    /// Broker-issued bars are final; locally derived ones can be superseded
    pub fn is_final(&self) -> bool {
        !matches!(self, Provenance::Derived)
    }
}

/// Primitive value carried in a bar's extension map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ExtValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ExtValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ExtValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for ExtValue {
    fn from(value: bool) -> Self {
        ExtValue::Bool(value)
    }
}

impl From<i64> for ExtValue {
    fn from(value: i64) -> Self {
        ExtValue::Int(value)
    }
}

impl From<f64> for ExtValue {
    fn from(value: f64) -> Self {
        ExtValue::Float(value)
    }
}

impl From<&str> for ExtValue {
    fn from(value: &str) -> Self {
        ExtValue::Text(value.to_string())
    }
}

pub type Extensions = BTreeMap<String, ExtValue>;

/// Well-known extension keys written by the cascade
pub mod ext {
    pub const PARTIAL: &str = "partial";
    pub const MISSING_CLOSED: &str = "missing_closed";
    pub const MISSING_OUTAGE: &str = "missing_outage";
    pub const FLAT_EXCLUDED: &str = "flat_excluded";
    pub const SOURCE_BARS: &str = "source_bars";
}

/// Identity of a bar: (instrument, timeframe, bucket open)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarKey {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
}

/// One (instrument, timeframe) series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(instrument: &str, timeframe: Timeframe) -> Self {
        SeriesKey {
            instrument: instrument.to_string(),
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.instrument, self.timeframe)
    }
}

impl BarKey {
    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(&self.instrument, self.timeframe)
    }
}

/// Unvalidated bar fields; also the on-disk record shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarParts {
    pub instrument: String,
    #[serde(rename = "tf_s")]
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub complete: bool,
    pub provenance: Provenance,
    #[serde(default)]
    pub written_at_ms: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: Extensions,
}

/// OHLCV bar. Immutable once built; a revision is a new Bar at the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BarParts", into = "BarParts")]
pub struct Bar {
    instrument: String,
    timeframe: Timeframe,
    open_time_ms: i64,
    close_time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    complete: bool,
    provenance: Provenance,
    written_at_ms: i64,
    extensions: Extensions,
}

impl Bar {
    /// Build a bar, enforcing every structural invariant including anchor alignment
    pub fn new(parts: BarParts, anchor_s: i64) -> Result<Self> {
        let tf_ms = parts.timeframe.millis();
        if (parts.open_time_ms - anchor_s * 1000).rem_euclid(tf_ms) != 0 {
            return Err(CandleError::InvariantViolation(format!(
                "{} {} open {} is not aligned to anchor {}s",
                parts.instrument, parts.timeframe, parts.open_time_ms, anchor_s
            )));
        }
        Bar::try_from(parts)
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn open_time_ms(&self) -> i64 {
        self.open_time_ms
    }

    pub fn close_time_ms(&self) -> i64 {
        self.close_time_ms
    }

    pub fn open(&self) -> f64 {
        self.open
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn close(&self) -> f64 {
        self.close
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn written_at_ms(&self) -> i64 {
        self.written_at_ms
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extension(&self, key: &str) -> Option<&ExtValue> {
        self.extensions.get(key)
    }

    pub fn is_partial(&self) -> bool {
        self.extension(ext::PARTIAL)
            .and_then(ExtValue::as_bool)
            .unwrap_or(false)
    }

    pub fn key(&self) -> BarKey {
        BarKey {
            instrument: self.instrument.clone(),
            timeframe: self.timeframe,
            open_time_ms: self.open_time_ms,
        }
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(&self.instrument, self.timeframe)
    }

    pub fn open_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_time_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// UTC calendar day the bar's bucket opens on (disk partition)
    pub fn utc_day(&self) -> NaiveDate {
        self.open_time().date_naive()
    }

    /// Annotate without touching the invariant-checked fields
    pub fn with_extension(mut self, key: &str, value: impl Into<ExtValue>) -> Self {
        self.extensions.insert(key.to_string(), value.into());
        self
    }
}

impl TryFrom<BarParts> for Bar {
    type Error = CandleError;

    /// Structural validation only; the anchor is not persisted so alignment
    /// is checked by `Bar::new` at production time.
    fn try_from(parts: BarParts) -> Result<Self> {
        if parts.instrument.trim().is_empty() {
            return Err(CandleError::InvalidBarData("empty instrument".to_string()));
        }

        let tf_ms = parts.timeframe.millis();
        if parts.close_time_ms != parts.open_time_ms + tf_ms {
            return Err(CandleError::InvariantViolation(format!(
                "{} {} close {} != open {} + {}",
                parts.instrument, parts.timeframe, parts.close_time_ms, parts.open_time_ms, tf_ms
            )));
        }

        if parts.timeframe == Timeframe::M1 && parts.provenance == Provenance::Derived {
            return Err(CandleError::InvariantViolation(format!(
                "{} M1 bar at {} cannot be derived",
                parts.instrument, parts.open_time_ms
            )));
        }

        let prices = [parts.open, parts.high, parts.low, parts.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(CandleError::InvalidBarData(format!(
                "{} {} at {} has non-finite prices",
                parts.instrument, parts.timeframe, parts.open_time_ms
            )));
        }
        if parts.high < parts.low {
            return Err(CandleError::InvalidBarData(format!(
                "{} {} at {} has high {} < low {}",
                parts.instrument, parts.timeframe, parts.open_time_ms, parts.high, parts.low
            )));
        }

        // Negative and NaN volume both clamp to zero
        let volume = if parts.volume >= 0.0 { parts.volume } else { 0.0 };

        Ok(Bar {
            instrument: parts.instrument,
            timeframe: parts.timeframe,
            open_time_ms: parts.open_time_ms,
            close_time_ms: parts.close_time_ms,
            open: parts.open,
            high: parts.high,
            low: parts.low,
            close: parts.close,
            volume,
            complete: parts.complete,
            provenance: parts.provenance,
            written_at_ms: parts.written_at_ms,
            extensions: parts.extensions,
        })
    }
}

impl From<Bar> for BarParts {
    fn from(bar: Bar) -> Self {
        BarParts {
            instrument: bar.instrument,
            timeframe: bar.timeframe,
            open_time_ms: bar.open_time_ms,
            close_time_ms: bar.close_time_ms,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            complete: bar.complete,
            provenance: bar.provenance,
            written_at_ms: bar.written_at_ms,
            extensions: bar.extensions,
        }
    }
}

/// Configuration for the candle store
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    // Disk Log
    pub data_root: String,

    // Tier Sizing
    pub ram_window_capacity: usize,
    pub buffer_capacity: usize,
    pub snapshot_capacity: usize,
    pub snapshot_tail_len: usize,
    pub snapshot_ttl_sec: u64,
    /// Minimum tail length per timeframe before a cold load may trust the snapshot tier
    pub snapshot_min_bars: HashMap<String, usize>,

    // Change Feed
    pub feed_retention: usize,
    /// Keys per series whose last digest is remembered for no-op detection
    pub feed_digest_capacity: usize,
    pub feed_channel_capacity: usize,

    // Derivation
    pub flat_volume_threshold: f64,
    pub anchors: AnchorTable,

    // Trading Calendars
    pub calendars: Vec<CalendarConfig>,
    pub outages: Vec<OutageConfig>,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_root: "data/bars".to_string(),
            ram_window_capacity: 256,
            buffer_capacity: 50_000,
            snapshot_capacity: 1_024,
            snapshot_tail_len: 500,
            snapshot_ttl_sec: 3_600,
            snapshot_min_bars: HashMap::new(),
            feed_retention: 1_000,
            feed_digest_capacity: 10_000,
            feed_channel_capacity: 1_024,
            flat_volume_threshold: 0.0,
            anchors: AnchorTable::default(),
            calendars: Vec::new(),
            outages: Vec::new(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl StoreConfig {
    /// Configured cold-load threshold for a timeframe, if any
    pub fn min_bars_for(&self, timeframe: Timeframe) -> Option<usize> {
        self.snapshot_min_bars
            .iter()
            .find(|(key, _)| key.parse::<Timeframe>().ok() == Some(timeframe))
            .map(|(_, min)| *min)
    }
}
