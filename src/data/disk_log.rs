/// Append-only NDJSON disk log - the authoritative tier
/// Layout: <root>/<instrument>/<TF>/part-YYYYMMDD.jsonl, one file per UTC day
use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::{CandleError, Result};
use crate::types::{Bar, Timeframe};

/// Records decoded from one or more day files
#[derive(Debug, Clone, Default)]
pub struct DayRead {
    pub bars: Vec<Bar>,
    /// Lines that failed to decode or re-validate
    pub malformed: usize,
}

/// UTC day containing `ts_ms` (the partition a bar lands in)
pub fn utc_day(ts_ms: i64) -> NaiveDate {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
        .date_naive()
}

pub struct DiskLog {
    root: PathBuf,
}

impl DiskLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskLog { root: root.into() }
    }

    pub fn series_dir(&self, instrument: &str, timeframe: Timeframe) -> Result<PathBuf> {
        if instrument.is_empty()
            || instrument == "."
            || instrument == ".."
            || instrument.contains(['/', '\\'])
        {
            return Err(CandleError::InvalidParameter(format!(
                "instrument '{}' is not usable as a path component",
                instrument
            )));
        }
        Ok(self.root.join(instrument).join(timeframe.as_str()))
    }

    pub fn day_path(&self, instrument: &str, timeframe: Timeframe, day: NaiveDate) -> Result<PathBuf> {
        Ok(self
            .series_dir(instrument, timeframe)?
            .join(format!("part-{}.jsonl", day.format("%Y%m%d"))))
    }

    /// Append one record and fsync. Any failure is a failed commit.
    pub async fn append(&self, bar: &Bar) -> Result<()> {
        let path = self.day_path(bar.instrument(), bar.timeframe(), bar.utc_day())?;
        let write_failed = |e: std::io::Error| {
            CandleError::DiskWriteFailed(format!("{}: {}", path.display(), e))
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(write_failed)?;
        }

        let json_line = serde_json::to_string(bar)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(write_failed)?;

        file.write_all(format!("{}\n", json_line).as_bytes())
            .await
            .map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;

        debug!(
            "Appended {} {} @ {} to {}",
            bar.instrument(),
            bar.timeframe(),
            bar.open_time_ms(),
            path.display()
        );
        Ok(())
    }

    /// Every decodable record of one day file, in file order.
    /// A missing file is an empty day.
    pub async fn read_day(&self, instrument: &str, timeframe: Timeframe, day: NaiveDate) -> Result<DayRead> {
        let path = self.day_path(instrument, timeframe, day)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DayRead::default()),
            Err(e) => return Err(CandleError::tier_unavailable("disk", e.to_string())),
        };

        let mut lines = BufReader::new(file).lines();
        let mut read = DayRead::default();
        let mut line_no = 0_usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Bar>(&line) {
                Ok(bar) => read.bars.push(bar),
                Err(e) => {
                    read.malformed += 1;
                    warn!("Skipping malformed record {}:{}: {}", path.display(), line_no, e);
                }
            }
        }

        Ok(read)
    }

    /// Days with a partition file, oldest first
    pub async fn list_days(&self, instrument: &str, timeframe: Timeframe) -> Result<Vec<NaiveDate>> {
        let dir = self.series_dir(instrument, timeframe)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CandleError::tier_unavailable("disk", e.to_string())),
        };

        let mut days = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stamp) = name
                .strip_prefix("part-")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
            else {
                continue;
            };
            if let Ok(day) = NaiveDate::parse_from_str(stamp, "%Y%m%d") {
                days.push(day);
            }
        }
        days.sort();
        Ok(days)
    }

    /// Records with `since_ms <= open <= to_ms`, walking day files newest
    /// first until `limit` distinct open times are collected. Returned oldest
    /// first and unreconciled: revisions of one key all come back, and the
    /// result may exceed `limit` by the remainder of the last day read.
    pub async fn read_range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        since_ms: Option<i64>,
        to_ms: Option<i64>,
        limit: usize,
    ) -> Result<DayRead> {
        let days = self.list_days(instrument, timeframe).await?;
        let since_day = since_ms.map(utc_day);
        let to_day = to_ms.map(utc_day);

        let mut chunks: Vec<Vec<Bar>> = Vec::new();
        let mut opens: HashSet<i64> = HashSet::new();
        let mut malformed = 0_usize;

        for day in days.into_iter().rev() {
            if to_day.is_some_and(|to| day > to) {
                continue;
            }
            if since_day.is_some_and(|since| day < since) {
                break;
            }

            let read = self.read_day(instrument, timeframe, day).await?;
            malformed += read.malformed;
            let bars: Vec<Bar> = read
                .bars
                .into_iter()
                .filter(|b| since_ms.map_or(true, |s| b.open_time_ms() >= s))
                .filter(|b| to_ms.map_or(true, |t| b.open_time_ms() <= t))
                .collect();
            opens.extend(bars.iter().map(Bar::open_time_ms));
            chunks.push(bars);

            if opens.len() >= limit {
                break;
            }
        }

        let bars = chunks.into_iter().rev().flatten().collect();
        Ok(DayRead { bars, malformed })
    }

    /// Highest open time in the newest non-empty day file
    pub async fn last_open_time(&self, instrument: &str, timeframe: Timeframe) -> Result<Option<i64>> {
        for day in self.list_days(instrument, timeframe).await?.into_iter().rev() {
            let read = self.read_day(instrument, timeframe, day).await?;
            if let Some(max) = read.bars.iter().map(Bar::open_time_ms).max() {
                return Ok(Some(max));
            }
            debug!("Day file {} for {} {} has no usable records", day, instrument, timeframe);
        }
        Ok(None)
    }
}
