/// Trading calendar: per instrument-group "is this a trading minute" oracle
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, warn};

const MINUTES_PER_DAY: u32 = 1_440;

/// Half-open window `[start, end)` on a cyclic minute axis (day or week).
/// `start == end` is disabled; `start > end` wraps past the axis origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteWindow {
    pub start: u32,
    pub end: u32,
}

impl MinuteWindow {
    pub fn contains(&self, cur: u32) -> bool {
        if self.start == self.end {
            false
        } else if self.start < self.end {
            cur >= self.start && cur < self.end
        } else {
            cur >= self.start || cur < self.end
        }
    }
}

/// Calendar settings as they appear in the config file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub group: String,
    pub enabled: bool,
    /// Instruments that trade on this calendar
    pub instruments: Vec<String>,
    /// IANA name the times below are expressed in; UTC when absent
    pub timezone: Option<String>,
    /// Weekly close, e.g. "Fri 21:00"
    pub weekly_close: Option<String>,
    /// Weekly reopen, e.g. "Sun 21:05"
    pub weekly_open: Option<String>,
    pub break_start: Option<String>,
    pub break_end: Option<String>,
    pub extra_breaks: Vec<BreakConfig>,
    pub holidays: Vec<NaiveDate>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        CalendarConfig {
            group: String::new(),
            enabled: true,
            instruments: Vec::new(),
            timezone: None,
            weekly_close: None,
            weekly_open: None,
            break_start: None,
            break_end: None,
            extra_breaks: Vec::new(),
            holidays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakConfig {
    pub start: String,
    pub end: String,
}

/// Immutable trading calendar for one instrument group
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    group: String,
    enabled: bool,
    timezone: Tz,
    /// Minute-of-week window (Monday 00:00 = 0) during which the market is shut
    weekly_closed: Option<MinuteWindow>,
    /// Minute-of-day break windows, primary first
    breaks: Vec<MinuteWindow>,
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(group: &str, timezone: Tz) -> Self {
        TradingCalendar {
            group: group.to_string(),
            enabled: true,
            timezone,
            weekly_closed: None,
            breaks: Vec::new(),
            holidays: BTreeSet::new(),
        }
    }

    /// No restrictions at all (e.g. crypto, or an unmapped instrument)
    pub fn always_open(group: &str) -> Self {
        let mut calendar = TradingCalendar::new(group, chrono_tz::UTC);
        calendar.enabled = false;
        calendar
    }

    pub fn with_weekly_close(
        mut self,
        close: (Weekday, NaiveTime),
        open: (Weekday, NaiveTime),
    ) -> Self {
        self.weekly_closed = Some(MinuteWindow {
            start: minute_of_week(close.0, close.1),
            end: minute_of_week(open.0, open.1),
        });
        self
    }

    pub fn with_break(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.breaks.push(MinuteWindow {
            start: minute_of_day(start),
            end: minute_of_day(end),
        });
        self
    }

    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Build from config. Malformed entries are logged and dropped, so the
    /// affected interval imposes no restriction.
    pub fn from_config(config: &CalendarConfig) -> Self {
        let timezone = match config.timezone.as_deref() {
            None => chrono_tz::UTC,
            Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                warn!(
                    "Calendar {}: unknown timezone '{}', using UTC",
                    config.group, name
                );
                chrono_tz::UTC
            }),
        };

        let mut calendar = TradingCalendar::new(&config.group, timezone);
        calendar.enabled = config.enabled;
        calendar.holidays = config.holidays.iter().copied().collect();

        match (config.weekly_close.as_deref(), config.weekly_open.as_deref()) {
            (None, None) => {}
            (close, open) => {
                match (close.and_then(parse_weekly_point), open.and_then(parse_weekly_point)) {
                    (Some(start), Some(end)) => {
                        calendar.weekly_closed = Some(MinuteWindow { start, end })
                    }
                    _ => warn!(
                        "Calendar {}: malformed weekly window {:?} -> {:?}, ignoring",
                        config.group, close, open
                    ),
                }
            }
        }

        let primary = match (config.break_start.as_deref(), config.break_end.as_deref()) {
            (None, None) => None,
            (start, end) => Some((start.unwrap_or(""), end.unwrap_or(""))),
        };
        let extras = config
            .extra_breaks
            .iter()
            .map(|b| (b.start.as_str(), b.end.as_str()));

        for (start, end) in primary.into_iter().chain(extras) {
            match (parse_time(start), parse_time(end)) {
                (Some(s), Some(e)) => calendar.breaks.push(MinuteWindow {
                    start: minute_of_day(s),
                    end: minute_of_day(e),
                }),
                _ => warn!(
                    "Calendar {}: malformed break '{}'-'{}', ignoring",
                    config.group, start, end
                ),
            }
        }

        debug!(
            "Built calendar {}: enabled={}, tz={}, breaks={}, weekly={:?}, holidays={}",
            calendar.group,
            calendar.enabled,
            calendar.timezone.name(),
            calendar.breaks.len(),
            calendar.weekly_closed,
            calendar.holidays.len()
        );

        calendar
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Is the minute containing `ts` a trading minute?
    pub fn is_trading_minute(&self, ts: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }

        let local = ts.with_timezone(&self.timezone);
        if self.holidays.contains(&local.date_naive()) {
            return false;
        }

        let minute_of_day = local.hour() * 60 + local.minute();
        if self.breaks.iter().any(|b| b.contains(minute_of_day)) {
            return false;
        }

        if let Some(weekly) = self.weekly_closed {
            let cur = local.weekday().num_days_from_monday() * MINUTES_PER_DAY + minute_of_day;
            if weekly.contains(cur) {
                return false;
            }
        }

        true
    }

    pub fn is_trading_minute_ms(&self, ts_ms: i64) -> bool {
        match Utc.timestamp_millis_opt(ts_ms).single() {
            Some(ts) => self.is_trading_minute(ts),
            None => true,
        }
    }

    /// True when no minute of `[start_ms, end_ms)` is a trading minute
    pub fn is_closed_throughout(&self, start_ms: i64, end_ms: i64) -> bool {
        if !self.enabled {
            return false;
        }
        let mut minute = start_ms - start_ms.rem_euclid(60_000);
        while minute < end_ms {
            if self.is_trading_minute_ms(minute) {
                return false;
            }
            minute += 60_000;
        }
        true
    }
}

/// Instrument → calendar lookup, built once at start
#[derive(Debug, Clone)]
pub struct CalendarRegistry {
    calendars: HashMap<String, Arc<TradingCalendar>>,
    instrument_groups: HashMap<String, String>,
    fallback: Arc<TradingCalendar>,
}

impl Default for CalendarRegistry {
    fn default() -> Self {
        CalendarRegistry {
            calendars: HashMap::new(),
            instrument_groups: HashMap::new(),
            fallback: Arc::new(TradingCalendar::always_open("default")),
        }
    }
}

impl CalendarRegistry {
    pub fn from_config(calendars: &[CalendarConfig]) -> Self {
        let mut registry = CalendarRegistry::default();
        for config in calendars {
            for instrument in &config.instruments {
                if let Some(previous) = registry.instrument_groups.get(instrument) {
                    warn!(
                        "Instrument {} listed in calendars {} and {}, using {}",
                        instrument, previous, config.group, config.group
                    );
                }
                registry = registry.assign(instrument, &config.group);
            }
            registry = registry.with_calendar(TradingCalendar::from_config(config));
        }
        registry
    }

    pub fn with_calendar(mut self, calendar: TradingCalendar) -> Self {
        self.calendars
            .insert(calendar.group().to_string(), Arc::new(calendar));
        self
    }

    pub fn assign(mut self, instrument: &str, group: &str) -> Self {
        self.instrument_groups
            .insert(instrument.to_string(), group.to_string());
        self
    }

    pub fn calendar_for(&self, instrument: &str) -> Arc<TradingCalendar> {
        self.instrument_groups
            .get(instrument)
            .and_then(|group| self.calendars.get(group))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

fn minute_of_week(day: Weekday, time: NaiveTime) -> u32 {
    day.num_days_from_monday() * MINUTES_PER_DAY + minute_of_day(time)
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// "Fri 21:00" → minute of week
fn parse_weekly_point(s: &str) -> Option<u32> {
    let mut parts = s.split_whitespace();
    let day = parts.next()?.parse::<Weekday>().ok()?;
    let time = parse_time(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(minute_of_week(day, time))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn fx_calendar() -> TradingCalendar {
        // 2024-01-05 is a Friday
        TradingCalendar::new("fx", chrono_tz::UTC)
            .with_weekly_close((Weekday::Fri, hm(21, 0)), (Weekday::Sun, hm(21, 0)))
            .with_break(hm(21, 55), hm(22, 5))
    }

    #[test]
    fn test_weekly_window() {
        let cal = fx_calendar();
        assert!(cal.is_trading_minute(utc(2024, 1, 5, 20, 59)));
        assert!(!cal.is_trading_minute(utc(2024, 1, 5, 21, 0)));
        assert!(!cal.is_trading_minute(utc(2024, 1, 6, 12, 0)));
        assert!(!cal.is_trading_minute(utc(2024, 1, 7, 20, 59)));
        assert!(cal.is_trading_minute(utc(2024, 1, 7, 21, 0)));
        assert!(cal.is_trading_minute(utc(2024, 1, 8, 0, 0)));
    }

    #[test]
    fn test_weekly_window_wraps_week_boundary() {
        let cal = TradingCalendar::new("idx", chrono_tz::UTC)
            .with_weekly_close((Weekday::Fri, hm(22, 0)), (Weekday::Mon, hm(0, 30)));
        assert!(!cal.is_trading_minute(utc(2024, 1, 5, 23, 0)));
        assert!(!cal.is_trading_minute(utc(2024, 1, 8, 0, 10)));
        assert!(cal.is_trading_minute(utc(2024, 1, 8, 0, 30)));
    }

    #[test]
    fn test_break_wraps_midnight() {
        let cal = TradingCalendar::new("cfd", chrono_tz::UTC).with_break(hm(23, 50), hm(0, 10));
        assert!(!cal.is_trading_minute(utc(2024, 1, 3, 23, 55)));
        assert!(!cal.is_trading_minute(utc(2024, 1, 4, 0, 5)));
        assert!(cal.is_trading_minute(utc(2024, 1, 4, 0, 10)));
        assert!(cal.is_trading_minute(utc(2024, 1, 3, 23, 49)));
    }

    #[test]
    fn test_zero_length_break_is_disabled() {
        let cal = TradingCalendar::new("x", chrono_tz::UTC).with_break(hm(12, 0), hm(12, 0));
        assert!(cal.is_trading_minute(utc(2024, 1, 3, 12, 0)));
    }

    #[test]
    fn test_disabled_calendar_always_trades() {
        let cal = fx_calendar().disabled();
        assert!(cal.is_trading_minute(utc(2024, 1, 6, 12, 0)));
        assert!(!cal.is_closed_throughout(0, 86_400_000));
    }

    #[test]
    fn test_malformed_config_degrades_to_open() {
        let config = CalendarConfig {
            group: "broken".to_string(),
            weekly_close: Some("Fryday 21:00".to_string()),
            weekly_open: Some("Sun 21:00".to_string()),
            break_start: Some("25:99".to_string()),
            break_end: Some("01:00".to_string()),
            extra_breaks: vec![BreakConfig {
                start: "12:00".to_string(),
                end: "12:30".to_string(),
            }],
            ..CalendarConfig::default()
        };
        let cal = TradingCalendar::from_config(&config);
        assert!(!cal.is_trading_minute(utc(2024, 1, 6, 12, 0)));
        assert!(cal.is_trading_minute(utc(2024, 1, 6, 0, 30)));
        assert!(cal.is_trading_minute(utc(2024, 1, 6, 13, 0)));
    }

    #[test]
    fn test_holiday_and_timezone() {
        let config = CalendarConfig {
            group: "nse".to_string(),
            timezone: Some("Asia/Kolkata".to_string()),
            break_start: Some("15:30".to_string()),
            break_end: Some("09:15".to_string()),
            holidays: vec![NaiveDate::from_ymd_opt(2025, 1, 27).unwrap()],
            ..CalendarConfig::default()
        };
        let cal = TradingCalendar::from_config(&config);
        // 10:00 IST == 04:30 UTC
        assert!(cal.is_trading_minute(utc(2025, 1, 28, 4, 30)));
        // 16:00 IST == 10:30 UTC, after the close
        assert!(!cal.is_trading_minute(utc(2025, 1, 28, 10, 30)));
        assert!(!cal.is_trading_minute(utc(2025, 1, 27, 4, 30)));
    }

    #[test]
    fn test_registry_fallback() {
        let registry = CalendarRegistry::default()
            .with_calendar(fx_calendar())
            .assign("EURUSD", "fx");
        assert_eq!(registry.calendar_for("EURUSD").group(), "fx");
        assert!(!registry.calendar_for("BTCUSD").is_enabled());
    }

    #[test]
    fn test_registry_from_config_assigns_instruments() {
        let configs = vec![CalendarConfig {
            group: "fx".to_string(),
            instruments: vec!["EURUSD".to_string(), "GBPUSD".to_string()],
            weekly_close: Some("Fri 21:00".to_string()),
            weekly_open: Some("Sun 21:00".to_string()),
            ..CalendarConfig::default()
        }];
        let registry = CalendarRegistry::from_config(&configs);
        let cal = registry.calendar_for("GBPUSD");
        assert_eq!(cal.group(), "fx");
        assert!(!cal.is_trading_minute(utc(2024, 1, 6, 12, 0)));
        assert!(registry.calendar_for("eurusd").is_trading_minute(utc(2024, 1, 6, 12, 0)));
    }

    #[test]
    fn test_closed_throughout() {
        let cal = fx_calendar();
        let start = utc(2024, 1, 5, 21, 55).timestamp_millis();
        assert!(cal.is_closed_throughout(start, start + 5 * 60_000));
        assert!(!cal.is_closed_throughout(start - 60_000, start + 60_000));
    }
}
