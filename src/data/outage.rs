/// Known broker outage windows, used to explain missing slots
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct OutageConfig {
    /// Instrument the outage applies to; every instrument when absent
    #[serde(default)]
    pub instrument: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutageWindow {
    pub instrument: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct OutageCatalog {
    windows: Vec<OutageWindow>,
}

impl OutageCatalog {
    pub fn new() -> Self {
        OutageCatalog::default()
    }

    pub fn from_config(configs: &[OutageConfig]) -> Self {
        let mut catalog = OutageCatalog::new();
        for config in configs {
            let window = OutageWindow {
                instrument: config.instrument.clone(),
                start_ms: config.start.timestamp_millis(),
                end_ms: config.end.timestamp_millis(),
                reason: config.reason.clone(),
            };
            if window.end_ms <= window.start_ms {
                warn!(
                    "Ignoring empty outage window {} -> {} ({})",
                    config.start, config.end, config.reason
                );
                continue;
            }
            catalog.windows.push(window);
        }
        catalog
    }

    pub fn add(&mut self, window: OutageWindow) {
        self.windows.push(window);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Is `[start_ms, end_ms)` for `instrument` entirely inside a recorded outage?
    pub fn covers(&self, instrument: &str, start_ms: i64, end_ms: i64) -> bool {
        self.windows.iter().any(|w| {
            w.instrument.as_deref().map_or(true, |i| i == instrument)
                && w.start_ms <= start_ms
                && end_ms <= w.end_ms
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_scoped_and_global() {
        let mut catalog = OutageCatalog::new();
        catalog.add(OutageWindow {
            instrument: Some("EURUSD".to_string()),
            start_ms: 1_000,
            end_ms: 5_000,
            reason: "feed down".to_string(),
        });
        catalog.add(OutageWindow {
            instrument: None,
            start_ms: 10_000,
            end_ms: 20_000,
            reason: "broker maintenance".to_string(),
        });

        assert!(catalog.covers("EURUSD", 1_000, 5_000));
        assert!(!catalog.covers("GBPUSD", 1_000, 5_000));
        assert!(!catalog.covers("EURUSD", 4_000, 6_000));
        assert!(catalog.covers("GBPUSD", 12_000, 13_000));
    }

    #[test]
    fn test_empty_config_window_dropped() {
        let start = DateTime::parse_from_rfc3339("2024-01-05T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let catalog = OutageCatalog::from_config(&[OutageConfig {
            instrument: None,
            start,
            end: start,
            reason: String::new(),
        }]);
        assert!(catalog.is_empty());
    }
}
