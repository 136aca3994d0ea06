/// Configuration loading: TOML file layered with environment overrides
use std::path::Path;

use ::config::{Config, Environment, File, FileFormat};
use tracing::debug;

use crate::error::{CandleError, Result};
use crate::types::StoreConfig;

/// `CANDLEKEEP__FEED_RETENTION=5000` overrides `feed_retention`
pub const ENV_PREFIX: &str = "CANDLEKEEP";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StoreConfig> {
    load_config_with_prefix(path, ENV_PREFIX)
}

/// A missing file is not an error; defaults and environment still apply
pub fn load_config_with_prefix<P: AsRef<Path>>(path: P, env_prefix: &str) -> Result<StoreConfig> {
    let path = path.as_ref();
    debug!("Loading config from {} (env prefix {})", path.display(), env_prefix);

    let settings = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| CandleError::ConfigError(format!("Failed to read config: {}", e)))?;

    let config: StoreConfig = settings
        .try_deserialize()
        .map_err(|e| CandleError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &StoreConfig) -> Result<()> {
    if config.data_root.trim().is_empty() {
        return Err(CandleError::ConfigError("data_root is empty".to_string()));
    }

    // Tier sizing
    for (name, value) in [
        ("ram_window_capacity", config.ram_window_capacity),
        ("buffer_capacity", config.buffer_capacity),
        ("snapshot_capacity", config.snapshot_capacity),
        ("snapshot_tail_len", config.snapshot_tail_len),
        ("feed_retention", config.feed_retention),
        ("feed_digest_capacity", config.feed_digest_capacity),
        ("feed_channel_capacity", config.feed_channel_capacity),
    ] {
        if value == 0 {
            return Err(CandleError::ConfigError(format!("{} must be > 0", name)));
        }
    }

    for (key, min) in &config.snapshot_min_bars {
        key.parse::<crate::types::Timeframe>().map_err(|_| {
            CandleError::ConfigError(format!("snapshot_min_bars: unknown timeframe {}", key))
        })?;
        if *min > config.snapshot_tail_len {
            return Err(CandleError::ConfigError(format!(
                "snapshot_min_bars.{} = {} exceeds snapshot_tail_len {}",
                key, min, config.snapshot_tail_len
            )));
        }
    }

    if !config.flat_volume_threshold.is_finite() || config.flat_volume_threshold < 0.0 {
        return Err(CandleError::ConfigError(format!(
            "Invalid flat_volume_threshold: {}",
            config.flat_volume_threshold
        )));
    }

    // Anchors must keep every bucket of the class on its grid
    let anchors = &config.anchors;
    for (class, offsets, granularity) in [
        ("sub_4h", &anchors.sub_4h, 60),
        ("four_hour", &anchors.four_hour, 3_600),
        ("daily", &anchors.daily, 3_600),
    ] {
        for anchor in offsets.candidates() {
            if anchor % granularity != 0 {
                return Err(CandleError::ConfigError(format!(
                    "anchors.{}: offset {}s is not a multiple of {}s",
                    class, anchor, granularity
                )));
            }
        }
    }

    let mut groups = std::collections::HashSet::new();
    for calendar in &config.calendars {
        if calendar.group.trim().is_empty() {
            return Err(CandleError::ConfigError("calendar with empty group".to_string()));
        }
        if !groups.insert(calendar.group.as_str()) {
            return Err(CandleError::ConfigError(format!(
                "calendar group {} defined twice",
                calendar.group
            )));
        }
    }

    for outage in &config.outages {
        if outage.end <= outage.start {
            return Err(CandleError::ConfigError(format!(
                "outage {} ends before it starts",
                outage.reason
            )));
        }
    }

    if !matches!(config.log_format.as_str(), "text" | "json") {
        return Err(CandleError::ConfigError(format!(
            "log_format must be text or json, got {}",
            config.log_format
        )));
    }

    Ok(())
}
