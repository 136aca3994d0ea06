/// Maintenance CLI for the candle store
use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use candlekeep::{
    config::load_config,
    data::{rebuild_day, reconcile, Cascade, ReadRequest, TieredStore},
    StoreConfig, Timeframe,
};

const USAGE: &str = "usage:
  candlekeep rebuild <instrument> <YYYY-MM-DD>
  candlekeep tail <instrument> <timeframe> <limit>
  candlekeep verify <instrument> <timeframe> <YYYY-MM-DD>";

enum Command {
    Rebuild { instrument: String, day: NaiveDate },
    Tail { instrument: String, timeframe: Timeframe, limit: usize },
    Verify { instrument: String, timeframe: Timeframe, day: NaiveDate },
}

fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid date {}", raw))
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [cmd, instrument, day] if cmd == "rebuild" => Ok(Command::Rebuild {
            instrument: instrument.clone(),
            day: parse_day(day)?,
        }),
        [cmd, instrument, tf, limit] if cmd == "tail" => Ok(Command::Tail {
            instrument: instrument.clone(),
            timeframe: tf.parse()?,
            limit: limit
                .parse()
                .with_context(|| format!("invalid limit {}", limit))?,
        }),
        [cmd, instrument, tf, day] if cmd == "verify" => Ok(Command::Verify {
            instrument: instrument.clone(),
            timeframe: tf.parse()?,
            day: parse_day(day)?,
        }),
        _ => Err(anyhow!("{}", USAGE)),
    }
}

fn init_logging(config: &StoreConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn rebuild(config: StoreConfig, instrument: &str, day: NaiveDate) -> Result<()> {
    let cascade = Cascade::from_config(&config);
    let store = TieredStore::from_config(config);

    let report = rebuild_day(&cascade, &store, instrument, day).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let degraded = store.degraded();
    if degraded.snapshot_write_failures > 0 {
        warn!("⚠️  {} snapshot write(s) failed during rebuild", degraded.snapshot_write_failures);
    }
    Ok(())
}

async fn tail(config: StoreConfig, instrument: &str, timeframe: Timeframe, limit: usize) -> Result<()> {
    let store = TieredStore::from_config(config);
    let request = ReadRequest::new(instrument, timeframe, limit).disk_only();
    let result = store.read_window(&request).await?;

    for warning in &result.warnings {
        warn!("⚠️  {}", warning);
    }
    if result.meta.no_data {
        info!("No {} {} bars on disk", instrument, timeframe);
        return Ok(());
    }
    for bar in &result.bars {
        println!("{}", serde_json::to_string(bar)?);
    }
    Ok(())
}

async fn verify(config: StoreConfig, instrument: &str, timeframe: Timeframe, day: NaiveDate) -> Result<()> {
    let store = TieredStore::from_config(config);
    let read = store.disk().read_day(instrument, timeframe, day).await?;
    if read.malformed > 0 {
        warn!("⚠️  {} malformed line(s) in {} {} {}", read.malformed, instrument, timeframe, day);
    }

    let total = read.bars.len();
    let (bars, report) = reconcile(read.bars);
    match report {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            bail!("{} {} {}: {} -> {} bar(s) after correction", instrument, timeframe, day, total, bars.len());
        }
        None => {
            info!("✅ {} {} {}: {} bar(s), geometry clean", instrument, timeframe, day, total);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path))?;
    init_logging(&config);
    info!("📂 candlekeep using data root {}", config.data_root);

    match command {
        Command::Rebuild { instrument, day } => rebuild(config, &instrument, day).await,
        Command::Tail {
            instrument,
            timeframe,
            limit,
        } => tail(config, &instrument, timeframe, limit).await,
        Command::Verify {
            instrument,
            timeframe,
            day,
        } => verify(config, &instrument, timeframe, day).await,
    }
}
