use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::format::NumberFormat;

/// Top-level configuration for the gateway.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often the scheduler ticks. Default: 1s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Value buffer configuration.
    #[serde(default)]
    pub values: ValuesConfig,

    /// Event buffer configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Durable retry spool configuration.
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Remote sink connection configuration.
    #[serde(default)]
    pub sink: SinkSettings,
}

/// Value buffer configuration.
#[derive(Debug, Deserialize)]
pub struct ValuesConfig {
    /// Backing file for the row store. Default: "data/values.json".
    #[serde(default = "default_values_file")]
    pub file: PathBuf,

    /// Max buffered rows. Default: 100.
    #[serde(default = "default_values_buffer_size")]
    pub buffer_size: usize,

    /// Registered data points.
    #[serde(default)]
    pub data_points: Vec<DataPointConfig>,
}

impl Default for ValuesConfig {
    fn default() -> Self {
        Self {
            file: default_values_file(),
            buffer_size: default_values_buffer_size(),
            data_points: Vec::new(),
        }
    }
}

/// One sampled data point.
#[derive(Debug, Deserialize)]
pub struct DataPointConfig {
    /// External data-point identifier.
    pub id: String,

    /// Optional rendering rule for outgoing values.
    #[serde(default)]
    pub format: Option<NumberFormatConfig>,
}

/// Raw number format as written in the configuration file.
#[derive(Debug, Deserialize)]
pub struct NumberFormatConfig {
    /// "fixed" or "precision".
    pub format: String,

    /// Decimal places (fixed) or significant digits (precision).
    pub length: i64,
}

impl NumberFormatConfig {
    /// Validates the raw pair into a format rule.
    pub fn parse(&self) -> Result<NumberFormat, crate::format::FormatError> {
        NumberFormat::parse(&self.format, self.length)
    }
}

/// Event buffer configuration.
#[derive(Debug, Deserialize)]
pub struct EventsConfig {
    /// Snapshot file for the event buffer.
    /// Default: "data/eventContentManager.json".
    #[serde(default = "default_events_file")]
    pub file: PathBuf,

    /// Max buffered events, which is also the candidate window length.
    /// Default: 10.
    #[serde(default = "default_events_buffer_size")]
    pub buffer_size: usize,

    /// Meaning of each discrete event value.
    #[serde(default)]
    pub descriptions: Vec<EventDescriptionConfig>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            file: default_events_file(),
            buffer_size: default_events_buffer_size(),
            descriptions: Vec::new(),
        }
    }
}

/// Meaning of one discrete event value.
#[derive(Debug, Deserialize)]
pub struct EventDescriptionConfig {
    pub value: f64,
    pub description: String,
}

/// Durable retry spool configuration.
#[derive(Debug, Deserialize)]
pub struct SpoolConfig {
    /// Spool base directory; spilled units land in its `values/` and
    /// `events/` subdirectories. Default: "data".
    #[serde(default = "default_spool_dir")]
    pub dir: PathBuf,

    /// Max spilled batch units redelivered per cycle. Default: 5.
    #[serde(default = "default_send_file_limit")]
    pub send_file_limit: usize,

    /// Max spilled event units redelivered per cycle. Default: 5.
    #[serde(default = "default_send_event_limit")]
    pub send_event_limit: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
            send_file_limit: default_send_file_limit(),
            send_event_limit: default_send_event_limit(),
        }
    }
}

/// Remote sink connection configuration.
#[derive(Debug, Default, Deserialize)]
pub struct SinkSettings {
    /// Sink base URL (e.g. "https://sink.example.com").
    #[serde(default)]
    pub endpoint: String,

    /// Tenant the gateway registers under.
    #[serde(default)]
    pub tenant: String,

    /// Client identifier from the credential bundle.
    #[serde(default)]
    pub client_id: String,

    /// Shared secret from the credential bundle.
    #[serde(default)]
    pub shared_secret: String,

    /// Per-attempt request timeout. Default: 10s.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Total attempts per send before spilling. Default: 3.
    #[serde(default = "default_sending_retries")]
    pub sending_retries: u32,

    /// Send every N-th tick. Default: 1.
    #[serde(default = "default_send_interval")]
    pub send_interval: u64,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            bail!("tick_interval must be positive");
        }

        if self.values.buffer_size == 0 {
            bail!("values.buffer_size must be positive");
        }

        let mut ids = HashSet::new();
        for point in &self.values.data_points {
            if point.id.is_empty() {
                bail!("values.data_points entries need a non-empty id");
            }
            if !ids.insert(point.id.as_str()) {
                bail!("duplicate data point id: {}", point.id);
            }
            if let Some(format) = &point.format {
                format
                    .parse()
                    .with_context(|| format!("invalid format for data point {}", point.id))?;
            }
        }

        if self.events.buffer_size == 0 {
            bail!("events.buffer_size must be positive");
        }

        let mut values = Vec::new();
        for description in &self.events.descriptions {
            if values.contains(&description.value.to_bits()) {
                bail!(
                    "duplicate event description for value {}",
                    description.value
                );
            }
            values.push(description.value.to_bits());
        }

        if self.spool.send_file_limit == 0 {
            bail!("spool.send_file_limit must be positive");
        }
        if self.spool.send_event_limit == 0 {
            bail!("spool.send_event_limit must be positive");
        }

        if self.sink.endpoint.is_empty() {
            bail!("sink.endpoint is required");
        }
        if self.sink.timeout.is_zero() {
            bail!("sink.timeout must be positive");
        }
        if self.sink.sending_retries == 0 {
            bail!("sink.sending_retries must be positive");
        }
        if self.sink.send_interval == 0 {
            bail!("sink.send_interval must be positive");
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_values_file() -> PathBuf {
    PathBuf::from("data/values.json")
}

fn default_values_buffer_size() -> usize {
    100
}

fn default_events_file() -> PathBuf {
    PathBuf::from("data/eventContentManager.json")
}

fn default_events_buffer_size() -> usize {
    10
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_send_file_limit() -> usize {
    5
}

fn default_send_event_limit() -> usize {
    5
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sending_retries() -> u32 {
    3
}

fn default_send_interval() -> u64 {
    1
}
