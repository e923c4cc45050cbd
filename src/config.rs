use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(feature = "kinesis")]
use crate::client::kinesis::KinesisConfig;
use crate::error::ConfigError;

fn default_format() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    600_000
}

fn default_threshold() -> usize {
    10
}

fn default_channel_capacity() -> usize {
    1_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

/// How a flush hands the buffer to the stream client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// One put carrying the whole buffer as a JSON array.
    #[default]
    Batch,
    /// One put per buffered record.
    PerRecord,
}

/// Batching writer options as they appear in `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_format", alias = "loggly")]
    pub format: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default)]
    pub retry_time_ms: u64,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub explicit_hash_key: Option<String>,
    #[serde(default)]
    pub sequence_number_for_ordering: Option<String>,
    #[serde(default)]
    pub payload_mode: PayloadMode,
    #[serde(default)]
    pub cancel_retry_on_close: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            tags: Vec::new(),
            interval_ms: default_interval_ms(),
            threshold: default_threshold(),
            retry_time_ms: 0,
            partition_key: None,
            stream_name: None,
            explicit_hash_key: None,
            sequence_number_for_ordering: None,
            payload_mode: PayloadMode::default(),
            cancel_retry_on_close: false,
        }
    }
}

impl WriterConfig {
    pub fn new(stream_name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            stream_name: Some(stream_name.into()),
            partition_key: Some(partition_key.into()),
            ..Self::default()
        }
    }

    pub fn validate(self) -> Result<WriterSettings, ConfigError> {
        let partition_key = non_empty(self.partition_key, "partition_key")?;
        let stream_name = non_empty(self.stream_name, "stream_name")?;
        if self.threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }

        Ok(WriterSettings {
            format: self.format,
            tags: self.tags,
            interval: (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms)),
            threshold: self.threshold,
            retry_delay: (self.retry_time_ms > 0).then(|| Duration::from_millis(self.retry_time_ms)),
            partition_key,
            stream_name,
            explicit_hash_key: self.explicit_hash_key.filter(|k| !k.is_empty()),
            sequence_number_for_ordering: self
                .sequence_number_for_ordering
                .filter(|s| !s.is_empty()),
            payload_mode: self.payload_mode,
            cancel_retry_on_close: self.cancel_retry_on_close,
        })
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingField(field))
}

/// Validated, immutable writer settings. `None` disables a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSettings {
    pub format: bool,
    pub tags: Vec<String>,
    pub interval: Option<Duration>,
    pub threshold: usize,
    pub retry_delay: Option<Duration>,
    pub partition_key: String,
    pub stream_name: String,
    pub explicit_hash_key: Option<String>,
    pub sequence_number_for_ordering: Option<String>,
    pub payload_mode: PayloadMode,
    pub cancel_retry_on_close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientConfig {
    Stdout {},
    #[cfg(feature = "kinesis")]
    Kinesis(KinesisConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub run_duration_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long to wait at exit for a retry still pending after close.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    pub services: Vec<ServiceConfig>,
    pub client: ClientConfig,
    pub writer: WriterConfig,
}

/// A synthetic event source for the demo binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub rate_per_sec: f64,
    pub event_weights: EventWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWeights {
    pub log: f64,
    pub request: f64,
    pub response: f64,
    pub error: f64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            run_duration_secs: 30,
            channel_capacity: default_channel_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            client: ClientConfig::Stdout {},
            writer: WriterConfig {
                tags: vec!["forwarder".into()],
                interval_ms: 5_000,
                ..WriterConfig::new("events", "default")
            },
            services: vec![
                ServiceConfig {
                    name: "api-gateway".into(),
                    rate_per_sec: 20.0,
                    event_weights: EventWeights {
                        log: 0.2,
                        request: 0.4,
                        response: 0.35,
                        error: 0.05,
                    },
                },
                ServiceConfig {
                    name: "auth-service".into(),
                    rate_per_sec: 5.0,
                    event_weights: EventWeights {
                        log: 0.5,
                        request: 0.2,
                        response: 0.15,
                        error: 0.15,
                    },
                },
            ],
        }
    }
}

/// Expand `${VAR_NAME}` patterns in a string with environment variable values.
/// Unknown vars become empty strings.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    // Substituted values are never rescanned.
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        let var_name = &rest[start + 2..start + end];
        result.push_str(&rest[..start]);
        result.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);
    result
}

pub fn parse_config(contents: &str) -> Result<ForwarderConfig, ConfigError> {
    let expanded = expand_env_vars(contents);
    Ok(serde_yaml::from_str(&expanded)?)
}

/// Read `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<ForwarderConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No {} found, using defaults", path.display());
            Ok(ForwarderConfig::default())
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
