pub mod sites;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use sites::{SiteConfig, SiteRegistry, SiteRegistryError};

const ENV_PREFIX: &str = "CONDOR_MONITOR";

/// Process-wide settings, built once at startup and passed to each component.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MonitorConfig {
    #[serde(default)]
    pub job_conf_path: Option<String>,
    #[serde(default)]
    pub sites: SiteSelection,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub staleness: StalenessSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub schema: SchemaSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteSelection {
    #[serde(default = "default_runner_prefix")]
    pub runner_prefix: String,
    #[serde(default = "default_url_key")]
    pub url_key: String,
}

impl Default for SiteSelection {
    fn default() -> Self {
        Self {
            runner_prefix: default_runner_prefix(),
            url_key: default_url_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_deadline", deserialize_with = "deserialize_duration")]
    pub deadline: Duration,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(
        default = "default_connect_base_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_base_backoff: Duration,
    #[serde(
        default = "default_connect_max_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_max_backoff: Duration,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub run_timeout: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            deadline: default_deadline(),
            connect_attempts: default_connect_attempts(),
            connect_base_backoff: default_connect_base_backoff(),
            connect_max_backoff: default_connect_max_backoff(),
            connect_timeout: default_connect_timeout(),
            run_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StalenessSettings {
    #[serde(default = "default_threshold", deserialize_with = "deserialize_duration")]
    pub threshold: Duration,
}

impl Default for StalenessSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_store_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl StoreSettings {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            username: None,
            password: None,
            database: default_database(),
            measurement: default_measurement(),
            ssl: false,
            verify_ssl: true,
            timeout: default_store_timeout(),
        }
    }
}

// Hand-written so the password never reaches the logs.
impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("measurement", &self.measurement)
            .field("ssl", &self.ssl)
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Names of the fields the offline synthesis treats specially.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaSettings {
    #[serde(default = "default_time_field")]
    pub time_field: String,
    #[serde(default = "default_destination_field")]
    pub destination_field: String,
    #[serde(default = "default_status_field")]
    pub status_field: String,
    #[serde(default = "default_offline_value")]
    pub offline_value: String,
    #[serde(default = "default_online_value")]
    pub online_value: String,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            time_field: default_time_field(),
            destination_field: default_destination_field(),
            status_field: default_status_field(),
            offline_value: default_offline_value(),
            online_value: default_online_value(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Stdout,
    Store,
    Both,
}

impl OutputMode {
    pub fn writes_stdout(self) -> bool {
        matches!(self, OutputMode::Stdout | OutputMode::Both)
    }

    pub fn writes_store(self) -> bool {
        matches!(self, OutputMode::Store | OutputMode::Both)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OutputSettings {
    #[serde(default)]
    pub mode: OutputMode,
}

#[derive(Debug, Clone, Error)]
#[error("{}", .errors.join("; "))]
pub struct ConfigValidationError {
    pub errors: Vec<String>,
}

impl MonitorConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_builder(
            Config::builder().add_source(File::with_name("config/local").required(false)),
        )
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_builder(Config::builder().add_source(File::from(path.as_ref())))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut errors = Vec::new();

        if self.poll.deadline.is_zero() {
            errors.push("poll.deadline must be greater than zero".to_string());
        }
        if self.poll.connect_attempts == 0 {
            errors.push("poll.connect_attempts must be at least 1".to_string());
        }
        if self.poll.connect_max_backoff < self.poll.connect_base_backoff {
            errors.push(
                "poll.connect_max_backoff must not be shorter than poll.connect_base_backoff"
                    .to_string(),
            );
        }
        if self.poll.connect_timeout.is_zero() {
            errors.push("poll.connect_timeout must be greater than zero".to_string());
        }
        if self.staleness.threshold.is_zero() {
            errors.push("staleness.threshold must be greater than zero".to_string());
        }
        if self.sites.runner_prefix.trim().is_empty() {
            errors.push("sites.runner_prefix must be a non-empty string".to_string());
        }

        for (name, value) in [
            ("store.host", &self.store.host),
            ("store.database", &self.store.database),
            ("store.measurement", &self.store.measurement),
            ("schema.time_field", &self.schema.time_field),
            ("schema.destination_field", &self.schema.destination_field),
            ("schema.status_field", &self.schema.status_field),
            ("schema.offline_value", &self.schema.offline_value),
            ("schema.online_value", &self.schema.online_value),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{name} must be a non-empty string"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError { errors })
        }
    }
}

/// Accepts humantime strings (`2s`, `10m`) and bare integers as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn default_runner_prefix() -> String {
    "pulsar".to_string()
}

fn default_url_key() -> String {
    "amqp_url".to_string()
}

const fn default_deadline() -> Duration {
    Duration::from_secs(2)
}

const fn default_connect_attempts() -> u32 {
    3
}

const fn default_connect_base_backoff() -> Duration {
    Duration::from_millis(250)
}

const fn default_connect_max_backoff() -> Duration {
    Duration::from_secs(2)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_threshold() -> Duration {
    Duration::from_secs(600)
}

fn default_store_host() -> String {
    "localhost".to_string()
}

const fn default_store_port() -> u16 {
    8086
}

fn default_database() -> String {
    "condor".to_string()
}

fn default_measurement() -> String {
    "condor_metrics".to_string()
}

const fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_time_field() -> String {
    "querytime".to_string()
}

fn default_destination_field() -> String {
    "destination_id".to_string()
}

fn default_status_field() -> String {
    "destination_status".to_string()
}

fn default_offline_value() -> String {
    "offline".to_string()
}

fn default_online_value() -> String {
    "online".to_string()
}

const fn default_true() -> bool {
    true
}
