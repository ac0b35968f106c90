//! Site-side publisher: runs the status script and pushes one fragment.

use crate::config::SiteConfig;
use crate::resolver::epoch_seconds;
use crate::transport::rabbitmq::{BrokerError, BrokerPublisher, ConnectOptions};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::process::Command;

const TARGET: &str = "condor_monitor::producer";
const QUEUE_URL_KEY: &str = "message_queue_url";

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("application config `{}` not found", .path.display())]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("application config is malformed: {reason}")]
    ConfigMalformed { reason: String },
    #[error("status command `{script}` failed: {reason}")]
    Command { script: String, reason: String },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Deserialize)]
struct AppConfig {
    #[serde(default)]
    message_queue_url: Option<String>,
}

/// Reads the broker URL a site publishes to from its application config.
pub fn read_queue_url(path: impl AsRef<Path>) -> Result<String, ProducerError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ProducerError::ConfigNotFound {
        path: path.to_path_buf(),
        source,
    })?;
    parse_queue_url(&raw)
}

pub fn parse_queue_url(raw: &str) -> Result<String, ProducerError> {
    let config: AppConfig =
        serde_yaml::from_str(raw).map_err(|err| ProducerError::ConfigMalformed {
            reason: err.to_string(),
        })?;

    match config.message_queue_url {
        Some(url) if !url.trim().is_empty() => Ok(url.trim().to_string()),
        _ => Err(ProducerError::ConfigMalformed {
            reason: format!("`{QUEUE_URL_KEY}` is missing or empty"),
        }),
    }
}

fn empty_value_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\w+)=,").ok()).as_ref()
}

/// Fills empty field values (`key=,`) with zero.
pub fn fill_empty_values(output: &str) -> String {
    match empty_value_pattern() {
        Some(pattern) => pattern.replace_all(output, "${1}=0,").into_owned(),
        None => output.to_string(),
    }
}

/// Turns raw script output into the published fragment.
pub fn build_fragment(
    output: &str,
    destination: &str,
    collected_at: DateTime<Utc>,
    time_field: &str,
    destination_field: &str,
) -> String {
    let filled = fill_empty_values(output.trim());
    format!(
        "{filled},{time_field}={},{destination_field}={destination}",
        epoch_seconds(collected_at)
    )
}

pub async fn run_status_script(script: &Path) -> Result<String, ProducerError> {
    let command_error = |reason: String| ProducerError::Command {
        script: script.display().to_string(),
        reason,
    };

    let output = Command::new("sh")
        .arg(script)
        .output()
        .await
        .map_err(|err| command_error(err.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(command_error(format!(
            "exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|err| command_error(format!("output is not UTF-8: {err}")))
}

/// Inputs of one `publish` invocation.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub app_config: PathBuf,
    pub script: PathBuf,
    pub time_field: String,
    pub destination_field: String,
    pub connect: ConnectOptions,
}

/// Collects the site status and publishes it once. Returns the fragment sent.
pub async fn publish_once(request: &PublishRequest) -> Result<String, ProducerError> {
    let url = read_queue_url(&request.app_config)?;
    let site = SiteConfig::new("local", url);

    let output = run_status_script(&request.script).await?;
    let fragment = build_fragment(
        &output,
        &site.virtual_host,
        Utc::now(),
        &request.time_field,
        &request.destination_field,
    );

    let publisher = BrokerPublisher::connect(site.clone(), request.connect.clone()).await?;
    let published = publisher
        .publish_json(&serde_json::json!({ "condor_metrics": fragment }))
        .await;
    publisher.close().await;
    published?;

    tracing::info!(
        target: TARGET,
        event = "fragment_published",
        vhost = %site.virtual_host,
        bytes = fragment.len()
    );
    Ok(fragment)
}
