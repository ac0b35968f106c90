//! InfluxDB 1.x HTTP API client (`/query` and `/write`).

use super::{LastEntryQuery, MetricStore, StoreError};
use crate::config::StoreSettings;
use crate::domain::{LastEntry, MeasurementMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

const TARGET: &str = "condor_monitor::store";
const TIME_COLUMN: &str = "time";

pub struct InfluxStore {
    client: Client,
    base_url: Url,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl InfluxStore {
    pub fn new(settings: &StoreSettings) -> Result<Self, StoreError> {
        Self::with_base_url(settings, &settings.base_url())
    }

    pub fn with_base_url(settings: &StoreSettings, base_url: &str) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| StoreError::unavailable(format!("invalid store url `{base_url}`: {err}")))?;

        let client = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .build()
            .map_err(|err| StoreError::unavailable(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url,
            database: settings.database.clone(),
            username: settings.username.clone().filter(|user| !user.is_empty()),
            password: settings.password.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(path)
            .map_err(|err| StoreError::unavailable(format!("invalid store endpoint `{path}`: {err}")))
    }

    fn authorise(&self, request: RequestBuilder) -> RequestBuilder {
        match self.username.as_deref() {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    async fn query(&self, statement: &str) -> Result<Vec<Series>, StoreError> {
        let request = self
            .client
            .get(self.endpoint("query")?)
            .query(&[("db", self.database.as_str()), ("q", statement)]);

        tracing::debug!(target: TARGET, event = "store_query", statement = %statement);

        let response = self
            .authorise(request)
            .send()
            .await
            .map_err(|err| StoreError::unavailable(format!("query request failed: {err}")))?;

        let response = response
            .error_for_status()
            .map_err(|err| StoreError::unavailable(format!("query rejected: {err}")))?;

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|err| StoreError::invalid(format!("query response is not valid JSON: {err}")))?;

        body.into_series()
    }
}

#[async_trait]
impl MetricStore for InfluxStore {
    async fn measurement_metadata(
        &self,
        measurement: &str,
    ) -> Result<MeasurementMetadata, StoreError> {
        let ident = quote_ident(measurement);
        let tag_series = self.query(&format!("SHOW TAG KEYS FROM {ident}")).await?;
        let field_series = self.query(&format!("SHOW FIELD KEYS FROM {ident}")).await?;

        Ok(MeasurementMetadata::new(
            first_column_strings(&tag_series),
            first_column_strings(&field_series),
        ))
    }

    async fn last_entry(
        &self,
        query: LastEntryQuery<'_>,
        metadata: &MeasurementMetadata,
    ) -> Result<LastEntry, StoreError> {
        let statement = last_entry_statement(&query);
        let series = self.query(&statement).await?;

        let no_prior = || StoreError::NoPriorEntry {
            measurement: query.measurement.to_string(),
            destination: query.destination.to_string(),
        };

        let Some(series) = series.into_iter().next() else {
            return Err(no_prior());
        };
        let Some(row) = series.values.first() else {
            return Err(no_prior());
        };

        entry_from_row(&series.columns, row, metadata, query.time_field)
    }

    async fn write_lines(&self, lines: &[String]) -> Result<(), StoreError> {
        if lines.is_empty() {
            return Ok(());
        }

        let request = self
            .client
            .post(self.endpoint("write")?)
            .query(&[("db", self.database.as_str()), ("precision", "ns")])
            .body(lines.join("\n"));

        self.authorise(request)
            .send()
            .await
            .map_err(|err| StoreError::unavailable(format!("write request failed: {err}")))?
            .error_for_status()
            .map_err(|err| StoreError::unavailable(format!("write rejected: {err}")))?;

        tracing::info!(
            target: TARGET,
            event = "records_written",
            database = %self.database,
            records = lines.len()
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

impl QueryResponse {
    fn into_series(self) -> Result<Vec<Series>, StoreError> {
        if let Some(error) = self.error {
            return Err(StoreError::invalid(error));
        }
        let mut series = Vec::new();
        for result in self.results {
            if let Some(error) = result.error {
                return Err(StoreError::invalid(error));
            }
            series.extend(result.series);
        }
        Ok(series)
    }
}

fn first_column_strings(series: &[Series]) -> Vec<String> {
    series
        .iter()
        .flat_map(|s| s.values.iter())
        .filter_map(|row| row.first().and_then(JsonValue::as_str))
        .map(str::to_string)
        .collect()
}

fn entry_from_row(
    columns: &[String],
    row: &[JsonValue],
    metadata: &MeasurementMetadata,
    time_field: &str,
) -> Result<LastEntry, StoreError> {
    let mut tags = BTreeMap::new();
    let mut fields = BTreeMap::new();
    let mut row_time = None;
    let mut field_time = None;

    for (column, value) in columns.iter().zip(row.iter()) {
        if column == TIME_COLUMN {
            row_time = value.as_str().map(str::to_string);
            continue;
        }

        let rendered = render_value(value);
        if column == time_field {
            field_time = value
                .as_f64()
                .or_else(|| rendered.as_deref().and_then(|s| s.parse::<f64>().ok()));
        }

        if metadata.tag_keys.contains(column) {
            tags.insert(column.clone(), rendered);
        } else {
            fields.insert(column.clone(), rendered);
        }
    }

    let query_time = match (field_time, row_time) {
        (Some(secs), _) => epoch_seconds_to_datetime(secs)?,
        (None, Some(raw)) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| StoreError::invalid(format!("invalid time column `{raw}`: {err}")))?,
        (None, None) => return Err(StoreError::invalid("entry carries no timestamp")),
    };

    Ok(LastEntry {
        tags,
        fields,
        query_time,
    })
}

fn epoch_seconds_to_datetime(secs: f64) -> Result<DateTime<Utc>, StoreError> {
    if !secs.is_finite() {
        return Err(StoreError::invalid(format!("invalid epoch seconds `{secs}`")));
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(whole, nanos)
        .ok_or_else(|| StoreError::invalid(format!("epoch seconds `{secs}` out of range")))
}

fn render_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Bool(flag) => Some(flag.to_string()),
        JsonValue::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn last_entry_statement(query: &LastEntryQuery<'_>) -> String {
    format!(
        "SELECT * FROM {} WHERE {} = {} ORDER BY time DESC LIMIT 1",
        quote_ident(query.measurement),
        quote_ident(query.destination_field),
        quote_literal(query.destination)
    )
}

fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

fn quote_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\\', "\\\\").replace('\'', "\\'"))
}
