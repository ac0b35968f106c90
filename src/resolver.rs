//! Offline detection for sites that produced no data this run.

use crate::config::{MonitorConfig, SiteConfig};
use crate::domain::{LastEntry, MeasurementMetadata};
use crate::line::{FieldRole, FieldRoles, LineRecord};
use crate::metrics::metrics;
use crate::site_event;
use crate::store::{LastEntryQuery, MetricStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const TARGET: &str = "condor_monitor::resolver";

/// What resolution decided for one site.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Last entry is older than the threshold; the record marks the site offline.
    Offline(LineRecord),
    /// Last entry is recent enough; nothing is written this run.
    Fresh { age: Duration },
}

pub struct StalenessResolver<S: ?Sized> {
    store: Arc<S>,
    measurement: String,
    threshold: Duration,
    roles: FieldRoles,
    offline_value: String,
}

impl<S> StalenessResolver<S>
where
    S: MetricStore + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        measurement: impl Into<String>,
        threshold: Duration,
        roles: FieldRoles,
        offline_value: impl Into<String>,
    ) -> Self {
        Self {
            store,
            measurement: measurement.into(),
            threshold,
            roles,
            offline_value: offline_value.into(),
        }
    }

    pub fn from_config(store: Arc<S>, config: &MonitorConfig) -> Self {
        Self::new(
            store,
            config.store.measurement.clone(),
            config.staleness.threshold,
            FieldRoles::from(&config.schema),
            config.schema.offline_value.clone(),
        )
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Fetches the schema and newest entry for the site and applies the
    /// staleness rule against `now`.
    pub async fn resolve(
        &self,
        site: &SiteConfig,
        now: DateTime<Utc>,
    ) -> Result<Resolution, StoreError> {
        let metadata = self.store.measurement_metadata(&self.measurement).await?;
        let query = LastEntryQuery {
            measurement: &self.measurement,
            destination_field: self.roles.destination_field(),
            destination: &site.virtual_host,
            time_field: self.roles.time_field(),
        };
        let entry = self.store.last_entry(query, &metadata).await?;

        let age = entry_age(&entry, now);
        if age <= self.threshold {
            return Ok(Resolution::Fresh { age });
        }

        Ok(Resolution::Offline(self.offline_record(
            &entry,
            &metadata,
            &site.virtual_host,
            now,
        )))
    }

    /// Resolves every listed site, absorbing store failures per site.
    /// Records come back in the order of `sites`.
    pub async fn resolve_all<'a, I>(&self, sites: I, now: DateTime<Utc>) -> Vec<(String, LineRecord)>
    where
        I: IntoIterator<Item = &'a SiteConfig>,
    {
        let counters = metrics();
        let mut records = Vec::new();

        for site in sites {
            match self.resolve(site, now).await {
                Ok(Resolution::Offline(record)) => {
                    counters.record_offline_record();
                    site_event!(
                        warn,
                        TARGET,
                        "site_offline",
                        site = site.name,
                        vhost = site.virtual_host,
                        threshold_s = self.threshold.as_secs()
                    );
                    records.push((site.name.clone(), record));
                }
                Ok(Resolution::Fresh { age }) => {
                    site_event!(
                        info,
                        TARGET,
                        "site_recently_seen",
                        site = site.name,
                        vhost = site.virtual_host,
                        age_s = age.as_secs()
                    );
                }
                Err(err) => {
                    counters.record_resolution_skipped();
                    if matches!(err, StoreError::Unavailable { .. }) {
                        counters.record_store_failure();
                    }
                    site_event!(
                        error,
                        TARGET,
                        "resolution_skipped",
                        site = site.name,
                        vhost = site.virtual_host,
                        error = err
                    );
                }
            }
        }

        records
    }

    /// Builds the offline record: non-null tags carried over, every schema
    /// field present, role fields refreshed and the rest nulled.
    pub fn offline_record(
        &self,
        entry: &LastEntry,
        metadata: &MeasurementMetadata,
        destination: &str,
        now: DateTime<Utc>,
    ) -> LineRecord {
        let mut record = LineRecord::new(self.measurement.clone());
        for (key, value) in entry.present_tags() {
            record = record.tag(key, value);
        }

        let mut seen_time = false;
        let mut seen_destination = false;
        let mut seen_status = false;

        for key in &metadata.field_keys {
            let value = match self.roles.classify(key) {
                FieldRole::QueryTime => {
                    seen_time = true;
                    Some(epoch_seconds(now))
                }
                FieldRole::Destination => {
                    seen_destination = true;
                    Some(destination.to_string())
                }
                FieldRole::Status => {
                    seen_status = true;
                    Some(self.offline_value.clone())
                }
                FieldRole::Other => None,
            };
            record = record.field(key.clone(), value);
        }

        if !seen_time {
            record = record.field(self.roles.time_field(), Some(epoch_seconds(now)));
        }
        if !seen_destination {
            record = record.field(self.roles.destination_field(), Some(destination.to_string()));
        }
        if !seen_status {
            record = record.field(self.roles.status_field(), Some(self.offline_value.clone()));
        }

        match now.timestamp_nanos_opt() {
            Some(nanos) => record.timestamp_ns(nanos),
            None => record,
        }
    }
}

/// Age of the entry at `now`; entries from the future count as brand new.
pub fn entry_age(entry: &LastEntry, now: DateTime<Utc>) -> Duration {
    (now - entry.query_time).to_std().unwrap_or(Duration::ZERO)
}

/// Epoch seconds with microsecond precision, as the producer writes them.
pub fn epoch_seconds(ts: DateTime<Utc>) -> String {
    format!("{}.{:06}", ts.timestamp(), ts.timestamp_subsec_micros())
}
