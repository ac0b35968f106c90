#![forbid(unsafe_code)]

pub mod influx;

use crate::domain::{LastEntry, MeasurementMetadata};
use async_trait::async_trait;
use thiserror::Error;

pub use influx::InfluxStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("time-series store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("no prior entry in `{measurement}` for destination `{destination}`")]
    NoPriorEntry {
        measurement: String,
        destination: String,
    },
    #[error("unexpected time-series store response: {reason}")]
    InvalidResponse { reason: String },
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }
}

/// Lookup of the newest record for one destination.
#[derive(Debug, Clone, Copy)]
pub struct LastEntryQuery<'a> {
    pub measurement: &'a str,
    pub destination_field: &'a str,
    pub destination: &'a str,
    /// Field holding the producer's collection time, preferred over the row time.
    pub time_field: &'a str,
}

#[async_trait]
pub trait MetricStore: Send + Sync + 'static {
    async fn measurement_metadata(
        &self,
        measurement: &str,
    ) -> Result<MeasurementMetadata, StoreError>;

    /// Newest entry for the destination, with columns split by `metadata`.
    async fn last_entry(
        &self,
        query: LastEntryQuery<'_>,
        metadata: &MeasurementMetadata,
    ) -> Result<LastEntry, StoreError>;

    /// Writes already encoded line-protocol records in one request.
    async fn write_lines(&self, lines: &[String]) -> Result<(), StoreError>;
}
