use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Result of one bounded poll against one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Pre-serialized line-protocol fragment exactly as the producer published it.
    Payload { site: String, raw: String },
    /// Deadline elapsed, connection failed or the transport errored.
    NoData { site: String },
}

impl PollOutcome {
    pub fn payload(site: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Payload {
            site: site.into(),
            raw: raw.into(),
        }
    }

    pub fn no_data(site: impl Into<String>) -> Self {
        Self::NoData { site: site.into() }
    }

    pub fn site(&self) -> &str {
        match self {
            PollOutcome::Payload { site, .. } | PollOutcome::NoData { site } => site,
        }
    }

    pub fn is_payload(&self) -> bool {
        matches!(self, PollOutcome::Payload { .. })
    }
}

/// Most recent record on file for one destination. Read-only snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LastEntry {
    pub tags: BTreeMap<String, Option<String>>,
    pub fields: BTreeMap<String, Option<String>>,
    pub query_time: DateTime<Utc>,
}

impl LastEntry {
    /// Tags with a value, in key order.
    pub fn present_tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags
            .iter()
            .filter_map(|(key, value)| value.as_deref().map(|value| (key.as_str(), value)))
    }
}

/// Tag and field key sets of a measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementMetadata {
    pub tag_keys: BTreeSet<String>,
    pub field_keys: BTreeSet<String>,
}

impl MeasurementMetadata {
    pub fn new<T, F>(tag_keys: T, field_keys: F) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self {
            tag_keys: tag_keys.into_iter().map(Into::into).collect(),
            field_keys: field_keys.into_iter().map(Into::into).collect(),
        }
    }
}
