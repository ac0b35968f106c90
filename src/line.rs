//! Line-protocol records: `measurement,tag=v field=v timestamp`.

use crate::config::SchemaSettings;
use std::fmt;

/// How offline synthesis treats a field key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    QueryTime,
    Destination,
    Status,
    Other,
}

/// Field names carrying a [`FieldRole`] other than `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRoles {
    time_field: String,
    destination_field: String,
    status_field: String,
}

impl FieldRoles {
    pub fn new(
        time_field: impl Into<String>,
        destination_field: impl Into<String>,
        status_field: impl Into<String>,
    ) -> Self {
        Self {
            time_field: time_field.into(),
            destination_field: destination_field.into(),
            status_field: status_field.into(),
        }
    }

    pub fn classify(&self, key: &str) -> FieldRole {
        if key == self.time_field {
            FieldRole::QueryTime
        } else if key == self.destination_field {
            FieldRole::Destination
        } else if key == self.status_field {
            FieldRole::Status
        } else {
            FieldRole::Other
        }
    }

    pub fn time_field(&self) -> &str {
        &self.time_field
    }

    pub fn destination_field(&self) -> &str {
        &self.destination_field
    }

    pub fn status_field(&self) -> &str {
        &self.status_field
    }
}

impl From<&SchemaSettings> for FieldRoles {
    fn from(schema: &SchemaSettings) -> Self {
        Self::new(
            schema.time_field.clone(),
            schema.destination_field.clone(),
            schema.status_field.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineRecord {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, Option<String>)>,
    timestamp_ns: Option<i64>,
}

impl LineRecord {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp_ns: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// `None` renders as `key=` so the field key set stays stable across writes.
    pub fn field(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn timestamp_ns(mut self, timestamp_ns: i64) -> Self {
        self.timestamp_ns = Some(timestamp_ns);
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn fields(&self) -> &[(String, Option<String>)] {
        &self.fields
    }

    pub fn field_value(&self, key: &str) -> Option<Option<&str>> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_deref())
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp_ns
    }

    pub fn encode(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape(key, TAG_SPECIALS));
            line.push('=');
            line.push_str(&escape(value, TAG_SPECIALS));
        }

        line.push(' ');
        let fields = self
            .fields
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    escape(key, TAG_SPECIALS),
                    value.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        line.push_str(&fields);

        if let Some(ts) = self.timestamp_ns {
            line.push(' ');
            line.push_str(&ts.to_string());
        }

        line
    }
}

impl fmt::Display for LineRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

const TAG_SPECIALS: &[char] = &[',', '=', ' '];

fn escape(raw: &str, specials: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if specials.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Appends the online status field to a producer fragment without re-encoding it.
pub fn mark_online(raw: &str, status_field: &str, online_value: &str) -> String {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    format!("{trimmed},{status_field}={online_value}")
}
