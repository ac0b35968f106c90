use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{DefaultFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "condor-monitor";
const DEFAULT_FILTER: &str = "condor_monitor=info,info";

/// Fields written right after the header, in this order, when present.
const LEADING_FIELDS: [&str; 3] = ["event", "site", "vhost"];

/// Installs the global subscriber. Logs go to stderr; stdout carries line records.
pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .event_format(KeyValueFormatter::new())
        .fmt_fields(DefaultFields::new())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

/// One `key=value` line per event:
/// `ts level service component [event site vhost] msg [other fields, sorted]`.
pub struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    pub const fn new() -> Self {
        Self {
            service_name: SERVICE_NAME,
        }
    }
}

impl Default for KeyValueFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let mut line = LineBuffer::default();
        line.push("ts", &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        line.push("level", metadata.level().as_str());
        line.push("service", self.service_name);
        line.push("component", metadata.target());

        for key in LEADING_FIELDS {
            if let Some(value) = fields.values.remove(key) {
                line.push(key, &value);
            }
        }

        let message = fields
            .message
            .unwrap_or_else(|| metadata.name().to_string());
        line.push("msg", &message);

        for (key, value) in &fields.values {
            line.push(key, value);
        }

        writer.write_str(&line.0)?;
        writer.write_char('\n')
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    values: BTreeMap<String, String>,
}

impl EventFields {
    fn insert(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            name => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.to_string());
    }
}

#[derive(Default)]
struct LineBuffer(String);

impl LineBuffer {
    fn push(&mut self, key: &str, value: &str) {
        if !self.0.is_empty() {
            self.0.push(' ');
        }
        self.0.push_str(key);
        self.0.push('=');
        self.0.push_str(&quote_if_needed(value));
    }
}

/// Quotes values a log parser would otherwise split.
fn quote_if_needed(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '\\' | '=' | ','));
    if plain {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

/// Process-wide counters for absorbed per-site conditions.
#[derive(Default)]
pub struct RuntimeCounters {
    payloads_received: AtomicU64,
    polls_empty: AtomicU64,
    connect_failures: AtomicU64,
    transport_errors: AtomicU64,
    offline_records: AtomicU64,
    resolutions_skipped: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub payloads_received: u64,
    pub polls_empty: u64,
    pub connect_failures: u64,
    pub transport_errors: u64,
    pub offline_records: u64,
    pub resolutions_skipped: u64,
    pub store_failures: u64,
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

impl RuntimeCounters {
    pub fn inc_payloads_received(&self) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_polls_empty(&self) {
        self.polls_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connect_failures(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transport_errors(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_offline_records(&self) {
        self.offline_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolutions_skipped(&self) {
        self.resolutions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_store_failures(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            polls_empty: self.polls_empty.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            offline_records: self.offline_records.load(Ordering::Relaxed),
            resolutions_skipped: self.resolutions_skipped.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}
