#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use condor_monitor::config::SiteConfig;
use condor_monitor::domain::{LastEntry, MeasurementMetadata};
use condor_monitor::store::{LastEntryQuery, MetricStore, StoreError};
use condor_monitor::transport::{BrokerError, BrokerTopology, SiteConsumer, SiteDelivery};
use futures_util::future::BoxFuture;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted behaviour of one site queue. An exhausted script waits forever.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Deliver(Vec<u8>),
    Fail(BrokerError),
    Closed,
}

/// In-memory stand-in for every site's broker, shared by all workers.
#[derive(Clone, Default, Debug)]
pub struct MockSiteBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default, Debug)]
struct BrokerState {
    scripts: HashMap<String, VecDeque<ScriptStep>>,
    unreachable: HashSet<String>,
    connect_delays: HashMap<String, Duration>,
    connects: Vec<String>,
    acked: Vec<(String, u64)>,
    closed: Vec<String>,
}

pub type ConnectFuture = BoxFuture<'static, Result<MockSiteConsumer, BrokerError>>;

impl MockSiteBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, site: &str, step: ScriptStep) {
        self.inner
            .lock()
            .expect("broker state")
            .scripts
            .entry(site.to_string())
            .or_default()
            .push_back(step);
    }

    /// Queues a producer message carrying `fragment`.
    pub fn publish_metrics(&self, site: &str, fragment: &str) {
        let body = serde_json::to_vec(&json!({ "condor_metrics": fragment })).expect("json body");
        self.push(site, ScriptStep::Deliver(body));
    }

    pub fn publish_raw(&self, site: &str, body: &[u8]) {
        self.push(site, ScriptStep::Deliver(body.to_vec()));
    }

    pub fn fail_receive(&self, site: &str, reason: &str) {
        self.push(site, ScriptStep::Fail(BrokerError::transport(reason)));
    }

    pub fn set_unreachable(&self, site: &str) {
        self.inner
            .lock()
            .expect("broker state")
            .unreachable
            .insert(site.to_string());
    }

    pub fn delay_connect(&self, site: &str, delay: Duration) {
        self.inner
            .lock()
            .expect("broker state")
            .connect_delays
            .insert(site.to_string(), delay);
    }

    pub fn connects(&self) -> Vec<String> {
        self.inner.lock().expect("broker state").connects.clone()
    }

    pub fn acked(&self) -> Vec<(String, u64)> {
        self.inner.lock().expect("broker state").acked.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.inner.lock().expect("broker state").closed.clone()
    }

    pub fn remaining(&self, site: &str) -> usize {
        self.inner
            .lock()
            .expect("broker state")
            .scripts
            .get(site)
            .map_or(0, VecDeque::len)
    }

    /// Connect function handed to the aggregator.
    pub fn connector(&self) -> impl Fn(SiteConfig) -> ConnectFuture + Clone + Send + Sync + 'static {
        let broker = self.clone();
        move |site: SiteConfig| -> ConnectFuture {
            let broker = broker.clone();
            Box::pin(async move { broker.connect(site).await })
        }
    }

    async fn connect(&self, site: SiteConfig) -> Result<MockSiteConsumer, BrokerError> {
        let (delay, unreachable) = {
            let mut state = self.inner.lock().expect("broker state");
            state.connects.push(site.name.clone());
            (
                state.connect_delays.get(&site.name).copied(),
                state.unreachable.contains(&site.name),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if unreachable {
            return Err(BrokerError::Unreachable {
                site: site.name.clone(),
                attempts: 3,
                reason: "connection refused".to_string(),
            });
        }

        Ok(MockSiteConsumer {
            topology: BrokerTopology::for_vhost(&site.virtual_host),
            site,
            broker: self.clone(),
            next_tag: 1,
        })
    }
}

pub struct MockSiteConsumer {
    site: SiteConfig,
    topology: BrokerTopology,
    broker: MockSiteBroker,
    next_tag: u64,
}

#[async_trait]
impl SiteConsumer for MockSiteConsumer {
    async fn next_delivery(&mut self) -> Result<Option<SiteDelivery>, BrokerError> {
        let step = self
            .broker
            .inner
            .lock()
            .expect("broker state")
            .scripts
            .get_mut(&self.site.name)
            .and_then(VecDeque::pop_front);

        match step {
            Some(ScriptStep::Deliver(body)) => {
                let delivery_tag = self.next_tag;
                self.next_tag += 1;
                Ok(Some(SiteDelivery {
                    body,
                    delivery_tag,
                    exchange: self.topology.exchange.clone(),
                    routing_key: self.topology.routing_key.clone(),
                    redelivered: false,
                }))
            }
            Some(ScriptStep::Fail(err)) => Err(err),
            Some(ScriptStep::Closed) => Ok(None),
            None => std::future::pending().await,
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.broker
            .inner
            .lock()
            .expect("broker state")
            .acked
            .push((self.site.name.clone(), delivery_tag));
        Ok(())
    }

    async fn close(&mut self) {
        self.broker
            .inner
            .lock()
            .expect("broker state")
            .closed
            .push(self.site.name.clone());
    }
}

/// In-memory time-series store keyed by destination identifier.
#[derive(Clone, Default, Debug)]
pub struct MockMetricStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Default, Debug)]
struct StoreState {
    metadata: MeasurementMetadata,
    entries: HashMap<String, LastEntry>,
    unavailable: HashSet<String>,
    metadata_error: Option<StoreError>,
    write_error: Option<StoreError>,
    written: Vec<String>,
    queried: Vec<String>,
}

impl MockMetricStore {
    pub fn new(metadata: MeasurementMetadata) -> Self {
        let store = Self::default();
        store.inner.lock().expect("store state").metadata = metadata;
        store
    }

    pub fn insert(&self, destination: &str, entry: LastEntry) {
        self.inner
            .lock()
            .expect("store state")
            .entries
            .insert(destination.to_string(), entry);
    }

    pub fn set_unavailable(&self, destination: &str) {
        self.inner
            .lock()
            .expect("store state")
            .unavailable
            .insert(destination.to_string());
    }

    pub fn fail_metadata(&self, error: StoreError) {
        self.inner.lock().expect("store state").metadata_error = Some(error);
    }

    pub fn fail_writes(&self, error: StoreError) {
        self.inner.lock().expect("store state").write_error = Some(error);
    }

    pub fn written(&self) -> Vec<String> {
        self.inner.lock().expect("store state").written.clone()
    }

    pub fn queried(&self) -> Vec<String> {
        self.inner.lock().expect("store state").queried.clone()
    }
}

#[async_trait]
impl MetricStore for MockMetricStore {
    async fn measurement_metadata(
        &self,
        _measurement: &str,
    ) -> Result<MeasurementMetadata, StoreError> {
        let state = self.inner.lock().expect("store state");
        match &state.metadata_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.metadata.clone()),
        }
    }

    async fn last_entry(
        &self,
        query: LastEntryQuery<'_>,
        _metadata: &MeasurementMetadata,
    ) -> Result<LastEntry, StoreError> {
        let mut state = self.inner.lock().expect("store state");
        state.queried.push(query.destination.to_string());

        if state.unavailable.contains(query.destination) {
            return Err(StoreError::unavailable("connection refused"));
        }
        state
            .entries
            .get(query.destination)
            .cloned()
            .ok_or_else(|| StoreError::NoPriorEntry {
                measurement: query.measurement.to_string(),
                destination: query.destination.to_string(),
            })
    }

    async fn write_lines(&self, lines: &[String]) -> Result<(), StoreError> {
        let mut state = self.inner.lock().expect("store state");
        if let Some(err) = &state.write_error {
            return Err(err.clone());
        }
        state.written.extend(lines.iter().cloned());
        Ok(())
    }
}

/// Builds an entry whose collection time lies `age_secs` before `now`.
pub fn entry_aged(
    now: DateTime<Utc>,
    age_secs: i64,
    tags: &[(&str, Option<&str>)],
    fields: &[(&str, Option<&str>)],
) -> LastEntry {
    LastEntry {
        tags: owned(tags),
        fields: owned(fields),
        query_time: now - ChronoDuration::seconds(age_secs),
    }
}

fn owned(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.map(str::to_string)))
        .collect()
}

/// Schema of the condor measurement used across tests.
pub fn condor_metadata() -> MeasurementMetadata {
    MeasurementMetadata::new(
        ["cluster", "owner"],
        [
            "destination_id",
            "destination_status",
            "idle_jobs",
            "querytime",
            "running_jobs",
        ],
    )
}
