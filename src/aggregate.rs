//! Concurrent per-site polling and outcome collection.

use crate::config::{SiteConfig, SiteRegistry};
use crate::domain::PollOutcome;
use crate::metrics::metrics;
use crate::poller::SitePoller;
use crate::site_event;
use crate::transport::{BrokerError, SiteConsumer};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;

const TARGET: &str = "condor_monitor::aggregate";

/// Outcomes keyed by site name. Each site can be recorded once.
#[derive(Debug, Default)]
pub struct OutcomeSet {
    inner: Mutex<BTreeMap<String, PollOutcome>>,
}

impl OutcomeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` and keeps the first outcome when the site is already present.
    pub fn record(&self, outcome: PollOutcome) -> bool {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.contains_key(outcome.site()) {
            return false;
        }
        guard.insert(outcome.site().to_string(), outcome);
        true
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<String, PollOutcome> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct ResultAggregator {
    poller: Arc<SitePoller>,
    run_timeout: Option<Duration>,
}

impl ResultAggregator {
    pub fn new(deadline: Duration) -> Self {
        Self {
            poller: Arc::new(SitePoller::new(deadline)),
            run_timeout: None,
        }
    }

    /// Abandons workers still running after `run_timeout`; their sites are
    /// missing from the returned map.
    pub fn with_run_timeout(mut self, run_timeout: Option<Duration>) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Polls every site concurrently, one worker and one session per site.
    pub async fn collect<F, Fut, C>(
        &self,
        registry: &SiteRegistry,
        connect: F,
    ) -> BTreeMap<String, PollOutcome>
    where
        F: Fn(SiteConfig) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<C, BrokerError>> + Send + 'static,
        C: SiteConsumer,
    {
        let outcomes = Arc::new(OutcomeSet::new());
        let mut workers = JoinSet::new();

        for site in registry.iter().cloned() {
            let connect = connect.clone();
            let poller = Arc::clone(&self.poller);
            let outcomes = Arc::clone(&outcomes);

            workers.spawn(async move {
                let outcome = poll_site(&poller, site, connect).await;
                if !outcomes.record(outcome) {
                    tracing::warn!(target: TARGET, event = "duplicate_outcome_dropped");
                }
            });
        }

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(target: TARGET, event = "worker_failed", error = %err);
                }
            }
        };

        match self.run_timeout {
            Some(limit) => {
                if timeout(limit, drain).await.is_err() {
                    workers.abort_all();
                    let collected = outcomes.snapshot();
                    let missing: Vec<&str> = registry
                        .iter()
                        .map(|site| site.name.as_str())
                        .filter(|name| !collected.contains_key(*name))
                        .collect();
                    tracing::warn!(
                        target: TARGET,
                        event = "run_timeout_elapsed",
                        timeout_ms = limit.as_millis() as u64,
                        missing = %missing.join(",")
                    );
                } else {
                    backfill_failed_workers(registry, &outcomes);
                }
            }
            None => {
                drain.await;
                backfill_failed_workers(registry, &outcomes);
            }
        }

        let collected = outcomes.snapshot();
        tracing::info!(
            target: TARGET,
            event = "poll_cycle_completed",
            sites = registry.len(),
            outcomes = collected.len(),
            payloads = collected.values().filter(|o| o.is_payload()).count()
        );
        collected
    }
}

/// A worker that died before recording leaves its site without an outcome.
/// Such sites count as silent.
fn backfill_failed_workers(registry: &SiteRegistry, outcomes: &OutcomeSet) {
    for site in registry.iter() {
        if outcomes.record(PollOutcome::no_data(&site.name)) {
            site_event!(
                error,
                TARGET,
                "outcome_backfilled",
                site = site.name,
                vhost = site.virtual_host
            );
        }
    }
}

async fn poll_site<F, Fut, C>(poller: &SitePoller, site: SiteConfig, connect: F) -> PollOutcome
where
    F: Fn(SiteConfig) -> Fut,
    Fut: Future<Output = Result<C, BrokerError>>,
    C: SiteConsumer,
{
    let connecting = connect(site.clone());
    match connecting.await {
        Ok(mut consumer) => {
            let outcome = poller.poll_once(&site, &mut consumer).await;
            consumer.close().await;
            outcome
        }
        Err(err) => {
            metrics().record_connect_failure();
            site_event!(
                warn,
                TARGET,
                "site_unreachable",
                site = site.name,
                vhost = site.virtual_host,
                error = err
            );
            PollOutcome::no_data(&site.name)
        }
    }
}
