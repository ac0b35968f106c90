use crate::aggregate::ResultAggregator;
use crate::config::{MonitorConfig, SiteConfig, SiteRegistry};
use crate::domain::PollOutcome;
use crate::error::{Context, Error, Result};
use crate::line::mark_online;
use crate::metrics::metrics;
use crate::resolver::StalenessResolver;
use crate::store::{InfluxStore, MetricStore};
use crate::transport::rabbitmq::{BrokerError, BrokerSession, ConnectOptions, SiteConsumer};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TARGET: &str = "condor_monitor::app";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Online,
    Offline,
}

/// One encoded line handed to `MonitorApp::emit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedRecord {
    pub site: String,
    pub kind: RecordKind,
    pub line: String,
}

/// Everything one run observed and produced.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: BTreeMap<String, PollOutcome>,
    /// Ascending site-name order.
    pub records: Vec<EmittedRecord>,
}

impl RunReport {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|record| record.line.as_str())
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }
}

pub struct MonitorApp {
    config: Arc<MonitorConfig>,
    store: Arc<dyn MetricStore>,
}

impl MonitorApp {
    pub fn initialise(config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        let store = InfluxStore::new(&config.store).context("failed to construct store client")?;

        tracing::info!(
            target: TARGET,
            event = "app_initialised",
            store = %config.store.base_url(),
            database = %config.store.database,
            measurement = %config.store.measurement,
            output = ?config.output.mode
        );

        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Builds the app around an existing store client.
    pub fn with_store(config: MonitorConfig, store: Arc<dyn MetricStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Loads the polling targets from `job_conf`, falling back to the
    /// configured path. An empty target set is an error.
    pub fn load_sites(&self, job_conf: Option<&Path>) -> Result<SiteRegistry> {
        let path = match job_conf {
            Some(path) => path.to_path_buf(),
            None => match self.config.job_conf_path.as_deref() {
                Some(path) if !path.trim().is_empty() => PathBuf::from(path),
                _ => crate::bail_err!("no job configuration given; pass one with --config"),
            },
        };

        let registry = SiteRegistry::from_path(&path, &self.config.sites)
            .with_context(|| format!("failed to load sites from {}", path.display()))?;

        if registry.is_empty() {
            tracing::error!(
                target: TARGET,
                event = "no_polling_targets",
                path = %path.display(),
                runner_prefix = %self.config.sites.runner_prefix
            );
            crate::bail_err!("no polling targets found in {}", path.display());
        }

        tracing::info!(
            target: TARGET,
            event = "sites_loaded",
            path = %path.display(),
            sites = registry.len()
        );
        Ok(registry)
    }

    /// One full run against the live brokers and store.
    pub async fn run_once(&self, job_conf: Option<&Path>) -> Result<RunReport> {
        let registry = self.load_sites(job_conf)?;
        let options = ConnectOptions::from_settings(&self.config.poll);

        let outcomes = self
            .poll(&registry, move |site: SiteConfig| {
                BrokerSession::connect(site, options.clone())
            })
            .await?;
        let report = self.resolve(&registry, outcomes, Utc::now()).await;

        self.log_summary(&report);
        self.emit(&report).await?;
        Ok(report)
    }

    /// Polls every site once through `connect`.
    pub async fn poll<F, Fut, C>(
        &self,
        registry: &SiteRegistry,
        connect: F,
    ) -> Result<BTreeMap<String, PollOutcome>>
    where
        F: Fn(SiteConfig) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<C, BrokerError>> + Send + 'static,
        C: SiteConsumer,
    {
        if registry.is_empty() {
            crate::bail_err!("no polling targets");
        }

        let aggregator = ResultAggregator::new(self.config.poll.deadline)
            .with_run_timeout(self.config.poll.run_timeout);
        Ok(aggregator.collect(registry, connect).await)
    }

    /// Turns poll outcomes into records: payloads marked online, silent
    /// sites checked for staleness.
    pub async fn resolve(
        &self,
        registry: &SiteRegistry,
        outcomes: BTreeMap<String, PollOutcome>,
        now: DateTime<Utc>,
    ) -> RunReport {
        let schema = &self.config.schema;
        let mut records = Vec::new();
        let mut silent = Vec::new();

        for outcome in outcomes.values() {
            match outcome {
                PollOutcome::Payload { site, raw } => records.push(EmittedRecord {
                    site: site.clone(),
                    kind: RecordKind::Online,
                    line: mark_online(raw, &schema.status_field, &schema.online_value),
                }),
                PollOutcome::NoData { site } => match registry.get(site) {
                    Some(config) => silent.push(config),
                    None => tracing::warn!(target: TARGET, event = "unknown_site_outcome", site = %site),
                },
            }
        }

        let resolver = StalenessResolver::from_config(Arc::clone(&self.store), &self.config);
        for (site, record) in resolver.resolve_all(silent, now).await {
            records.push(EmittedRecord {
                site,
                kind: RecordKind::Offline,
                line: record.encode(),
            });
        }

        records.sort_by(|a, b| a.site.cmp(&b.site));
        RunReport { outcomes, records }
    }

    /// Hands the records to stdout and/or the store, per `output.mode`.
    pub async fn emit(&self, report: &RunReport) -> Result<()> {
        let mode = self.config.output.mode;

        if mode.writes_stdout() {
            let stdout = std::io::stdout();
            write_records(&report.records, &mut stdout.lock())?;
        }

        if mode.writes_store() {
            let lines: Vec<String> = report.lines().map(str::to_string).collect();
            if let Err(err) = self.store.write_lines(&lines).await {
                metrics().record_store_failure();
                tracing::error!(
                    target: TARGET,
                    event = "store_write_failed",
                    records = lines.len(),
                    error = %err
                );
                return Err(Error::with_context(
                    "failed to write records to the store",
                    err.into(),
                ));
            }
        }

        Ok(())
    }

    fn log_summary(&self, report: &RunReport) {
        let counters = metrics().snapshot();
        tracing::info!(
            target: TARGET,
            event = "run_summary",
            sites = report.outcomes.len(),
            online = report.count(RecordKind::Online),
            offline = report.count(RecordKind::Offline),
            payloads_received = counters.payloads_received,
            polls_empty = counters.polls_empty,
            connect_failures = counters.connect_failures,
            transport_errors = counters.transport_errors,
            resolutions_skipped = counters.resolutions_skipped,
            store_failures = counters.store_failures
        );
    }
}

/// One record per line.
pub fn write_records<W: Write>(records: &[EmittedRecord], out: &mut W) -> Result<()> {
    for record in records {
        writeln!(out, "{}", record.line)?;
    }
    out.flush()?;
    Ok(())
}
