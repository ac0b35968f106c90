#[path = "support/mod.rs"]
mod support;

use chrono::{DateTime, TimeZone, Utc};
use condor_monitor::app::{MonitorApp, RecordKind};
use condor_monitor::config::{OutputMode, SiteRegistry};
use condor_monitor::error::Error;
use condor_monitor::store::StoreError;
use std::sync::Arc;
use support::config::{job_conf_yaml, registry, test_config, write_temp};
use support::mocks::{condor_metadata, entry_aged, MockMetricStore, MockSiteBroker};

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Four sites: `a` unreachable and stale, `b` publishing, `c` silent but
/// recently seen, `d` silent with no history.
fn scenario() -> (MockSiteBroker, MockMetricStore, SiteRegistry) {
    let broker = MockSiteBroker::new();
    broker.set_unreachable("pulsar_a");
    broker.publish_metrics(
        "pulsar_b",
        "condor_metrics,cluster=b idle_jobs=2,querytime=1699999999.5,destination_id=pulsar_b",
    );

    let store = MockMetricStore::new(condor_metadata());
    store.insert(
        "pulsar_a",
        entry_aged(now(), 700, &[("cluster", Some("a")), ("owner", None)], &[]),
    );
    store.insert(
        "pulsar_c",
        entry_aged(now(), 30, &[("cluster", Some("c"))], &[]),
    );

    let sites = registry(&["pulsar_a", "pulsar_b", "pulsar_c", "pulsar_d"]);
    (broker, store, sites)
}

#[tokio::test(start_paused = true)]
async fn run_emits_online_and_offline_records_in_site_order() {
    let (broker, store, sites) = scenario();
    let app = MonitorApp::with_store(test_config(), Arc::new(store.clone()));

    let outcomes = app.poll(&sites, broker.connector()).await.expect("poll");
    let report = app.resolve(&sites, outcomes, now()).await;

    assert_eq!(report.outcomes.len(), 4);
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(
        lines,
        vec![
            "condor_metrics,cluster=a destination_id=pulsar_a,destination_status=offline,\
             idle_jobs=,querytime=1700000000.000000,running_jobs= 1700000000000000000",
            "condor_metrics,cluster=b idle_jobs=2,querytime=1699999999.5,\
             destination_id=pulsar_b,destination_status=online",
        ]
    );
    assert_eq!(report.count(RecordKind::Offline), 1);
    assert_eq!(report.count(RecordKind::Online), 1);

    // payload sites never reach the store
    let mut queried = store.queried();
    queried.sort();
    assert_eq!(queried, vec!["pulsar_a", "pulsar_c", "pulsar_d"]);
}

#[tokio::test(start_paused = true)]
async fn store_output_writes_every_record() {
    let (broker, store, sites) = scenario();
    let mut config = test_config();
    config.output.mode = OutputMode::Store;
    let app = MonitorApp::with_store(config, Arc::new(store.clone()));

    let outcomes = app.poll(&sites, broker.connector()).await.expect("poll");
    let report = app.resolve(&sites, outcomes, now()).await;
    app.emit(&report).await.expect("emit");

    let expected: Vec<String> = report.lines().map(str::to_string).collect();
    assert_eq!(store.written(), expected);
}

#[tokio::test(start_paused = true)]
async fn failed_store_write_fails_the_run() {
    let (broker, store, sites) = scenario();
    store.fail_writes(StoreError::unavailable("connection refused"));
    let mut config = test_config();
    config.output.mode = OutputMode::Store;
    let app = MonitorApp::with_store(config, Arc::new(store.clone()));

    let outcomes = app.poll(&sites, broker.connector()).await.expect("poll");
    let report = app.resolve(&sites, outcomes, now()).await;
    let err = app.emit(&report).await.expect_err("write fails");

    assert!(matches!(err.root(), Error::Store(StoreError::Unavailable { .. })), "{err}");
}

#[tokio::test]
async fn empty_site_set_is_an_error() {
    let broker = MockSiteBroker::new();
    let app = MonitorApp::with_store(test_config(), Arc::new(MockMetricStore::default()));

    let err = app
        .poll(&SiteRegistry::default(), broker.connector())
        .await
        .expect_err("no sites");
    assert!(err.to_string().contains("no polling targets"), "{err}");
    assert!(broker.connects().is_empty());
}

#[tokio::test]
async fn run_once_stops_before_polling_when_job_conf_has_no_targets() {
    let (_file, path) = write_temp(&job_conf_yaml(&[]), ".yml");
    let app = MonitorApp::with_store(test_config(), Arc::new(MockMetricStore::default()));

    let err = app.run_once(Some(&path)).await.expect_err("no targets");
    assert!(err.to_string().contains("no polling targets"), "{err}");
}

#[test]
fn job_conf_path_falls_back_to_configuration() {
    let yaml = job_conf_yaml(&[("pulsar_eu_it01", "amqp://mq:5672/pulsar_it01")]);
    let (_file, path) = write_temp(&yaml, ".yml");

    let mut config = test_config();
    config.job_conf_path = Some(path.display().to_string());
    let app = MonitorApp::with_store(config, Arc::new(MockMetricStore::default()));

    let registry = app.load_sites(None).expect("sites");
    assert_eq!(registry.len(), 1);

    let unset = MonitorApp::with_store(test_config(), Arc::new(MockMetricStore::default()));
    assert!(unset.load_sites(None).is_err());
}

#[test]
fn initialise_rejects_invalid_configuration() {
    let mut config = test_config();
    config.staleness.threshold = std::time::Duration::ZERO;

    let err = MonitorApp::initialise(config).err().expect("invalid config");
    assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
}
