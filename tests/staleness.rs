#[path = "support/mod.rs"]
mod support;

use chrono::{DateTime, TimeZone, Utc};
use condor_monitor::domain::MeasurementMetadata;
use condor_monitor::line::FieldRoles;
use condor_monitor::resolver::{Resolution, StalenessResolver};
use condor_monitor::store::StoreError;
use std::sync::Arc;
use std::time::Duration;
use support::config::site;
use support::mocks::{condor_metadata, entry_aged, MockMetricStore};

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn resolver(store: &MockMetricStore) -> StalenessResolver<MockMetricStore> {
    StalenessResolver::new(
        Arc::new(store.clone()),
        "condor_metrics",
        Duration::from_secs(600),
        FieldRoles::new("querytime", "destination_id", "destination_status"),
        "offline",
    )
}

fn seeded_store(age_secs: i64) -> MockMetricStore {
    let store = MockMetricStore::new(condor_metadata());
    store.insert(
        "pulsar_a",
        entry_aged(
            now(),
            age_secs,
            &[("cluster", Some("it01")), ("owner", None)],
            &[
                ("destination_id", Some("pulsar_a")),
                ("destination_status", Some("online")),
                ("idle_jobs", Some("4")),
                ("querytime", Some("1699999300.0")),
                ("running_jobs", Some("12")),
            ],
        ),
    );
    store
}

#[tokio::test]
async fn stale_site_gets_an_offline_record() {
    let store = seeded_store(700);

    let resolution = resolver(&store)
        .resolve(&site("pulsar_a"), now())
        .await
        .expect("resolution");

    let Resolution::Offline(record) = resolution else {
        panic!("expected an offline record, got {resolution:?}");
    };
    assert_eq!(
        record.encode(),
        "condor_metrics,cluster=it01 destination_id=pulsar_a,destination_status=offline,\
         idle_jobs=,querytime=1700000000.000000,running_jobs= 1700000000000000000"
    );
    assert_eq!(store.queried(), vec!["pulsar_a"]);
}

#[tokio::test]
async fn recently_seen_site_emits_nothing() {
    let store = seeded_store(100);

    let resolution = resolver(&store)
        .resolve(&site("pulsar_a"), now())
        .await
        .expect("resolution");

    assert_eq!(
        resolution,
        Resolution::Fresh {
            age: Duration::from_secs(100)
        }
    );
}

#[tokio::test]
async fn age_equal_to_threshold_is_not_stale() {
    let store = seeded_store(600);

    let resolution = resolver(&store)
        .resolve(&site("pulsar_a"), now())
        .await
        .expect("resolution");

    assert!(matches!(resolution, Resolution::Fresh { .. }));
}

#[tokio::test]
async fn offline_tags_are_exactly_the_non_null_tags() {
    let store = seeded_store(3_600);

    let Resolution::Offline(record) = resolver(&store)
        .resolve(&site("pulsar_a"), now())
        .await
        .expect("resolution")
    else {
        panic!("expected offline");
    };

    assert_eq!(
        record.tags(),
        &[("cluster".to_string(), "it01".to_string())]
    );
    let keys: Vec<&str> = record.fields().iter().map(|(k, _)| k.as_str()).collect();
    let metadata = condor_metadata();
    let expected: Vec<&str> = metadata.field_keys.iter().map(String::as_str).collect();
    assert_eq!(keys, expected);
    assert_eq!(record.field_value("running_jobs"), Some(None));
    assert_eq!(record.field_value("destination_status"), Some(Some("offline")));
}

#[tokio::test]
async fn role_fields_missing_from_the_schema_are_appended() {
    let store = MockMetricStore::new(MeasurementMetadata::new(["cluster"], ["slots"]));
    store.insert(
        "pulsar_a",
        entry_aged(now(), 900, &[("cluster", Some("it01"))], &[("slots", Some("8"))]),
    );

    let Resolution::Offline(record) = resolver(&store)
        .resolve(&site("pulsar_a"), now())
        .await
        .expect("resolution")
    else {
        panic!("expected offline");
    };

    assert_eq!(
        record.encode(),
        "condor_metrics,cluster=it01 slots=,querytime=1700000000.000000,\
         destination_id=pulsar_a,destination_status=offline 1700000000000000000"
    );
}

#[tokio::test]
async fn missing_history_is_reported_as_no_prior_entry() {
    let store = MockMetricStore::new(condor_metadata());

    let err = resolver(&store)
        .resolve(&site("pulsar_new"), now())
        .await
        .expect_err("no history");

    assert!(matches!(err, StoreError::NoPriorEntry { .. }));
}

#[tokio::test]
async fn resolve_all_skips_failing_sites_and_keeps_going() {
    let store = seeded_store(700);
    store.insert(
        "pulsar_c",
        entry_aged(now(), 5_000, &[("cluster", Some("cz03"))], &[]),
    );
    store.set_unavailable("pulsar_b");

    let sites = [site("pulsar_a"), site("pulsar_b"), site("pulsar_c"), site("pulsar_d")];
    let records = resolver(&store).resolve_all(sites.iter(), now()).await;

    let resolved: Vec<&str> = records.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(resolved, vec!["pulsar_a", "pulsar_c"]);
    assert_eq!(
        store.queried(),
        vec!["pulsar_a", "pulsar_b", "pulsar_c", "pulsar_d"]
    );
}

#[tokio::test]
async fn metadata_failure_skips_resolution() {
    let store = seeded_store(700);
    store.fail_metadata(StoreError::unavailable("connection refused"));

    let records = resolver(&store)
        .resolve_all([site("pulsar_a")].iter(), now())
        .await;

    assert!(records.is_empty());
    assert!(store.queried().is_empty());
}
