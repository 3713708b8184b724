#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use kln_core::{Criteria, DeletionMarker, Record, ResourceType};
use kln_ops::{select, select_at, sweep, SweepOptions};
use kln_store::{MemoryStore, Op, Propagation, ResourceStore, StoreError};
use serde_json::json;

fn agroup() -> ResourceType {
    ResourceType::new("agroup", "aversion", "akinds")
}

fn fake() -> ResourceType {
    ResourceType::new("fake", "fakeVersion", "fakes")
}

fn obj(name: &str, ns: &str, created: DateTime<Utc>, status: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "agroup/aversion",
        "kind": "AKind",
        "metadata": {"name": name, "namespace": ns, "creationTimestamp": created.to_rfc3339()},
        "status": status,
    })
}

/// name1/ns 10m old, name2/ns 40m old, name3/ns3 70m old.
async fn fixture(now: DateTime<Utc>) -> MemoryStore {
    let store = MemoryStore::new();
    let s1 = json!({"foo": "bar", "tomato": "potato"});
    let s2 = json!({"foo": "bar", "status": {"baz": {"deep": "nest"}, "tomato": "potato"}});
    let s3 = json!({"foo": "notBar", "status": {"baz": "fail"}});
    store.insert_object(&agroup(), &obj("name1", "ns", now - Duration::minutes(10), s1)).await.unwrap();
    store.insert_object(&agroup(), &obj("name2", "ns", now - Duration::minutes(40), s2)).await.unwrap();
    store.insert_object(&agroup(), &obj("name3", "ns3", now - Duration::minutes(70), s3)).await.unwrap();
    store
}

async fn names(store: &MemoryStore, criteria: Criteria, now: DateTime<Utc>) -> Vec<String> {
    select_at(store, &criteria, now).await.unwrap().into_iter().map(|r| r.name).collect()
}

#[tokio::test]
async fn selection_table() {
    let now = Utc::now();
    let store = fixture(now).await;
    let base = || Criteria::new(agroup());

    let cases: Vec<(&str, Criteria, Vec<&str>)> = vec![
        ("only gvr", base(), vec!["name1", "name2", "name3"]),
        ("unknown gvr", Criteria::new(fake()), vec![]),
        ("minAge half hour", base().with_min_age(0.5), vec!["name2", "name3"]),
        ("minAge too high", base().with_min_age(1.5), vec![]),
        ("metadata namespace", base().with_metadata(json!({"namespace": "ns"})), vec!["name1", "name2"]),
        ("metadata no such name", base().with_metadata(json!({"namespace": "ns", "name": "fake"})), vec![]),
        ("minAge and metadata", base().with_metadata(json!({"namespace": "ns"})).with_min_age(0.5), vec!["name2"]),
        ("minAge and bad metadata", base().with_metadata(json!({"name": "fake"})).with_min_age(0.5), vec![]),
        ("status", base().with_status(json!({"foo": "bar"})), vec!["name1", "name2"]),
        ("nested status", base().with_status(json!({"status": {"baz": {"deep": "nest"}}})), vec!["name2"]),
        ("top level only", base().with_status(json!({"tomato": "potato"})), vec!["name1"]),
        ("nested only", base().with_status(json!({"status": {"tomato": "potato"}})), vec!["name2"]),
        ("nested scalar", base().with_status(json!({"status": {"baz": "fail"}})), vec!["name3"]),
    ];

    for (label, criteria, want) in cases {
        assert_eq!(names(&store, criteria, now).await, want, "case: {}", label);
    }
}

#[tokio::test]
async fn negative_min_age_fails_before_listing() {
    let now = Utc::now();
    let store = fixture(now).await;
    let err = select_at(&store, &Criteria::new(agroup()).with_min_age(-1.0), now).await.unwrap_err();
    assert!(matches!(err, kln_ops::EngineError::InvalidCriteria(_)));
    assert_eq!(store.calls(Op::List), 0);
}

#[tokio::test]
async fn store_outage_is_a_transport_error() {
    let now = Utc::now();
    let store = fixture(now).await;
    store.inject_fault(Op::List, &agroup(), None, kln_store::FaultKind::Transport).await;
    let err = select_at(&store, &Criteria::new(agroup()), now).await.unwrap_err();
    assert!(matches!(err, kln_ops::EngineError::Transport { .. }));
}

#[tokio::test]
async fn sweep_deletes_only_marked_records() {
    let now = Utc::now();
    let store = fixture(now).await;
    let marker = DeletionMarker::default();
    store.patch_labels(&agroup(), Some("ns"), "name1", &marker.patch(true)).await.unwrap();
    store.patch_labels(&agroup(), Some("ns"), "name2", &marker.patch(false)).await.unwrap();

    let report = sweep(&store, &agroup(), &SweepOptions::default()).await.unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.deleted[0].name, "name1");
    assert!(store.get(&agroup(), Some("ns"), "name1").await.is_none());
    assert!(store.get(&agroup(), Some("ns"), "name2").await.is_some());
    assert!(store.get(&agroup(), Some("ns3"), "name3").await.is_some());
}

#[tokio::test]
async fn sweep_with_nothing_marked_is_quiet() {
    let now = Utc::now();
    let store = fixture(now).await;
    let report = sweep(&store, &agroup(), &SweepOptions::default()).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(store.calls(Op::Delete), 0);
    assert_eq!(store.len(&agroup()).await, 3);
}

/// Lists every record of the wrapped store twice.
struct Doubling(MemoryStore);

#[async_trait::async_trait]
impl ResourceStore for Doubling {
    async fn list(&self, rt: &ResourceType) -> Result<Vec<Record>, StoreError> {
        let items = self.0.list(rt).await?;
        Ok(items.iter().flat_map(|r| [r.clone(), r.clone()]).collect())
    }

    async fn list_labeled(&self, rt: &ResourceType, key: &str, value: &str) -> Result<Vec<Record>, StoreError> {
        self.0.list_labeled(rt, key, value).await
    }

    async fn patch_labels(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Record, StoreError> {
        self.0.patch_labels(rt, namespace, name, labels).await
    }

    async fn delete(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        propagation: Option<Propagation>,
    ) -> Result<(), StoreError> {
        self.0.delete(rt, namespace, name, propagation).await
    }
}

#[tokio::test]
async fn repeated_candidates_are_selected_once() {
    let now = Utc::now();
    let store = Doubling(fixture(now).await);
    assert_eq!(store.list(&agroup()).await.unwrap().len(), 6);

    let all = select(&store, &Criteria::new(agroup())).await.unwrap();
    let names: Vec<_> = all.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["name1", "name2", "name3"]);

    let one = select(&store, &Criteria::new(agroup()).with_metadata(json!({"name": "name2"}))).await.unwrap();
    assert_eq!(one.len(), 1);
}
