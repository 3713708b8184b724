#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kln_core::{DeletionMarker, ResourceType};
use kln_store::{FaultKind, MemoryStore, Op, ResourceStore, StoreError};
use serde_json::json;

fn rt() -> ResourceType {
    ResourceType::new("agroup", "aversion", "akinds")
}

fn obj(name: &str, ns: &str, labels: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "agroup/aversion",
        "kind": "AKind",
        "metadata": {"name": name, "namespace": ns, "creationTimestamp": "2020-01-01T00:00:00Z", "labels": labels},
    })
}

#[tokio::test]
async fn insert_replaces_by_identity_and_keeps_order() {
    let store = MemoryStore::new();
    store.insert_object(&rt(), &obj("a", "ns", json!({}))).await.unwrap();
    store.insert_object(&rt(), &obj("b", "ns", json!({}))).await.unwrap();
    store.insert_object(&rt(), &obj("a", "ns", json!({"v": "2"}))).await.unwrap();
    store.insert_object(&rt(), &obj("a", "other", json!({}))).await.unwrap();

    let items = store.list(&rt()).await.unwrap();
    let ids: Vec<_> = items.iter().map(|r| format!("{}/{}", r.namespace.as_deref().unwrap_or("-"), r.name)).collect();
    assert_eq!(ids, vec!["ns/a", "ns/b", "other/a"]);
    assert_eq!(items[0].labels["v"], "2");
    assert_eq!(store.calls(Op::List), 1);
}

#[tokio::test]
async fn unknown_type_lists_empty() {
    let store = MemoryStore::new();
    let other = ResourceType::new("fake", "fakeVersion", "fakes");
    assert!(store.list(&other).await.unwrap().is_empty());
}

#[tokio::test]
async fn label_selector_is_exact() {
    let store = MemoryStore::new();
    store.insert_object(&rt(), &obj("t", "ns", json!({"kln.com/delete": "true"}))).await.unwrap();
    store.insert_object(&rt(), &obj("f", "ns", json!({"kln.com/delete": "false"}))).await.unwrap();
    store.insert_object(&rt(), &obj("n", "ns", json!({}))).await.unwrap();
    store.insert_object(&rt(), &obj("u", "ns", json!({"kln.com/delete": "True"}))).await.unwrap();

    let marked = store.list_labeled(&rt(), "kln.com/delete", "true").await.unwrap();
    assert_eq!(marked.len(), 1);
    assert_eq!(marked[0].name, "t");
}

#[tokio::test]
async fn patch_merges_labels_and_bumps_resource_version() {
    let store = MemoryStore::new();
    store.insert_object(&rt(), &obj("a", "ns", json!({"foo": "bar"}))).await.unwrap();
    let before = store.get(&rt(), Some("ns"), "a").await.unwrap();

    let marker = DeletionMarker::default();
    let after = store.patch_labels(&rt(), Some("ns"), "a", &marker.patch(true)).await.unwrap();
    assert_ne!(before.resource_version, after.resource_version);
    let want: BTreeMap<String, String> =
        [("foo".to_string(), "bar".to_string()), ("kln.com/delete".to_string(), "true".to_string())].into();
    assert_eq!(after.labels, want);
    assert_eq!(store.get(&rt(), Some("ns"), "a").await.unwrap().labels, want);
}

#[tokio::test]
async fn patch_and_delete_of_missing_record_are_not_found() {
    let store = MemoryStore::new();
    let marker = DeletionMarker::default();
    let err = store.patch_labels(&rt(), Some("ns"), "ghost", &marker.patch(true)).await.unwrap_err();
    assert!(err.is_not_found());
    let err = store.delete(&rt(), Some("ns"), "ghost", None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(msg) if msg.contains("ns/ghost")));
}

#[tokio::test]
async fn delete_removes_only_the_target() {
    let store = MemoryStore::new();
    store.insert_object(&rt(), &obj("a", "ns", json!({}))).await.unwrap();
    store.insert_object(&rt(), &obj("a", "ns3", json!({}))).await.unwrap();
    store.delete(&rt(), Some("ns"), "a", None).await.unwrap();
    assert_eq!(store.len(&rt()).await, 1);
    assert!(store.get(&rt(), Some("ns3"), "a").await.is_some());
    assert_eq!(store.calls(Op::Delete), 1);
}

#[tokio::test]
async fn injected_faults_hit_named_records_only() {
    let store = MemoryStore::new();
    store.insert_object(&rt(), &obj("a", "ns", json!({}))).await.unwrap();
    store.insert_object(&rt(), &obj("b", "ns", json!({}))).await.unwrap();
    store.inject_fault(Op::Patch, &rt(), Some("a"), FaultKind::Conflict).await;
    store.inject_fault(Op::List, &ResourceType::new("", "v1", "pods"), None, FaultKind::Transport).await;

    let patch = DeletionMarker::default().patch(true);
    assert!(matches!(store.patch_labels(&rt(), Some("ns"), "a", &patch).await, Err(StoreError::Conflict(_))));
    assert!(store.patch_labels(&rt(), Some("ns"), "b", &patch).await.is_ok());
    assert!(store.list(&rt()).await.is_ok());
    assert!(matches!(
        store.list(&ResourceType::new("", "v1", "pods")).await,
        Err(StoreError::Transport(_))
    ));

    store.clear_faults().await;
    assert!(store.patch_labels(&rt(), Some("ns"), "a", &patch).await.is_ok());
}

#[tokio::test]
async fn snapshot_filters_by_api_version_and_kind() {
    let store = MemoryStore::new();
    let list = json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            obj("a", "ns", json!({})),
            {"apiVersion": "other/v1", "kind": "AKind", "metadata": {"name": "x", "namespace": "ns"}},
            {"apiVersion": "agroup/aversion", "kind": "BKind", "metadata": {"name": "y", "namespace": "ns"}},
        ]
    });
    let n = store.load_snapshot(&list, &rt(), Some("AKind")).await;
    assert_eq!(n, 1);
    assert_eq!(store.list(&rt()).await.unwrap()[0].name, "a");

    let single = obj("solo", "ns", json!({}));
    assert_eq!(store.load_snapshot(&single, &rt(), None).await, 1);
    assert_eq!(store.len(&rt()).await, 2);
}

#[tokio::test]
async fn snapshot_requires_api_version_and_skips_malformed_items() {
    let store = MemoryStore::new();
    let list = json!({
        "items": [
            {"kind": "AKind", "metadata": {"name": "untyped", "namespace": "ns"}},
            {
                "apiVersion": "agroup/aversion",
                "kind": "AKind",
                "metadata": {"name": "bad-ts", "namespace": "ns", "creationTimestamp": "yesterday"},
            },
            {"apiVersion": "agroup/aversion", "kind": "AKind", "metadata": {"namespace": "ns"}},
            obj("good", "ns", json!({})),
        ]
    });
    assert_eq!(store.load_snapshot(&list, &rt(), None).await, 1);
    assert_eq!(store.list(&rt()).await.unwrap()[0].name, "good");

    let pods = ResourceType::new("", "v1", "pods");
    assert_eq!(store.load_snapshot(&list, &pods, None).await, 0);
    assert!(store.list(&pods).await.unwrap().is_empty());
}
