//! In-RAM store keyed by resource type, insertion ordered within a type.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::anyhow;
use kln_core::{CoreError, Record, ResourceType};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{Propagation, ResourceStore, StoreError};

/// Store operation, used for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Patch,
    Delete,
}

/// Failure returned by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NotFound,
    Conflict,
    Transport,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Op,
    resource_type: ResourceType,
    /// `None` applies to every record of the type.
    name: Option<String>,
    kind: FaultKind,
}

/// Records held in memory. Lookups are linear within a type, which is fine
/// for test fixtures and `kubectl get -o json` dumps.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<FxHashMap<ResourceType, Vec<Record>>>,
    faults: RwLock<Vec<Fault>>,
    next_rv: AtomicU64,
    lists: AtomicUsize,
    patches: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace (by namespace and name) a record.
    pub async fn insert(&self, mut record: Record) {
        record.resource_version = Some(self.bump_rv());
        let mut objects = self.objects.write().await;
        let items = objects.entry(record.resource_type.clone()).or_default();
        if let Some(idx) = items.iter().position(|x| x.identity() == record.identity()) {
            items[idx] = record;
        } else {
            items.push(record);
        }
    }

    pub async fn insert_object(&self, rt: &ResourceType, raw: &Value) -> Result<(), CoreError> {
        let record = Record::from_object(rt.clone(), raw)?;
        self.insert(record).await;
        Ok(())
    }

    /// Load a `List` document (or a single object) as records of `rt`.
    ///
    /// Only items whose `apiVersion` is present and matches `rt` are taken,
    /// and when `kind` is given the item's `kind` must match too. Items that
    /// do not parse as records are skipped with a warning. Returns how many
    /// were loaded.
    pub async fn load_snapshot(&self, raw: &Value, rt: &ResourceType, kind: Option<&str>) -> usize {
        let items: Vec<&Value> = match raw.get("items").and_then(|v| v.as_array()) {
            Some(items) => items.iter().collect(),
            None => vec![raw],
        };
        let api_version = rt.api_version();
        let mut loaded = 0usize;
        for item in items {
            if item.get("apiVersion").and_then(|v| v.as_str()) != Some(api_version.as_str()) {
                continue;
            }
            if let Some(k) = kind {
                if item.get("kind").and_then(|v| v.as_str()).is_some_and(|v| v != k) {
                    continue;
                }
            }
            match Record::from_object(rt.clone(), item) {
                Ok(record) => {
                    self.insert(record).await;
                    loaded += 1;
                }
                Err(e) => warn!(gvr = %rt, error = %e, "snapshot item skipped"),
            }
        }
        debug!(gvr = %rt, loaded, "snapshot loaded");
        loaded
    }

    pub async fn get(&self, rt: &ResourceType, namespace: Option<&str>, name: &str) -> Option<Record> {
        let objects = self.objects.read().await;
        objects
            .get(rt)
            .and_then(|items| items.iter().find(|x| x.identity() == (namespace, name)).cloned())
    }

    pub async fn len(&self, rt: &ResourceType) -> usize {
        self.objects.read().await.get(rt).map(|v| v.len()).unwrap_or(0)
    }

    /// Make `op` fail for the named record (or every record of the type)
    /// until cleared.
    pub async fn inject_fault(&self, op: Op, rt: &ResourceType, name: Option<&str>, kind: FaultKind) {
        self.faults.write().await.push(Fault {
            op,
            resource_type: rt.clone(),
            name: name.map(|s| s.to_string()),
            kind,
        });
    }

    pub async fn clear_faults(&self) {
        self.faults.write().await.clear();
    }

    /// Number of calls made through the `ResourceStore` interface for `op`.
    pub fn calls(&self, op: Op) -> usize {
        match op {
            Op::List => self.lists.load(Ordering::Relaxed),
            Op::Patch => self.patches.load(Ordering::Relaxed),
            Op::Delete => self.deletes.load(Ordering::Relaxed),
        }
    }

    fn bump_rv(&self) -> String {
        (self.next_rv.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    async fn check_fault(&self, op: Op, rt: &ResourceType, namespace: Option<&str>, name: Option<&str>) -> Result<(), StoreError> {
        let faults = self.faults.read().await;
        let hit = faults.iter().find(|f| {
            f.op == op && &f.resource_type == rt && (f.name.is_none() || f.name.as_deref() == name)
        });
        match hit.map(|f| f.kind) {
            None => Ok(()),
            Some(FaultKind::NotFound) => Err(StoreError::not_found(rt, namespace, name.unwrap_or(""))),
            Some(FaultKind::Conflict) => Err(StoreError::conflict(rt, namespace, name.unwrap_or(""))),
            Some(FaultKind::Transport) => Err(StoreError::Transport(anyhow!("injected transport failure on {:?} {}", op, rt))),
        }
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn list(&self, rt: &ResourceType) -> Result<Vec<Record>, StoreError> {
        self.lists.fetch_add(1, Ordering::Relaxed);
        self.check_fault(Op::List, rt, None, None).await?;
        let objects = self.objects.read().await;
        Ok(objects.get(rt).cloned().unwrap_or_default())
    }

    async fn list_labeled(&self, rt: &ResourceType, key: &str, value: &str) -> Result<Vec<Record>, StoreError> {
        self.lists.fetch_add(1, Ordering::Relaxed);
        self.check_fault(Op::List, rt, None, None).await?;
        let objects = self.objects.read().await;
        Ok(objects
            .get(rt)
            .map(|items| {
                items
                    .iter()
                    .filter(|r| r.labels.get(key).map(|v| v.as_str()) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn patch_labels(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Record, StoreError> {
        self.patches.fetch_add(1, Ordering::Relaxed);
        self.check_fault(Op::Patch, rt, namespace, Some(name)).await?;
        let rv = self.bump_rv();
        let mut objects = self.objects.write().await;
        let record = objects
            .get_mut(rt)
            .and_then(|items| items.iter_mut().find(|x| x.identity() == (namespace, name)))
            .ok_or_else(|| StoreError::not_found(rt, namespace, name))?;
        record.merge_labels(labels);
        record.resource_version = Some(rv);
        debug!(gvr = %rt, ns = ?namespace, name = %name, "labels patched");
        Ok(record.clone())
    }

    async fn delete(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        propagation: Option<Propagation>,
    ) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_fault(Op::Delete, rt, namespace, Some(name)).await?;
        let mut objects = self.objects.write().await;
        let items = objects.get_mut(rt).ok_or_else(|| StoreError::not_found(rt, namespace, name))?;
        let idx = items
            .iter()
            .position(|x| x.identity() == (namespace, name))
            .ok_or_else(|| StoreError::not_found(rt, namespace, name))?;
        items.remove(idx);
        debug!(gvr = %rt, ns = ?namespace, name = %name, propagation = ?propagation, "deleted");
        Ok(())
    }
}
