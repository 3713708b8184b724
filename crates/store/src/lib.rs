//! kln store: the collaborator interface the engine talks to, plus an in-RAM
//! implementation used for tests and offline snapshots.

#![forbid(unsafe_code)]

mod memory;

use std::collections::BTreeMap;

use kln_core::{Record, RecordRef, ResourceType};
use serde::{Deserialize, Serialize};

pub use memory::{FaultKind, MemoryStore, Op};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(rt: &ResourceType, namespace: Option<&str>, name: &str) -> Self {
        Self::NotFound(describe(rt, namespace, name))
    }

    pub fn conflict(rt: &ResourceType, namespace: Option<&str>, name: &str) -> Self {
        Self::Conflict(describe(rt, namespace, name))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

fn describe(rt: &ResourceType, namespace: Option<&str>, name: &str) -> String {
    RecordRef { resource_type: rt.clone(), namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
        .to_string()
}

/// Cascading behaviour for deletes; `None` at the call site means server default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Background,
    Foreground,
    Orphan,
}

/// Resource store operations the engine relies on. Every call is a single
/// round-trip; implementations do not retry.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    /// All records of a type, across namespaces.
    async fn list(&self, rt: &ResourceType) -> Result<Vec<Record>, StoreError>;

    /// Records of a type whose label `key` is exactly `value`.
    async fn list_labeled(&self, rt: &ResourceType, key: &str, value: &str) -> Result<Vec<Record>, StoreError>;

    /// Merge `labels` into the record's labels; other labels are untouched.
    async fn patch_labels(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Record, StoreError>;

    async fn delete(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        propagation: Option<Propagation>,
    ) -> Result<(), StoreError>;
}
