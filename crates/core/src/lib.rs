//! kln core types: resource identity, records, criteria and the deletion marker.

#![forbid(unsafe_code)]

pub mod age;
pub mod matcher;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use age::{age_hours, older_than, validate_min_age};
pub use matcher::{matches, matches_section};

/// Label key used when the caller does not configure one.
pub const DEFAULT_MARKER_KEY: &str = "kln.com/delete";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CoreError {
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),
    #[error("invalid resource type key: {0} (expect version/resource or group/version/resource)")]
    InvalidResourceType(String),
    #[error("invalid marker key: {0}")]
    InvalidMarker(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// Group/Version/Resource triple identifying a collection in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceType {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceType {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// `group/version/resource`, or `version/resource` for the core group.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }

    /// `apiVersion` as it appears on objects of this type.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.version.is_empty() || self.resource.is_empty() {
            return Err(CoreError::InvalidResourceType(self.key()));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        let rt = match parts.as_slice() {
            [version, resource] => ResourceType::new("", *version, *resource),
            [group, version, resource] => ResourceType::new(*group, *version, *resource),
            _ => return Err(CoreError::InvalidResourceType(key.to_string())),
        };
        rt.validate().map_err(|_| CoreError::InvalidResourceType(key.to_string()))?;
        Ok(rt)
    }
}

/// Identity of a record, enough to act on it or report about it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub resource_type: ResourceType,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource_type, ns, self.name),
            None => write!(f, "{} {}", self.resource_type, self.name),
        }
    }
}

/// A live object as returned by the store, split into the sections the
/// filters are evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub resource_type: ResourceType,
    pub namespace: Option<String>,
    pub name: String,
    pub creation_time: Option<DateTime<Utc>>,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub metadata: Value,
    pub spec: Value,
    pub status: Value,
}

impl Record {
    /// Build a record from a raw object (`{"metadata": {...}, "spec": ..., "status": ...}`).
    ///
    /// Missing or null `spec`/`status` sections become empty maps.
    pub fn from_object(resource_type: ResourceType, raw: &Value) -> Result<Self, CoreError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| CoreError::MalformedRecord("object is not a map".into()))?;
        let metadata = obj
            .get("metadata")
            .filter(|m| m.is_object())
            .cloned()
            .ok_or_else(|| CoreError::MalformedRecord("missing metadata".into()))?;
        let name = metadata
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::MalformedRecord("missing metadata.name".into()))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let creation_time = match metadata.get("creationTimestamp") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| CoreError::MalformedRecord(format!("{}: creationTimestamp {:?}: {}", name, s, e)))?
                    .with_timezone(&Utc),
            ),
            Some(other) => {
                return Err(CoreError::MalformedRecord(format!("{}: creationTimestamp is not a string: {}", name, other)))
            }
        };
        let resource_version = metadata.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        let mut labels = BTreeMap::new();
        match metadata.get("labels") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    let v = v
                        .as_str()
                        .ok_or_else(|| CoreError::MalformedRecord(format!("{}: label {} is not a string", name, k)))?;
                    labels.insert(k.clone(), v.to_string());
                }
            }
            Some(_) => return Err(CoreError::MalformedRecord(format!("{}: metadata.labels is not a map", name))),
        }
        Ok(Self {
            resource_type,
            namespace,
            name,
            creation_time,
            resource_version,
            labels,
            metadata,
            spec: section(obj, "spec"),
            status: section(obj, "status"),
        })
    }

    pub fn reference(&self) -> RecordRef {
        RecordRef {
            resource_type: self.resource_type.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// `(namespace, name)`: unique within one resource type.
    pub fn identity(&self) -> (Option<&str>, &str) {
        (self.namespace.as_deref(), &self.name)
    }

    /// Merge `labels` into the record, keeping every other label. The
    /// `metadata.labels` section is kept in sync so filters see the change.
    pub fn merge_labels(&mut self, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            self.labels.insert(k.clone(), v.clone());
        }
        if let Some(meta) = self.metadata.as_object_mut() {
            let entry = meta.entry("labels").or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Some(map) = entry.as_object_mut() {
                for (k, v) in labels {
                    map.insert(k.clone(), Value::String(v.clone()));
                }
            }
        }
    }
}

fn section(obj: &Map<String, Value>, key: &str) -> Value {
    match obj.get(key) {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v.clone(),
    }
}

/// Declarative selection rule: an age threshold plus nested field filters
/// applied to the metadata, spec and status sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Criteria {
    #[serde(rename = "gvr")]
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Hours; zero disables the age check.
    #[serde(default)]
    pub min_age: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Criteria {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            api_version: None,
            kind: None,
            min_age: 0.0,
            metadata: None,
            spec: None,
            status: None,
            name: None,
            description: None,
        }
    }

    pub fn with_min_age(mut self, hours: f64) -> Self {
        self.min_age = hours;
        self
    }

    pub fn with_metadata(mut self, filter: Value) -> Self {
        self.metadata = Some(filter);
        self
    }

    pub fn with_spec(mut self, filter: Value) -> Self {
        self.spec = Some(filter);
        self
    }

    pub fn with_status(mut self, filter: Value) -> Self {
        self.status = Some(filter);
        self
    }

    /// Name for log lines: the configured name, else the resource type key.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.resource_type.key())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.resource_type
            .validate()
            .map_err(|e| CoreError::InvalidCriteria(e.to_string()))?;
        validate_min_age(self.min_age)?;
        for (section, filter) in [("metadata", &self.metadata), ("spec", &self.spec), ("status", &self.status)] {
            if let Some(f) = filter {
                if !f.is_object() {
                    return Err(CoreError::InvalidCriteria(format!("{} filter must be a map, got {}", section, f)));
                }
            }
        }
        Ok(())
    }
}

/// Observed value of the deletion marker on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerState {
    Flagged,
    Unflagged,
    Absent,
}

/// The reserved label whose `"true"`/`"false"` value flags a record for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMarker {
    key: String,
}

impl Default for DeletionMarker {
    fn default() -> Self {
        Self { key: DEFAULT_MARKER_KEY.to_string() }
    }
}

impl DeletionMarker {
    pub fn new(key: impl Into<String>) -> Result<Self, CoreError> {
        let key = key.into();
        if key.is_empty() || key.contains(['=', ',', '!', ' ']) {
            return Err(CoreError::InvalidMarker(key));
        }
        Ok(Self { key })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(flagged: bool) -> &'static str {
        if flagged { "true" } else { "false" }
    }

    /// Label map to merge into a record to reach the desired state.
    pub fn patch(&self, flagged: bool) -> BTreeMap<String, String> {
        BTreeMap::from([(self.key.clone(), Self::value(flagged).to_string())])
    }

    /// Exact-value label selector for flagged records: `key=true`.
    pub fn selector(&self) -> (&str, &'static str) {
        (&self.key, Self::value(true))
    }

    pub fn state_of(&self, record: &Record) -> MarkerState {
        match record.labels.get(&self.key).map(|s| s.as_str()) {
            Some("true") => MarkerState::Flagged,
            Some(_) => MarkerState::Unflagged,
            None => MarkerState::Absent,
        }
    }
}

pub mod prelude {
    pub use super::{
        Criteria, CoreError, DeletionMarker, MarkerState, Record, RecordRef, ResourceType, DEFAULT_MARKER_KEY,
    };
}
