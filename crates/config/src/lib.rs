//! kln config: criteria documents (`items:` list of selection rules) loaded
//! from YAML and validated before anything talks to a cluster.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kln_core::{Criteria, ResourceType};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn max_yaml_bytes() -> usize {
    std::env::var("KLN_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CriteriaDocument {
    #[serde(default)]
    pub items: Vec<Criteria>,
}

impl CriteriaDocument {
    /// Distinct resource types named by the document, in first-seen order.
    pub fn resource_types(&self) -> Vec<ResourceType> {
        let mut out: Vec<ResourceType> = Vec::new();
        for c in &self.items {
            if !out.contains(&c.resource_type) {
                out.push(c.resource_type.clone());
            }
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        for (idx, c) in self.items.iter().enumerate() {
            c.validate().with_context(|| format!("criteria item #{} ({})", idx + 1, c.label()))?;
        }
        Ok(())
    }
}

/// Parse and validate a criteria document.
pub fn parse_document(yaml: &str) -> Result<CriteriaDocument> {
    let max = max_yaml_bytes();
    if yaml.len() > max {
        return Err(anyhow!("criteria document too large: {} bytes (max {})", yaml.len(), max));
    }
    if yaml.trim().is_empty() {
        return Ok(CriteriaDocument::default());
    }
    let doc: CriteriaDocument = serde_yaml::from_str(yaml).context("parsing criteria document")?;
    doc.validate()?;
    debug!(items = doc.items.len(), "criteria document parsed");
    Ok(doc)
}

pub fn load_document(path: &Path) -> Result<CriteriaDocument> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_document(&text).with_context(|| format!("loading {}", path.display()))
}
