use std::time::Instant;

use chrono::{DateTime, Utc};
use kln_core::{matches_section, older_than, CoreError, Criteria, Record};
use kln_store::{ResourceStore, StoreError};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::EngineError;

/// Records satisfying a criteria, in store order.
pub type MatchSet = Vec<Record>;

/// Age check first, then the metadata, spec and status filters. All must hold.
pub fn admits(criteria: &Criteria, record: &Record, now: DateTime<Utc>) -> Result<bool, CoreError> {
    if !older_than(record.creation_time, criteria.min_age, now)? {
        return Ok(false);
    }
    Ok(matches_section(criteria.metadata.as_ref(), &record.metadata)
        && matches_section(criteria.spec.as_ref(), &record.spec)
        && matches_section(criteria.status.as_ref(), &record.status))
}

pub async fn select(store: &dyn ResourceStore, criteria: &Criteria) -> Result<MatchSet, EngineError> {
    select_at(store, criteria, Utc::now()).await
}

/// Fetch every record of the criteria's resource type and keep the ones it
/// admits at `now`. Invalid criteria are rejected before the store is called.
pub async fn select_at(store: &dyn ResourceStore, criteria: &Criteria, now: DateTime<Utc>) -> Result<MatchSet, EngineError> {
    criteria.validate().map_err(|e| EngineError::InvalidCriteria(e.to_string()))?;
    let rt = &criteria.resource_type;
    let t0 = Instant::now();

    let candidates = match store.list(rt).await {
        Ok(items) => items,
        Err(StoreError::NotFound(msg)) => {
            warn!(gvr = %rt, reason = %msg, "nothing to select from");
            return Ok(Vec::new());
        }
        Err(e) => return Err(EngineError::transport(rt, e)),
    };
    let total = candidates.len();
    counter!("kln_select_candidates", total as u64);

    let mut seen: FxHashSet<(Option<String>, String)> = FxHashSet::default();
    let mut out = Vec::new();
    for record in candidates {
        let keep = admits(criteria, &record, now).map_err(|e| EngineError::InvalidCriteria(e.to_string()))?;
        if !keep {
            continue;
        }
        if !seen.insert((record.namespace.clone(), record.name.clone())) {
            debug!(gvr = %rt, ns = ?record.namespace, name = %record.name, "duplicate candidate skipped");
            continue;
        }
        out.push(record);
    }

    counter!("kln_select_matched", out.len() as u64);
    histogram!("kln_select_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(gvr = %rt, criteria = %criteria.label(), candidates = total, matched = out.len(), "selection done");
    Ok(out)
}
