use kln_core::{DeletionMarker, MarkerState, RecordRef, ResourceType};
use kln_store::{Propagation, ResourceStore, StoreError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Action, EngineError, MutationFailure, RecordFailure};

#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    pub marker: DeletionMarker,
    pub propagation: Option<Propagation>,
    /// List what would be deleted without deleting.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub resource_type: ResourceType,
    pub deleted: Vec<RecordRef>,
    /// Marked records that disappeared between the list and the delete.
    pub already_gone: Vec<RecordRef>,
    pub dry_run: bool,
}

impl SweepReport {
    fn empty(rt: &ResourceType, dry_run: bool) -> Self {
        Self { resource_type: rt.clone(), deleted: Vec::new(), already_gone: Vec::new(), dry_run }
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.already_gone.is_empty()
    }
}

/// Delete every record of `rt` whose marker label is exactly `"true"`.
///
/// The marked set comes from a label-selector list evaluated by the store.
/// Every marked record is attempted even after a failure; failures are
/// returned together as `EngineError::Mutation`, whose `completed` list
/// holds both deleted and already-gone records.
pub async fn sweep(store: &dyn ResourceStore, rt: &ResourceType, opts: &SweepOptions) -> Result<SweepReport, EngineError> {
    let (key, value) = opts.marker.selector();
    let marked = match store.list_labeled(rt, key, value).await {
        Ok(items) => items,
        Err(StoreError::NotFound(msg)) => {
            warn!(gvr = %rt, reason = %msg, "nothing to sweep");
            return Ok(SweepReport::empty(rt, opts.dry_run));
        }
        Err(e) => return Err(EngineError::transport(rt, e)),
    };
    if marked.is_empty() {
        info!(gvr = %rt, "nothing to delete");
        return Ok(SweepReport::empty(rt, opts.dry_run));
    }

    let mut report = SweepReport::empty(rt, opts.dry_run);
    let mut failures = Vec::new();
    // Deleted or already gone, in sweep order.
    let mut done = Vec::new();
    for record in &marked {
        let rf = record.reference();
        // The selector ran server-side; never delete a record not carrying the marker.
        if opts.marker.state_of(record) != MarkerState::Flagged {
            warn!(gvr = %rt, ns = ?rf.namespace, name = %rf.name, "selector returned an unmarked record; skipped");
            continue;
        }
        if opts.dry_run {
            info!(gvr = %rt, ns = ?rf.namespace, name = %rf.name, "would delete (dry-run)");
            report.deleted.push(rf);
            continue;
        }
        info!(gvr = %rt, ns = ?rf.namespace, name = %rf.name, "deleting");
        match store.delete(rt, record.namespace.as_deref(), &record.name, opts.propagation).await {
            Ok(()) => {
                counter!("kln_sweep_deleted", 1u64);
                done.push(rf.clone());
                report.deleted.push(rf);
            }
            Err(StoreError::NotFound(_)) => {
                debug!(gvr = %rt, ns = ?rf.namespace, name = %rf.name, "already gone");
                done.push(rf.clone());
                report.already_gone.push(rf);
            }
            Err(error) => {
                counter!("kln_sweep_failed", 1u64);
                warn!(gvr = %rt, ns = ?rf.namespace, name = %rf.name, error = %error, "delete failed; continuing");
                failures.push(RecordFailure { record: rf, error });
            }
        }
    }

    if !failures.is_empty() {
        return Err(EngineError::Mutation(MutationFailure {
            action: Action::Delete,
            completed: done,
            failures,
            not_attempted: Vec::new(),
        }));
    }
    Ok(report)
}
