use kln_core::{Criteria, DeletionMarker, Record, RecordRef};
use kln_store::ResourceStore;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{select, Action, EngineError, MutationFailure, RecordFailure};

/// What to do when patching one record fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failure; later records are reported as not attempted.
    #[default]
    Abort,
    /// Patch every record, then report all failures together.
    Continue,
}

#[derive(Debug, Clone, Default)]
pub struct FlagOptions {
    pub marker: DeletionMarker,
    pub policy: FailurePolicy,
    /// Report what would be patched without touching the store.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagReport {
    pub action: Action,
    pub patched: Vec<RecordRef>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlagOutcome {
    /// The match set was empty; nothing was sent to the store.
    NothingMatched,
    Applied(FlagReport),
}

/// Set the deletion marker to `desired` on every record, in order, with one
/// merge patch each. Labels other than the marker are left alone, so running
/// this twice is the same as running it once.
///
/// Partial failure follows `opts.policy`; either way a failure comes back as
/// `EngineError::Mutation` listing what was done and what failed.
pub async fn set_deletion_marker(
    store: &dyn ResourceStore,
    matches: &[Record],
    desired: bool,
    opts: &FlagOptions,
) -> Result<FlagOutcome, EngineError> {
    let action = Action::for_marker(desired);
    if matches.is_empty() {
        info!(action = %action, "nothing matched");
        return Ok(FlagOutcome::NothingMatched);
    }

    let patch = opts.marker.patch(desired);
    let value = DeletionMarker::value(desired);
    let mut patched = Vec::with_capacity(matches.len());
    let mut failures = Vec::new();

    for (idx, record) in matches.iter().enumerate() {
        let rf = record.reference();
        if opts.dry_run {
            info!(gvr = %rf.resource_type, ns = ?rf.namespace, name = %rf.name, label = %opts.marker.key(), value, "would label (dry-run)");
            patched.push(rf);
            continue;
        }
        match store.patch_labels(&record.resource_type, record.namespace.as_deref(), &record.name, &patch).await {
            Ok(_) => {
                counter!("kln_flag_patched", 1u64);
                info!(gvr = %rf.resource_type, ns = ?rf.namespace, name = %rf.name, label = %opts.marker.key(), value, "labelled");
                patched.push(rf);
            }
            Err(error) => {
                counter!("kln_flag_failed", 1u64);
                warn!(gvr = %rf.resource_type, ns = ?rf.namespace, name = %rf.name, error = %error, "label patch failed");
                failures.push(RecordFailure { record: rf, error });
                if opts.policy == FailurePolicy::Abort {
                    return Err(EngineError::Mutation(MutationFailure {
                        action,
                        completed: patched,
                        failures,
                        not_attempted: matches[idx + 1..].iter().map(Record::reference).collect(),
                    }));
                }
            }
        }
    }

    if !failures.is_empty() {
        return Err(EngineError::Mutation(MutationFailure { action, completed: patched, failures, not_attempted: Vec::new() }));
    }
    Ok(FlagOutcome::Applied(FlagReport { action, patched, dry_run: opts.dry_run }))
}

/// Select with `criteria`, then set the marker on the matches.
pub async fn flag_matching(
    store: &dyn ResourceStore,
    criteria: &Criteria,
    desired: bool,
    opts: &FlagOptions,
) -> Result<FlagOutcome, EngineError> {
    let matches = select(store, criteria).await?;
    set_deletion_marker(store, &matches, desired, opts).await
}
