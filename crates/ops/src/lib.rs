//! kln engine: turns criteria into matches, matches into deletion-marker
//! labels, and marked records into deletes.
//!
//! Every operation is a sequence of store round-trips made in order; nothing
//! is cached or retried between calls.

#![forbid(unsafe_code)]

mod flag;
mod select;
mod sweep;

use std::fmt;

use kln_core::{RecordRef, ResourceType};
use kln_store::StoreError;
use serde::{Deserialize, Serialize};

pub use flag::{flag_matching, set_deletion_marker, FailurePolicy, FlagOptions, FlagOutcome, FlagReport};
pub use select::{admits, select, select_at, MatchSet};
pub use sweep::{sweep, SweepOptions, SweepReport};

/// Mutation performed on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Flag,
    Unflag,
    Delete,
}

impl Action {
    pub fn for_marker(desired: bool) -> Self {
        if desired { Action::Flag } else { Action::Unflag }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Flag => "flag",
            Action::Unflag => "unflag",
            Action::Delete => "delete",
        })
    }
}

#[derive(Debug)]
pub struct RecordFailure {
    pub record: RecordRef,
    pub error: StoreError,
}

/// Outcome of a mutation pass that did not fully succeed.
#[derive(Debug)]
pub struct MutationFailure {
    pub action: Action,
    /// Records mutated before (or despite) the failures.
    pub completed: Vec<RecordRef>,
    pub failures: Vec<RecordFailure>,
    /// Records left untouched because the pass stopped at the first failure.
    pub not_attempted: Vec<RecordRef>,
}

impl fmt::Display for MutationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} failed, {} done, {} not attempted",
            self.action,
            self.failures.len(),
            self.completed.len(),
            self.not_attempted.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.record, failure.error)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),
    #[error("store request for {resource_type} failed: {source}")]
    Transport {
        resource_type: ResourceType,
        #[source]
        source: StoreError,
    },
    #[error("{0}")]
    Mutation(MutationFailure),
}

impl EngineError {
    fn transport(rt: &ResourceType, source: StoreError) -> Self {
        Self::Transport { resource_type: rt.clone(), source }
    }
}
