//! Planning and run errors.

use stackrun_core::{Results, UnitId};
use std::time::Duration;
use thiserror::Error;

/// Errors detected before anything is executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("duplicate unit '{0}'")]
    DuplicateUnit(UnitId),

    #[error("unit '{unit}' depends on itself")]
    SelfDependency { unit: UnitId },

    #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: UnitId, dependency: UnitId },

    /// Each unit depends on the next; the first id is repeated at the end.
    #[error("cyclic dependency: {}", join_ids(.cycle, " -> "))]
    CyclicDependency { cycle: Vec<UnitId> },

    #[error(
        "unit '{unit}' needs output '{key}' of '{dependency}', which is not provisioned and has no mock output"
    )]
    MissingMockOutput {
        unit: UnitId,
        dependency: UnitId,
        key: String,
    },
}

/// Errors from an apply or destroy run.
///
/// Every variant except `Plan` carries the full per-unit results, so callers
/// can persist what was created before the run stopped.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("{} unit(s) failed: {}", .failed.len(), join_ids(.failed, ", "))]
    UnitsFailed {
        failed: Vec<UnitId>,
        results: Box<Results>,
    },

    #[error("run cancelled")]
    Cancelled { results: Box<Results> },

    #[error("run timed out after {timeout:?}")]
    TimedOut {
        timeout: Duration,
        results: Box<Results>,
    },
}

impl RunError {
    /// Per-unit results, unless the run failed during planning.
    pub fn results(&self) -> Option<&Results> {
        match self {
            RunError::Plan(_) => None,
            RunError::UnitsFailed { results, .. }
            | RunError::Cancelled { results }
            | RunError::TimedOut { results, .. } => Some(results),
        }
    }

    pub fn into_results(self) -> Option<Results> {
        match self {
            RunError::Plan(_) => None,
            RunError::UnitsFailed { results, .. }
            | RunError::Cancelled { results }
            | RunError::TimedOut { results, .. } => Some(*results),
        }
    }
}

fn join_ids(ids: &[UnitId], sep: &str) -> String {
    ids.iter()
        .map(UnitId::as_str)
        .collect::<Vec<_>>()
        .join(sep)
}
