//! Run direction and options.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Which way a run walks the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Dependencies before dependents.
    Apply,
    /// Dependents before dependencies.
    Destroy,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Apply => write!(f, "apply"),
            Direction::Destroy => write!(f, "destroy"),
        }
    }
}

/// Options for an apply or destroy run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Maximum number of units in flight at once; unlimited when `None`.
    pub concurrency_limit: Option<NonZeroUsize>,
    /// Stop starting new waves once a unit has failed. When false, later
    /// waves still run but units whose dependencies failed are skipped.
    pub fail_fast: bool,
    /// Wall-clock budget for the whole run.
    pub timeout: Option<Duration>,
    /// On cancellation, also abort in-flight provisioning (if the
    /// provisioner supports it) and readiness polling.
    pub abort_in_flight: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            fail_fast: true,
            timeout: None,
            abort_in_flight: false,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency_limit(mut self, limit: NonZeroUsize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.fail_fast = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_abort_in_flight(mut self, abort: bool) -> Self {
        self.abort_in_flight = abort;
        self
    }
}
