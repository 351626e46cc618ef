//! Per-unit outcome of a run.
//!
//! Partial success is a first-class outcome: every unit of the stack appears
//! in [`Results`] with its final state, so callers can tell exactly which
//! resources exist after a failed apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::run::Direction;
use crate::unit::UnitState;
use crate::value::ValueMap;
use crate::{RunId, UnitId};

/// Why a unit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provisioner's create call returned an error.
    Provisioning,
    /// Inputs could not be resolved against dependency outputs.
    Resolution,
    /// The resource was created but never reported ready within the budget.
    ReadinessTimeout,
    /// The resource entered a failed or deleted state while polling.
    TerminalFailure,
    /// The run was cancelled while the unit was in flight.
    Cancelled,
    /// The provisioner's destroy call returned an error.
    Destroy,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Provisioning => write!(f, "provisioning"),
            FailureKind::Resolution => write!(f, "resolution"),
            FailureKind::ReadinessTimeout => write!(f, "readiness_timeout"),
            FailureKind::TerminalFailure => write!(f, "terminal_failure"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Destroy => write!(f, "destroy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub message: String,
    /// Last status reported by the readiness probe, if polling happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
}

impl ErrorDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            last_status: None,
        }
    }

    pub fn with_last_status(mut self, status: impl Into<String>) -> Self {
        self.last_status = Some(status.into());
        self
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(status) = &self.last_status {
            write!(f, " (last status: {})", status)?;
        }
        Ok(())
    }
}

/// Final state of one unit after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub resource_type: String,
    pub state: UnitState,
    /// Outputs reported by the provisioner. Kept on readiness failures too,
    /// since the resource exists and must stay tracked.
    #[serde(default)]
    pub outputs: ValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Why the unit was not attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    /// The unit was already in its target state and no external call was made.
    #[serde(default)]
    pub reused: bool,
    #[serde(default)]
    pub poll_attempts: u32,
}

impl UnitResult {
    pub fn new(resource_type: impl Into<String>, state: UnitState) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
            outputs: ValueMap::new(),
            error: None,
            skipped: None,
            reused: false,
            poll_attempts: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == UnitState::Failed
    }
}

/// Outcome of one apply or destroy run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Results {
    pub run_id: RunId,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub units: BTreeMap<UnitId, UnitResult>,
}

impl Results {
    pub fn new(direction: Direction) -> Self {
        Self {
            run_id: RunId::new(),
            direction,
            started_at: Utc::now(),
            finished_at: None,
            units: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&UnitResult> {
        self.units.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<UnitState> {
        self.units.get(id).map(|r| r.state)
    }

    pub fn failed(&self) -> Vec<UnitId> {
        self.units
            .iter()
            .filter(|(_, r)| r.is_failed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every unit reached the run's target state.
    pub fn success(&self) -> bool {
        let target = match self.direction {
            Direction::Apply => UnitState::Ready,
            Direction::Destroy => UnitState::Destroyed,
        };
        self.units.values().all(|r| r.state == target)
    }

    pub fn count(&self, state: UnitState) -> usize {
        self.units.values().filter(|r| r.state == state).count()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
