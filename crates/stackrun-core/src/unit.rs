//! Unit model: one provisionable resource within a stack.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::readiness::PollSettings;
use crate::value::{OutputRef, Value, ValueMap};
use crate::UnitId;

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    #[default]
    Pending,
    Planning,
    Provisioning,
    Polling,
    Ready,
    Failed,
    Destroyed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Ready | UnitState::Failed | UnitState::Destroyed
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, UnitState::Ready)
    }

    /// Whether a resource may exist in the external system for a unit in
    /// this state.
    pub fn may_exist(&self) -> bool {
        matches!(
            self,
            UnitState::Provisioning | UnitState::Polling | UnitState::Ready | UnitState::Failed
        )
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Pending => write!(f, "pending"),
            UnitState::Planning => write!(f, "planning"),
            UnitState::Provisioning => write!(f, "provisioning"),
            UnitState::Polling => write!(f, "polling"),
            UnitState::Ready => write!(f, "ready"),
            UnitState::Failed => write!(f, "failed"),
            UnitState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A named provisionable entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    /// Resource type, used to pick readiness settings and provisioner commands.
    pub resource_type: String,
    /// Input parameters; may contain references to other units' outputs.
    #[serde(default)]
    pub inputs: ValueMap,
    /// Explicitly declared dependencies, honoured even without a reference.
    #[serde(default)]
    pub dependencies: BTreeSet<UnitId>,
    /// Outputs, populated once the unit is provisioned.
    #[serde(default)]
    pub outputs: ValueMap,
    /// Placeholder outputs for plan mode, keyed by dependency id.
    #[serde(default)]
    pub mock_outputs: BTreeMap<UnitId, ValueMap>,
    /// Per-unit override of the readiness polling settings.
    #[serde(default)]
    pub readiness: Option<PollSettings>,
    #[serde(default)]
    pub state: UnitState,
}

impl Unit {
    pub fn new(id: UnitId, resource_type: impl Into<String>) -> Self {
        Self {
            id,
            resource_type: resource_type.into(),
            inputs: ValueMap::new(),
            dependencies: BTreeSet::new(),
            outputs: ValueMap::new(),
            mock_outputs: BTreeMap::new(),
            readiness: None,
            state: UnitState::Pending,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn depends_on(mut self, dependency: UnitId) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn with_mock_output(
        mut self,
        dependency: UnitId,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.mock_outputs
            .entry(dependency)
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn with_readiness(mut self, settings: PollSettings) -> Self {
        self.readiness = Some(settings);
        self
    }

    /// Mark the unit as already provisioned with the given outputs.
    pub fn with_outputs(mut self, outputs: ValueMap) -> Self {
        self.outputs = outputs;
        self.state = UnitState::Ready;
        self
    }

    /// Every output reference found in the inputs.
    pub fn references(&self) -> BTreeSet<OutputRef> {
        let mut refs = BTreeSet::new();
        for value in self.inputs.values() {
            value.collect_refs(&mut refs);
        }
        refs
    }

    /// Dependencies inferred from input references.
    pub fn inferred_dependencies(&self) -> BTreeSet<UnitId> {
        self.references().into_iter().map(|r| r.unit).collect()
    }

    /// Explicit and inferred dependencies combined.
    pub fn all_dependencies(&self) -> BTreeSet<UnitId> {
        let mut deps = self.dependencies.clone();
        deps.extend(self.inferred_dependencies());
        deps
    }
}
