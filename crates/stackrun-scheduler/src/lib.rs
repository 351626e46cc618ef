//! Dependency resolution and run orchestration for stackrun.
//!
//! Builds the dependency graph of a stack, schedules it into waves, resolves
//! inputs (against mock outputs in plan mode), and drives apply and destroy
//! runs through a [`ResourceProvisioner`](stackrun_core::ResourceProvisioner),
//! waiting for each provisioned unit to become ready.

pub mod error;
pub mod graph;
pub mod mock;
pub mod orchestrator;
pub mod plan;
pub mod poller;

pub use error::{PlanError, RunError};
pub use graph::{DependencyGraph, build_graph};
pub use mock::{ResolvedInputs, UnresolvedOutput, resolve_for_plan, resolve_inputs};
pub use orchestrator::{Orchestrator, PlanReport, PlannedAction, PlannedUnit, RunEvent};
pub use plan::{ExecutionPlan, Wave, schedule};
pub use poller::{PollError, PollReport, ReadinessCheck, wait_ready, wait_ready_with_cancel};
