//! Run orchestrator - provisions and destroys units wave by wave.

use futures::future::join_all;
use stackrun_core::{
    AlwaysReady, Direction, ErrorDetail, FailureKind, OutputRef, ReadinessPolicy, ReadinessProbe,
    ResourceProvisioner, Results, RunId, RunOptions, Unit, UnitId, UnitResult, UnitState,
    ValueMap,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::graph::DependencyGraph;
use crate::mock::{ResolvedInputs, resolve_for_plan, resolve_inputs};
use crate::plan::{ExecutionPlan, schedule};
use crate::poller::{PollError, ReadinessCheck, wait_ready_with_cancel};
use crate::{PlanError, RunError};

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        direction: Direction,
        waves: usize,
    },
    WaveStarted {
        index: usize,
        units: Vec<UnitId>,
    },
    UnitStarted {
        unit: UnitId,
        direction: Direction,
    },
    UnitPolling {
        unit: UnitId,
    },
    UnitCompleted {
        unit: UnitId,
        state: UnitState,
        reused: bool,
        error: Option<ErrorDetail>,
    },
    UnitSkipped {
        unit: UnitId,
        reason: String,
    },
    WaveCompleted {
        index: usize,
        failed: usize,
    },
    RunCompleted {
        success: bool,
    },
}

/// What an apply would do to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    Create,
    /// Already provisioned; outputs are reused.
    Reuse,
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannedAction::Create => write!(f, "create"),
            PlannedAction::Reuse => write!(f, "reuse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUnit {
    pub resource_type: String,
    pub action: PlannedAction,
    /// Inputs with references resolved against real or mock outputs.
    pub inputs: ValueMap,
    pub mocked: BTreeSet<OutputRef>,
}

/// Result of a dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReport {
    pub plan: ExecutionPlan,
    pub units: BTreeMap<UnitId, PlannedUnit>,
}

impl PlanReport {
    pub fn count(&self, action: PlannedAction) -> usize {
        self.units.values().filter(|u| u.action == action).count()
    }
}

/// Orchestrates apply, destroy and plan runs over a stack of units.
pub struct Orchestrator {
    provisioner: Arc<dyn ResourceProvisioner>,
    probe: Arc<dyn ReadinessProbe>,
    readiness: ReadinessPolicy,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        Self {
            provisioner,
            probe: Arc::new(AlwaysReady),
            readiness: ReadinessPolicy::default(),
            events: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = policy;
        self
    }

    /// Send run events to `tx`. The receiver must be drained while the run
    /// is in progress.
    pub fn with_events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Compute the apply plan without calling the provisioner.
    ///
    /// Units that are not provisioned yet get their inputs resolved against
    /// mock outputs.
    pub fn plan(&self, units: Vec<Unit>) -> Result<PlanReport, PlanError> {
        let graph = DependencyGraph::build(units)?;
        let plan = schedule(&graph, Direction::Apply)?;

        let mut planned = BTreeMap::new();
        for wave in &plan.waves {
            for id in &wave.units {
                let Some(unit) = graph.unit(id.as_str()) else {
                    continue;
                };

                let (action, resolved) = if unit.state.is_ready() {
                    // Inputs are informational for reused units
                    let resolved = resolve_for_plan(unit, &graph).unwrap_or_else(|_| {
                        ResolvedInputs {
                            inputs: unit.inputs.clone(),
                            mocked: BTreeSet::new(),
                        }
                    });
                    (PlannedAction::Reuse, resolved)
                } else {
                    (PlannedAction::Create, resolve_for_plan(unit, &graph)?)
                };

                debug!(unit = %id, wave = wave.index, %action, mocked = resolved.mocked.len(), "Planned unit");
                planned.insert(
                    id.clone(),
                    PlannedUnit {
                        resource_type: unit.resource_type.clone(),
                        action,
                        inputs: resolved.inputs,
                        mocked: resolved.mocked,
                    },
                );
            }
        }

        Ok(PlanReport {
            plan,
            units: planned,
        })
    }

    /// Provision every unit, dependencies first.
    pub async fn apply(
        &self,
        units: Vec<Unit>,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Results, RunError> {
        let graph = DependencyGraph::build(units)?;
        let plan = schedule(&graph, Direction::Apply)?;
        self.apply_plan(&graph, &plan, options, cancel).await
    }

    /// Destroy every unit, dependents first.
    pub async fn destroy(
        &self,
        units: Vec<Unit>,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Results, RunError> {
        let graph = DependencyGraph::build(units)?;
        let plan = schedule(&graph, Direction::Destroy)?;
        self.apply_plan(&graph, &plan, options, cancel).await
    }

    /// Walk the waves of `plan` in order.
    ///
    /// All units of a wave run concurrently and the wave finishes when each
    /// of them has reached a terminal state. Units of the graph never reached
    /// keep their current state in the results.
    pub async fn apply_plan(
        &self,
        graph: &DependencyGraph,
        plan: &ExecutionPlan,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Results, RunError> {
        let direction = plan.direction;
        let mut results = Results::new(direction);
        for unit in graph.units() {
            let mut result = UnitResult::new(&unit.resource_type, unit.state);
            result.outputs = unit.outputs.clone();
            results.units.insert(unit.id.clone(), result);
        }

        let mut outputs: BTreeMap<UnitId, ValueMap> = graph
            .units()
            .filter(|u| u.state.is_ready())
            .map(|u| (u.id.clone(), u.outputs.clone()))
            .collect();

        let run_token = cancel.child_token();
        let timer = options.timeout.map(|timeout| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });
        let limit = options
            .concurrency_limit
            .map(|n| Semaphore::new(n.get()));

        info!(
            run_id = %results.run_id,
            %direction,
            units = graph.len(),
            waves = plan.waves.len(),
            "Starting run"
        );
        self.emit(RunEvent::RunStarted {
            run_id: results.run_id,
            direction,
            waves: plan.waves.len(),
        })
        .await;

        let mut failed: Vec<UnitId> = Vec::new();

        for wave in &plan.waves {
            if run_token.is_cancelled() {
                warn!(wave = wave.index, "Run cancelled, not starting wave");
                break;
            }
            if options.fail_fast && !failed.is_empty() {
                info!(wave = wave.index, "Stopping after failure");
                break;
            }

            info!(wave = wave.index, units = wave.units.len(), "Starting wave");
            self.emit(RunEvent::WaveStarted {
                index: wave.index,
                units: wave.units.clone(),
            })
            .await;

            let mut tasks = Vec::new();
            for id in &wave.units {
                let Some(unit) = graph.unit(id.as_str()) else {
                    continue;
                };

                if let Some(reason) = blocked_reason(graph, direction, id, &results) {
                    info!(unit = %id, %reason, "Skipping unit");
                    if let Some(result) = results.units.get_mut(id) {
                        result.skipped = Some(reason.clone());
                    }
                    self.emit(RunEvent::UnitSkipped {
                        unit: id.clone(),
                        reason,
                    })
                    .await;
                    continue;
                }

                tasks.push(self.run_unit(
                    direction,
                    unit,
                    &outputs,
                    limit.as_ref(),
                    options,
                    &run_token,
                ));
            }

            let outcomes = join_all(tasks).await;

            let mut wave_failed = 0;
            for (id, result) in outcomes {
                if result.is_failed() {
                    wave_failed += 1;
                    failed.push(id.clone());
                }
                if result.state == UnitState::Ready {
                    outputs.insert(id.clone(), result.outputs.clone());
                }
                results.units.insert(id, result);
            }

            self.emit(RunEvent::WaveCompleted {
                index: wave.index,
                failed: wave_failed,
            })
            .await;
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        results.finish();

        let success = failed.is_empty() && !run_token.is_cancelled();
        info!(
            run_id = %results.run_id,
            success,
            failed = failed.len(),
            "Run finished"
        );
        self.emit(RunEvent::RunCompleted { success }).await;

        if cancel.is_cancelled() {
            Err(RunError::Cancelled {
                results: Box::new(results),
            })
        } else if run_token.is_cancelled() {
            Err(RunError::TimedOut {
                timeout: options.timeout.unwrap_or_default(),
                results: Box::new(results),
            })
        } else if !failed.is_empty() {
            Err(RunError::UnitsFailed {
                failed,
                results: Box::new(results),
            })
        } else {
            Ok(results)
        }
    }

    async fn run_unit(
        &self,
        direction: Direction,
        unit: &Unit,
        outputs: &BTreeMap<UnitId, ValueMap>,
        limit: Option<&Semaphore>,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> (UnitId, UnitResult) {
        let mut result = UnitResult::new(&unit.resource_type, unit.state);
        result.outputs = unit.outputs.clone();

        let nothing_to_do = match direction {
            Direction::Apply => unit.state.is_ready(),
            Direction::Destroy => matches!(unit.state, UnitState::Pending | UnitState::Destroyed),
        };
        if nothing_to_do {
            debug!(unit = %unit.id, state = %unit.state, "Unit already in target state");
            if direction == Direction::Destroy {
                result.state = UnitState::Destroyed;
                result.outputs.clear();
            }
            result.reused = true;
            self.emit_completed(&unit.id, &result).await;
            return (unit.id.clone(), result);
        }

        let Some(_permit) = acquire(limit, cancel).await else {
            let reason = "run cancelled before dispatch".to_string();
            result.skipped = Some(reason.clone());
            self.emit(RunEvent::UnitSkipped {
                unit: unit.id.clone(),
                reason,
            })
            .await;
            return (unit.id.clone(), result);
        };

        self.emit(RunEvent::UnitStarted {
            unit: unit.id.clone(),
            direction,
        })
        .await;

        match direction {
            Direction::Apply => self.provision_unit(unit, outputs, options, cancel, &mut result).await,
            Direction::Destroy => self.destroy_unit(unit, options, cancel, &mut result).await,
        }

        self.emit_completed(&unit.id, &result).await;
        (unit.id.clone(), result)
    }

    async fn provision_unit(
        &self,
        unit: &Unit,
        outputs: &BTreeMap<UnitId, ValueMap>,
        options: &RunOptions,
        cancel: &CancellationToken,
        result: &mut UnitResult,
    ) {
        let inputs = match resolve_inputs(unit, outputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                error!(unit = %unit.id, error = %e, "Failed to resolve inputs");
                result.state = UnitState::Failed;
                result.error = Some(ErrorDetail::new(FailureKind::Resolution, e.to_string()));
                return;
            }
        };

        info!(unit = %unit.id, resource_type = %unit.resource_type, "Provisioning unit");
        result.state = UnitState::Provisioning;

        let provisioned = if options.abort_in_flight && self.provisioner.supports_cancellation() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(unit = %unit.id, "Provisioning aborted");
                    result.state = UnitState::Failed;
                    result.error = Some(ErrorDetail::new(
                        FailureKind::Cancelled,
                        "provisioning aborted by cancellation",
                    ));
                    return;
                }
                r = self.provisioner.provision(&unit.resource_type, &inputs) => r,
            }
        } else {
            self.provisioner.provision(&unit.resource_type, &inputs).await
        };

        let provisioned = match provisioned {
            Ok(outputs) => outputs,
            Err(e) => {
                error!(unit = %unit.id, error = %e, "Provisioning failed");
                result.state = UnitState::Failed;
                result.error = Some(ErrorDetail::new(FailureKind::Provisioning, e.to_string()));
                return;
            }
        };

        result.outputs = provisioned.clone();
        result.state = UnitState::Polling;
        self.emit(RunEvent::UnitPolling {
            unit: unit.id.clone(),
        })
        .await;

        let check = ReadinessCheck {
            unit: unit.id.clone(),
            resource_type: unit.resource_type.clone(),
            outputs: provisioned,
            settings: unit
                .readiness
                .unwrap_or_else(|| self.readiness.settings_for(&unit.resource_type)),
            probe: self.probe.clone(),
        };

        // Polling only stops early on cancellation when asked to
        let detached = CancellationToken::new();
        let poll_cancel = if options.abort_in_flight { cancel } else { &detached };

        match wait_ready_with_cancel(&check, poll_cancel).await {
            Ok(report) => {
                result.state = UnitState::Ready;
                result.poll_attempts = report.attempts;
            }
            Err(e) => {
                let kind = match &e {
                    PollError::Timeout { .. } => FailureKind::ReadinessTimeout,
                    PollError::TerminalFailure { .. } => FailureKind::TerminalFailure,
                    PollError::Cancelled { .. } => FailureKind::Cancelled,
                };
                error!(unit = %unit.id, error = %e, "Unit did not become ready");
                let mut detail = ErrorDetail::new(kind, e.to_string());
                if let Some(status) = e.last_status() {
                    detail = detail.with_last_status(status);
                }
                result.state = UnitState::Failed;
                result.poll_attempts = e.attempts();
                result.error = Some(detail);
            }
        }
    }

    async fn destroy_unit(
        &self,
        unit: &Unit,
        options: &RunOptions,
        cancel: &CancellationToken,
        result: &mut UnitResult,
    ) {
        info!(unit = %unit.id, resource_type = %unit.resource_type, "Destroying unit");

        let destroyed = if options.abort_in_flight && self.provisioner.supports_cancellation() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(unit = %unit.id, "Destroy aborted");
                    result.state = UnitState::Failed;
                    result.error = Some(ErrorDetail::new(
                        FailureKind::Cancelled,
                        "destroy aborted by cancellation",
                    ));
                    return;
                }
                r = self.provisioner.destroy(&unit.resource_type, &unit.outputs) => r,
            }
        } else {
            self.provisioner.destroy(&unit.resource_type, &unit.outputs).await
        };

        match destroyed {
            Ok(()) => {
                result.state = UnitState::Destroyed;
                result.outputs.clear();
            }
            Err(e) => {
                error!(unit = %unit.id, error = %e, "Destroy failed");
                result.state = UnitState::Failed;
                result.error = Some(ErrorDetail::new(FailureKind::Destroy, e.to_string()));
            }
        }
    }

    async fn emit_completed(&self, id: &UnitId, result: &UnitResult) {
        self.emit(RunEvent::UnitCompleted {
            unit: id.clone(),
            state: result.state,
            reused: result.reused,
            error: result.error.clone(),
        })
        .await;
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// Wait for a concurrency permit, unless the run is cancelled first.
///
/// Returns `Some(None)` when no limit is configured.
async fn acquire<'a>(
    limit: Option<&'a Semaphore>,
    cancel: &CancellationToken,
) -> Option<Option<SemaphorePermit<'a>>> {
    if cancel.is_cancelled() {
        return None;
    }
    let Some(semaphore) = limit else {
        return Some(None);
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = semaphore.acquire() => permit.ok().map(Some),
    }
}

/// Why a unit must not run in best-effort mode: on apply a dependency is not
/// ready, on destroy a dependent still exists.
fn blocked_reason(
    graph: &DependencyGraph,
    direction: Direction,
    id: &UnitId,
    results: &Results,
) -> Option<String> {
    match direction {
        Direction::Apply => graph.dependencies_of(id.as_str()).find_map(|dep| {
            let state = results.state_of(dep.as_str())?;
            (state != UnitState::Ready)
                .then(|| format!("dependency '{}' is {}", dep, state))
        }),
        Direction::Destroy => graph.dependents_of(id.as_str()).find_map(|dependent| {
            let state = results.state_of(dependent.as_str())?;
            (state != UnitState::Destroyed)
                .then(|| format!("dependent '{}' is {}", dependent, state))
        }),
    }
}
