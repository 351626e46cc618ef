//! Wave scheduling.
//!
//! Units are grouped into waves with Kahn's algorithm: wave 0 holds every
//! unit without dependencies, wave N the units whose dependencies all sit in
//! earlier waves. Units within a wave have no ordering constraint between
//! them and are run concurrently. Destroy runs the apply waves backwards.

use serde::Serialize;
use stackrun_core::{Direction, UnitId};
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{DependencyGraph, find_cycle};
use crate::PlanError;

/// Units that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wave {
    pub index: usize,
    /// Ascending id order.
    pub units: Vec<UnitId>,
}

/// Ordered waves for one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub direction: Direction,
    pub waves: Vec<Wave>,
}

impl ExecutionPlan {
    /// Index of the wave containing `id`.
    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.waves
            .iter()
            .find(|w| w.units.iter().any(|u| u.as_str() == id))
            .map(|w| w.index)
    }

    /// Total number of scheduled units.
    pub fn unit_count(&self) -> usize {
        self.waves.iter().map(|w| w.units.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }
}

/// Schedule the graph into waves for the given direction.
pub fn schedule(graph: &DependencyGraph, direction: Direction) -> Result<ExecutionPlan, PlanError> {
    let waves = apply_waves(graph.adjacency())?;

    let waves = match direction {
        Direction::Apply => waves,
        Direction::Destroy => waves.into_iter().rev().collect(),
    };

    Ok(ExecutionPlan {
        direction,
        waves: waves
            .into_iter()
            .enumerate()
            .map(|(index, units)| Wave { index, units })
            .collect(),
    })
}

fn apply_waves(
    dependencies: &BTreeMap<UnitId, BTreeSet<UnitId>>,
) -> Result<Vec<Vec<UnitId>>, PlanError> {
    let mut remaining: BTreeMap<&UnitId, usize> = dependencies
        .iter()
        .map(|(id, deps)| (id, deps.len()))
        .collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        // BTreeMap iteration keeps each wave sorted by id
        let wave: Vec<UnitId> = remaining
            .iter()
            .filter(|(_, pending)| **pending == 0)
            .map(|(id, _)| (*id).clone())
            .collect();

        if wave.is_empty() {
            let stuck: BTreeMap<UnitId, BTreeSet<UnitId>> = remaining
                .keys()
                .map(|id| ((*id).clone(), dependencies[*id].clone()))
                .collect();
            let cycle = find_cycle(&stuck)
                .unwrap_or_else(|| stuck.keys().cloned().collect());
            return Err(PlanError::CyclicDependency { cycle });
        }

        for id in &wave {
            remaining.remove(id);
        }
        for (id, pending) in remaining.iter_mut() {
            let done = dependencies[*id]
                .iter()
                .filter(|dep| wave.contains(*dep))
                .count();
            *pending -= done;
        }

        waves.push(wave);
    }

    Ok(waves)
}
