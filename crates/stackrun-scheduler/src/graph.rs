//! Dependency graph over units.

use stackrun_core::{Unit, UnitId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

use crate::PlanError;

type Adjacency = BTreeMap<UnitId, BTreeSet<UnitId>>;

/// Immutable, acyclic graph of units and their dependencies.
///
/// Dependencies are the union of a unit's declared `dependencies` and every
/// unit referenced from its inputs.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    units: BTreeMap<UnitId, Unit>,
    dependencies: Adjacency,
    dependents: Adjacency,
}

/// Build a dependency graph from a set of units.
pub fn build_graph(units: Vec<Unit>) -> Result<DependencyGraph, PlanError> {
    DependencyGraph::build(units)
}

impl DependencyGraph {
    pub fn build(units: Vec<Unit>) -> Result<Self, PlanError> {
        let mut by_id = BTreeMap::new();
        for unit in units {
            if by_id.contains_key(&unit.id) {
                return Err(PlanError::DuplicateUnit(unit.id));
            }
            by_id.insert(unit.id.clone(), unit);
        }

        let mut dependencies = Adjacency::new();
        let mut dependents: Adjacency = by_id
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for (id, unit) in &by_id {
            let deps = unit.all_dependencies();
            for dep in &deps {
                if dep == id {
                    return Err(PlanError::SelfDependency { unit: id.clone() });
                }
                let Some(reverse) = dependents.get_mut(dep) else {
                    return Err(PlanError::UnknownDependency {
                        unit: id.clone(),
                        dependency: dep.clone(),
                    });
                };
                reverse.insert(id.clone());
            }
            dependencies.insert(id.clone(), deps);
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(PlanError::CyclicDependency { cycle });
        }

        debug!(units = by_id.len(), "Built dependency graph");

        Ok(Self {
            units: by_id,
            dependencies,
            dependents,
        })
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.get(id)
    }

    /// Units in ascending id order.
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &UnitId> {
        self.units.keys()
    }

    /// Units that `id` depends on.
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &UnitId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    /// Units that depend on `id`.
    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &UnitId> {
        self.dependents.get(id).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub(crate) fn adjacency(&self) -> &BTreeMap<UnitId, BTreeSet<UnitId>> {
        &self.dependencies
    }
}

/// Find a cycle, returned as a path where each unit depends on the next and
/// the first unit is repeated at the end.
pub(crate) fn find_cycle(dependencies: &Adjacency) -> Option<Vec<UnitId>> {
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    for id in dependencies.keys() {
        if !visited.contains(id) {
            if let Some(cycle) = dfs_find_cycle(id, dependencies, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_find_cycle<'a>(
    node: &'a UnitId,
    dependencies: &'a Adjacency,
    visited: &mut HashSet<&'a UnitId>,
    path: &mut Vec<&'a UnitId>,
) -> Option<Vec<UnitId>> {
    visited.insert(node);
    path.push(node);

    for dep in dependencies.get(node).into_iter().flatten() {
        if let Some(start) = path.iter().position(|n| *n == dep) {
            let mut cycle: Vec<UnitId> = path[start..].iter().map(|n| (*n).clone()).collect();
            cycle.push(dep.clone());
            return Some(cycle);
        }
        if !visited.contains(dep) {
            if let Some(cycle) = dfs_find_cycle(dep, dependencies, visited, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn unit(id: &str, deps: &[&str]) -> Unit {
        deps.iter()
            .fold(Unit::new(uid(id), "null"), |u, d| u.depends_on(uid(d)))
    }

    #[test]
    fn test_build_graph_adjacency() {
        let graph = build_graph(vec![
            unit("service", &["db", "cache"]),
            unit("db", &[]),
            unit("cache", &[]),
        ])
        .unwrap();

        assert_eq!(graph.len(), 3);
        let deps: Vec<_> = graph.dependencies_of("service").cloned().collect();
        assert_eq!(deps, vec![uid("cache"), uid("db")]);
        let dependents: Vec<_> = graph.dependents_of("db").cloned().collect();
        assert_eq!(dependents, vec![uid("service")]);
        assert_eq!(graph.dependencies_of("db").count(), 0);
    }

    #[test]
    fn test_inferred_dependencies() {
        let service = Unit::new(uid("service"), "ecs_service")
            .with_input("db_host", stackrun_core::Value::from_template("${unit.db.outputs.host}"));
        let graph = build_graph(vec![service, unit("db", &[])]).unwrap();

        let deps: Vec<_> = graph.dependencies_of("service").cloned().collect();
        assert_eq!(deps, vec![uid("db")]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = build_graph(vec![unit("service", &["db"])]).unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownDependency {
                unit: uid("service"),
                dependency: uid("db"),
            }
        );
    }

    #[test]
    fn test_unknown_reference() {
        let service = Unit::new(uid("service"), "ecs_service")
            .with_input("url", stackrun_core::Value::from_template("http://${unit.lb.outputs.dns}"));
        let err = build_graph(vec![service]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn test_duplicate_unit() {
        let err = build_graph(vec![unit("db", &[]), unit("db", &[])]).unwrap_err();
        assert_eq!(err, PlanError::DuplicateUnit(uid("db")));
    }

    #[test]
    fn test_self_dependency() {
        let err = build_graph(vec![unit("db", &["db"])]).unwrap_err();
        assert_eq!(err, PlanError::SelfDependency { unit: uid("db") });
    }

    #[test]
    fn test_cycle_detected() {
        let err = build_graph(vec![
            unit("a", &["b"]),
            unit("b", &["c"]),
            unit("c", &["a"]),
            unit("d", &[]),
        ])
        .unwrap_err();

        let PlanError::CyclicDependency { cycle } = err else {
            panic!("expected a cycle, got {err:?}");
        };
        assert_eq!(cycle, vec![uid("a"), uid("b"), uid("c"), uid("a")]);
    }

    #[test]
    fn test_cycle_path_is_a_dependency_chain() {
        let err = build_graph(vec![
            unit("app", &["db"]),
            unit("db", &["network"]),
            unit("network", &["dns"]),
            unit("dns", &["db"]),
        ])
        .unwrap_err();

        let PlanError::CyclicDependency { cycle } = err else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle, vec![uid("db"), uid("network"), uid("dns"), uid("db")]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = build_graph(vec![]).unwrap();
        assert!(graph.is_empty());
    }
}
