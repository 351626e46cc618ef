//! Input resolution against dependency outputs.
//!
//! Plan mode substitutes placeholder ("mock") outputs for dependencies that
//! have not been provisioned yet, so dependents can be planned before their
//! dependencies exist. Apply mode uses real outputs only.

use stackrun_core::value::interpolate_refs;
use stackrun_core::{OutputRef, Unit, UnitId, Value, ValueMap};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::PlanError;
use crate::graph::DependencyGraph;

/// Inputs with every reference substituted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedInputs {
    pub inputs: ValueMap,
    /// References that were satisfied by a mock output.
    pub mocked: BTreeSet<OutputRef>,
}

/// A referenced output that a dependency did not produce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("output '{}' of unit '{}' is not available", .0.key, .0.unit)]
pub struct UnresolvedOutput(pub OutputRef);

/// Resolve a unit's inputs for plan mode.
///
/// A reference uses the dependency's real output when the dependency is
/// already `Ready` and produced that key, otherwise the unit's mock output
/// for it. Never touches the provisioner.
pub fn resolve_for_plan(unit: &Unit, graph: &DependencyGraph) -> Result<ResolvedInputs, PlanError> {
    let mut mocked = BTreeSet::new();

    let mut lookup = |r: &OutputRef| -> Result<Value, PlanError> {
        let real = graph
            .unit(r.unit.as_str())
            .filter(|dep| dep.state.is_ready())
            .and_then(|dep| dep.outputs.get(&r.key));
        if let Some(value) = real {
            return Ok(value.clone());
        }

        match unit.mock_outputs.get(&r.unit).and_then(|m| m.get(&r.key)) {
            Some(value) => {
                mocked.insert(r.clone());
                Ok(value.clone())
            }
            None => Err(PlanError::MissingMockOutput {
                unit: unit.id.clone(),
                dependency: r.unit.clone(),
                key: r.key.clone(),
            }),
        }
    };

    let inputs = substitute_map(&unit.inputs, &mut lookup)?;
    Ok(ResolvedInputs { inputs, mocked })
}

/// Resolve a unit's inputs from the real outputs of its dependencies.
pub fn resolve_inputs(
    unit: &Unit,
    outputs: &BTreeMap<UnitId, ValueMap>,
) -> Result<ValueMap, UnresolvedOutput> {
    substitute_map(&unit.inputs, &mut |r: &OutputRef| {
        outputs
            .get(&r.unit)
            .and_then(|o| o.get(&r.key))
            .cloned()
            .ok_or_else(|| UnresolvedOutput(r.clone()))
    })
}

fn substitute_map<E>(
    map: &ValueMap,
    lookup: &mut impl FnMut(&OutputRef) -> Result<Value, E>,
) -> Result<ValueMap, E> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), substitute(v, lookup)?)))
        .collect()
}

fn substitute<E>(
    value: &Value,
    lookup: &mut impl FnMut(&OutputRef) -> Result<Value, E>,
) -> Result<Value, E> {
    match value {
        Value::Reference(r) => lookup(r),
        Value::String(s) if value.has_refs() => Ok(Value::String(interpolate_refs(s, |r| {
            lookup(r).map(|v| v.to_interpolated())
        })?)),
        Value::List(items) => items
            .iter()
            .map(|v| substitute(v, lookup))
            .collect::<Result<Vec<_>, E>>()
            .map(Value::List),
        Value::Map(map) => substitute_map(map, lookup).map(Value::Map),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;

    fn uid(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn service() -> Unit {
        Unit::new(uid("service"), "ecs_service")
            .with_input("db_endpoint", Value::from_template("${unit.db.outputs.endpoint}"))
            .with_input(
                "database_url",
                Value::from_template("postgres://${unit.db.outputs.endpoint}:${unit.db.outputs.port}/app"),
            )
            .with_input("replicas", 2i64)
            .with_mock_output(uid("db"), "endpoint", "mock-db.local")
            .with_mock_output(uid("db"), "port", 5432i64)
    }

    #[test]
    fn test_plan_uses_mock_outputs() {
        let graph = build_graph(vec![Unit::new(uid("db"), "aws_db_instance"), service()]).unwrap();
        let resolved = resolve_for_plan(graph.unit("service").unwrap(), &graph).unwrap();

        assert_eq!(resolved.inputs["db_endpoint"], Value::from("mock-db.local"));
        assert_eq!(
            resolved.inputs["database_url"],
            Value::from("postgres://mock-db.local:5432/app")
        );
        assert_eq!(resolved.inputs["replicas"], Value::Integer(2));
        assert_eq!(resolved.mocked.len(), 2);
    }

    #[test]
    fn test_plan_prefers_real_outputs_of_ready_dependency() {
        let db = Unit::new(uid("db"), "aws_db_instance").with_outputs(ValueMap::from([(
            "endpoint".to_string(),
            Value::from("db.prod.internal"),
        )]));
        let graph = build_graph(vec![db, service()]).unwrap();
        let resolved = resolve_for_plan(graph.unit("service").unwrap(), &graph).unwrap();

        assert_eq!(resolved.inputs["db_endpoint"], Value::from("db.prod.internal"));
        // port is not among the real outputs, so the mock fills in
        assert_eq!(
            resolved.inputs["database_url"],
            Value::from("postgres://db.prod.internal:5432/app")
        );
        assert_eq!(
            resolved.mocked,
            BTreeSet::from([OutputRef::new(uid("db"), "port")])
        );
    }

    #[test]
    fn test_missing_mock_output() {
        let service = Unit::new(uid("service"), "ecs_service")
            .with_input("db_endpoint", Value::from_template("${unit.db.outputs.endpoint}"));
        let graph = build_graph(vec![Unit::new(uid("db"), "aws_db_instance"), service]).unwrap();

        let err = resolve_for_plan(graph.unit("service").unwrap(), &graph).unwrap_err();
        assert_eq!(
            err,
            PlanError::MissingMockOutput {
                unit: uid("service"),
                dependency: uid("db"),
                key: "endpoint".to_string(),
            }
        );
    }

    #[test]
    fn test_resolve_inputs_keeps_output_types() {
        let unit = Unit::new(uid("service"), "ecs_service")
            .with_input("port", Value::from_template("${unit.db.outputs.port}"))
            .with_input(
                "env",
                Value::List(vec![Value::from_template("HOST=${unit.db.outputs.host}")]),
            );
        let outputs = BTreeMap::from([(
            uid("db"),
            ValueMap::from([
                ("port".to_string(), Value::Integer(5432)),
                ("host".to_string(), Value::from("db.internal")),
            ]),
        )]);

        let inputs = resolve_inputs(&unit, &outputs).unwrap();
        assert_eq!(inputs["port"], Value::Integer(5432));
        assert_eq!(
            inputs["env"],
            Value::List(vec![Value::from("HOST=db.internal")])
        );
    }

    #[test]
    fn test_resolve_inputs_missing_key() {
        let unit = Unit::new(uid("service"), "ecs_service")
            .with_input("host", Value::from_template("${unit.db.outputs.host}"));
        let outputs = BTreeMap::from([(uid("db"), ValueMap::new())]);

        let err = resolve_inputs(&unit, &outputs).unwrap_err();
        assert_eq!(err, UnresolvedOutput(OutputRef::new(uid("db"), "host")));
        assert_eq!(err.to_string(), "output 'host' of unit 'db' is not available");
    }
}
