//! Persisted stack state, loaded before a run and saved after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::results::Results;
use crate::unit::{Unit, UnitState};
use crate::value::ValueMap;
use crate::{RunId, UnitId};

pub const STATE_VERSION: u32 = 1;

/// What is known about one unit's resource between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub state: UnitState,
    pub resource_type: String,
    #[serde(default)]
    pub outputs: ValueMap,
}

/// State of a whole stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub version: u32,
    pub stack: String,
    /// Incremented on every save.
    pub serial: u64,
    #[serde(default)]
    pub last_run: Option<RunId>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub units: BTreeMap<UnitId, UnitRecord>,
}

impl StateRecord {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            stack: stack.into(),
            serial: 0,
            last_run: None,
            updated_at: Utc::now(),
            units: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&UnitRecord> {
        self.units.get(id)
    }

    /// Copy recorded state and outputs onto the units of a stack.
    ///
    /// Units without a record are left untouched (`Pending`).
    pub fn hydrate(&self, units: &mut [Unit]) {
        for unit in units.iter_mut() {
            if let Some(record) = self.units.get(&unit.id) {
                unit.state = record.state;
                unit.outputs = record.outputs.clone();
            }
        }
    }

    /// Fold a run's results into the state.
    ///
    /// Records for units absent from the results are kept: a unit removed
    /// from the stack file may still own a live resource.
    pub fn merge(&mut self, results: &Results) {
        for (id, result) in &results.units {
            self.units.insert(
                id.clone(),
                UnitRecord {
                    state: result.state,
                    resource_type: result.resource_type.clone(),
                    outputs: result.outputs.clone(),
                },
            );
        }
        self.last_run = Some(results.run_id);
        self.updated_at = Utc::now();
    }

    /// Records that still refer to an existing resource but are not part of
    /// the given stack.
    pub fn orphans<'a>(&'a self, units: &[Unit]) -> Vec<&'a UnitId> {
        self.units
            .iter()
            .filter(|(id, record)| {
                record.state.may_exist() && !units.iter().any(|u| &u.id == *id)
            })
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::UnitResult;
    use crate::run::Direction;
    use crate::value::Value;

    fn uid(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    #[test]
    fn test_merge_then_hydrate() {
        let mut results = Results::new(Direction::Apply);
        let mut db = UnitResult::new("aws_db_instance", UnitState::Ready);
        db.outputs
            .insert("endpoint".into(), Value::from("db.internal"));
        results.units.insert(uid("db"), db);
        results
            .units
            .insert(uid("service"), UnitResult::new("ecs_service", UnitState::Pending));

        let mut state = StateRecord::new("prod");
        state.merge(&results);
        assert_eq!(state.last_run, Some(results.run_id));

        let mut units = vec![
            Unit::new(uid("db"), "aws_db_instance"),
            Unit::new(uid("service"), "ecs_service"),
            Unit::new(uid("cache"), "aws_elasticache"),
        ];
        state.hydrate(&mut units);

        assert_eq!(units[0].state, UnitState::Ready);
        assert_eq!(units[0].outputs["endpoint"], Value::from("db.internal"));
        assert_eq!(units[1].state, UnitState::Pending);
        assert_eq!(units[2].state, UnitState::Pending);
    }

    #[test]
    fn test_orphans_are_kept_and_reported() {
        let mut state = StateRecord::new("prod");
        state.units.insert(
            uid("legacy"),
            UnitRecord {
                state: UnitState::Ready,
                resource_type: "aws_s3_bucket".into(),
                outputs: ValueMap::new(),
            },
        );
        state.merge(&Results::new(Direction::Apply));

        let units = vec![Unit::new(uid("db"), "aws_db_instance")];
        assert_eq!(state.orphans(&units), vec![&uid("legacy")]);
    }
}
