//! Core domain types and traits for stackrun.
//!
//! This crate contains:
//! - Unit and run identifiers
//! - The `Value` sum type and output references
//! - The unit model and its lifecycle states
//! - Provisioner and readiness probe traits
//! - Run options, per-unit results and persisted state

pub mod error;
pub mod id;
pub mod provisioner;
pub mod readiness;
pub mod results;
pub mod run;
pub mod state;
pub mod unit;
pub mod value;

pub use error::{Error, Result};
pub use id::{RunId, UnitId};
pub use provisioner::ResourceProvisioner;
pub use readiness::{AlwaysReady, PollSettings, ReadinessPolicy, ReadinessProbe, ReadinessStatus};
pub use results::{ErrorDetail, FailureKind, Results, UnitResult};
pub use run::{Direction, RunOptions};
pub use state::{StateRecord, UnitRecord};
pub use unit::{Unit, UnitState};
pub use value::{OutputRef, Value, ValueMap};
