//! State persistence for stackrun.
//!
//! A stack's state records, per unit, the last known lifecycle state and the
//! outputs of its resource. It is loaded before a run to hydrate units and
//! saved after every run, including failed ones.

pub mod error;
pub mod store;

pub use error::{StateError, StateResult};
pub use store::*;
