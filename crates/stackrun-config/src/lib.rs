//! KDL configuration parsing for stackrun.
//!
//! This crate handles parsing of:
//! - Stack definitions (stack.kdl): units, inputs, dependencies, mock outputs
//! - Stack settings: run options, readiness profiles, provisioner commands
//! - Load-time variable interpolation

pub mod error;
pub mod settings;
pub mod stack;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use settings::{ProvisionerConfig, Settings, parse_duration};
pub use stack::{StackConfig, load_stack, parse_stack, parse_stack_with};
pub use variables::VariableContext;
