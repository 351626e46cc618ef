//! Resource provisioners for stackrun.
//!
//! [`CommandProvisioner`] drives external commands (terragrunt/tofu wrapper
//! scripts, cloud CLIs) configured per resource type in the stack file, and
//! doubles as the readiness probe through each type's `status` command.

pub mod command;
pub mod error;

pub use command::{Action, CommandProvisioner, base_dir_for};
pub use error::CommandError;
