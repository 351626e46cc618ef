//! Command provisioner errors.

use crate::command::Action;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no provisioner configured for resource type '{0}'")]
    UnknownResourceType(String),

    #[error("no {0} command configured")]
    EmptyCommand(Action),

    #[error("{action} command exited with {status}: {stderr}")]
    Failed {
        action: Action,
        status: String,
        stderr: String,
    },

    #[error("failed to parse {action} output: {message}")]
    Parse { action: Action, message: String },
}

impl CommandError {
    /// Convert to the core error matching the action that failed.
    pub fn into_core(self, action: Action) -> stackrun_core::Error {
        match self {
            CommandError::UnknownResourceType(t) => stackrun_core::Error::UnsupportedResourceType(t),
            other => match action {
                Action::Apply => stackrun_core::Error::ProvisionFailed(other.to_string()),
                Action::Destroy => stackrun_core::Error::DestroyFailed(other.to_string()),
                Action::Status => stackrun_core::Error::StatusFailed(other.to_string()),
            },
        }
    }
}
