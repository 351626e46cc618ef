//! Stack-level settings: run options, readiness profiles and provisioner
//! commands.

use serde::{Deserialize, Serialize};
use stackrun_core::{PollSettings, ReadinessPolicy, RunOptions};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Commands used to manage one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Creates or converges the resource; prints outputs as JSON.
    pub apply: Vec<String>,
    /// Deletes the resource.
    pub destroy: Vec<String>,
    /// Reports readiness as JSON; resources are ready immediately without it.
    pub status: Option<Vec<String>>,
    /// Working directory, relative to the stack file.
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Settings declared in a stack file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub run: RunOptions,
    pub readiness: ReadinessPolicy,
    pub provisioners: BTreeMap<String, ProvisionerConfig>,
}

/// Parse a duration such as `500ms`, `10s`, `5m`, `2h` or a bare number of
/// seconds.
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| ConfigError::invalid("duration", format!("'{}' is not a duration", input)))?;

    let seconds = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::invalid("duration", format!("'{}' is too large", input)))
    };

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => seconds(60),
        "h" => seconds(3600),
        other => Err(ConfigError::invalid(
            "duration",
            format!("unknown unit '{}' in '{}'", other, input),
        )),
    }
}

/// Named readiness presets.
pub fn poll_preset(name: &str) -> ConfigResult<PollSettings> {
    match name {
        "fast" => Ok(PollSettings::fast()),
        "default" | "medium" => Ok(PollSettings::default()),
        "slow" => Ok(PollSettings::slow()),
        other => Err(ConfigError::invalid(
            "readiness preset",
            format!("unknown preset '{}', expected fast, medium or slow", other),
        )),
    }
}
