//! Readiness probing: how a provisioned resource is confirmed usable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;
use crate::value::ValueMap;

/// Polling interval and wall-clock budget for a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Quick API-level resources such as DNS records (2s x 10).
    pub fn fast() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(20))
    }

    /// Slow managed services such as databases (10s x 60).
    pub fn slow() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(600))
    }

    /// Upper bound on the number of probe calls within the budget.
    pub fn max_attempts(&self) -> u64 {
        if self.interval.is_zero() {
            return u64::MAX;
        }
        (self.timeout.as_millis() / self.interval.as_millis().max(1)) as u64 + 1
    }
}

impl Default for PollSettings {
    /// 10s x 30, e.g. container services.
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(300))
    }
}

/// Poll settings by resource type with a fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    pub default: PollSettings,
    pub by_type: HashMap<String, PollSettings>,
}

impl ReadinessPolicy {
    pub fn new(default: PollSettings) -> Self {
        Self {
            default,
            by_type: HashMap::new(),
        }
    }

    pub fn with_type(mut self, resource_type: impl Into<String>, settings: PollSettings) -> Self {
        self.by_type.insert(resource_type.into(), settings);
        self
    }

    pub fn settings_for(&self, resource_type: &str) -> PollSettings {
        self.by_type
            .get(resource_type)
            .copied()
            .unwrap_or(self.default)
    }
}

/// One observation of an external resource's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    /// The resource reached a state it will never recover from
    /// (e.g. `failed`, `deleted`, `create-failed`).
    pub terminal_failure: bool,
    pub description: String,
}

impl ReadinessStatus {
    pub fn ready(description: impl Into<String>) -> Self {
        Self {
            ready: true,
            terminal_failure: false,
            description: description.into(),
        }
    }

    pub fn pending(description: impl Into<String>) -> Self {
        Self {
            ready: false,
            terminal_failure: false,
            description: description.into(),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            ready: false,
            terminal_failure: true,
            description: description.into(),
        }
    }
}

/// Status query against the external system.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Report the current status of a provisioned resource.
    async fn check(&self, resource_type: &str, outputs: &ValueMap) -> Result<ReadinessStatus>;
}

/// Probe for resources that are usable as soon as provisioning returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn check(&self, _resource_type: &str, _outputs: &ValueMap) -> Result<ReadinessStatus> {
        Ok(ReadinessStatus::ready("available"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_falls_back_to_default() {
        let policy = ReadinessPolicy::default().with_type("cloudflare_record", PollSettings::fast());
        assert_eq!(policy.settings_for("cloudflare_record"), PollSettings::fast());
        assert_eq!(policy.settings_for("aws_db_instance"), PollSettings::default());
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(PollSettings::fast().max_attempts(), 11);
        assert_eq!(PollSettings::slow().max_attempts(), 61);
    }
}
